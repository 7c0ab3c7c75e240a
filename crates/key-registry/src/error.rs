//! Error types for registry operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

pub type Result<T> = std::result::Result<T, Error>;
