//! Error types for pool construction.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
