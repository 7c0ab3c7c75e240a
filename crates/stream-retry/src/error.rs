//! Error types for retry transport failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("retry request failed: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
