//! Errors from constructing or invoking the upstream HTTP client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid upstream base url: {0}")]
    InvalidBaseUrl(String),

    #[error("upstream request failed: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
