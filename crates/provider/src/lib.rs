//! Upstream contract: the one HTTP client the rest of the workspace talks
//! to the generative content API through.
//!
//! Neither the key pool nor the retry engine hold a `reqwest::Client`
//! directly — they depend on the `valid_key_pool::Verifier` and
//! `stream_retry::RetrySource` traits respectively, and `GeminiClient`
//! here is the concrete implementation the binary wires in at startup.

pub mod client;
pub mod error;

pub use client::GeminiClient;
pub use error::{Error, Result};
