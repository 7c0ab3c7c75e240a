//! HTTP client for the upstream generative content API.
//!
//! One struct plays two roles against the same base client: it is the
//! `stream_retry::RetrySource` the retry engine calls back into when a
//! stream needs reissuing with a reconstructed prefix, and the
//! `valid_key_pool::Verifier` the pool uses to probe a candidate
//! credential before admitting it into the working set. Both are the same
//! kind of call — `model:streamGenerateContent` for the former, a minimal
//! non-streaming `model:generateContent` probe for the latter.

use std::future::Future;
use std::pin::Pin;

use futures_util::TryStreamExt;
use serde_json::{json, Value};
use stream_retry::{BoxByteStream, RetrySource};
use tracing::{debug, warn};
use valid_key_pool::{VerifyOutcome, Verifier};

use crate::error::Error;

/// Talks to the upstream generative content API on behalf of both the
/// initial client request and the stream retry engine's continuations.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> crate::Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(Error::InvalidBaseUrl(base_url));
        }
        Ok(Self { http, base_url })
    }

    fn stream_url(&self, model: &str, key: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:streamGenerateContent?key={key}&alt=sse",
            self.base_url
        )
    }

    fn generate_url(&self, model: &str, key: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:generateContent?key={key}",
            self.base_url
        )
    }

    /// Issue a single non-streaming generate call, returning the upstream
    /// status and raw response body untouched. Used by the client-facing
    /// handler for requests that didn't ask for a streamed response; retry
    /// across keys on failure is the handler's responsibility, not this
    /// client's.
    pub async fn generate(
        &self,
        model: &str,
        key: &str,
        body: &Value,
    ) -> crate::Result<(u16, bytes::Bytes)> {
        let response = self
            .http
            .post(self.generate_url(model, key))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok((status, bytes))
    }
}

impl RetrySource for GeminiClient {
    fn retry<'a>(
        &'a self,
        model: &'a str,
        key: &'a str,
        body: &'a Value,
    ) -> Pin<Box<dyn Future<Output = stream_retry::Result<BoxByteStream>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .http
                .post(self.stream_url(model, key))
                .json(body)
                .send()
                .await
                .map_err(|e| stream_retry::Error::Transport(e.to_string()))?;

            let response = response
                .error_for_status()
                .map_err(|e| stream_retry::Error::Transport(e.to_string()))?;

            let byte_stream = response
                .bytes_stream()
                .map_err(std::io::Error::other);

            Ok(Box::pin(byte_stream) as BoxByteStream)
        })
    }
}

impl Verifier for GeminiClient {
    fn verify<'a>(
        &'a self,
        key: &'a str,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = VerifyOutcome> + Send + 'a>> {
        Box::pin(async move {
            let probe = json!({
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
                "generationConfig": {"maxOutputTokens": 1},
            });

            let response = match self
                .http
                .post(self.generate_url(model, key))
                .json(&probe)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "verification request failed before a response arrived");
                    return VerifyOutcome::Failure {
                        status: 0,
                        body: e.to_string(),
                    };
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                debug!(model, "key verified");
                return VerifyOutcome::Success;
            }

            let body = response.text().await.unwrap_or_default();
            VerifyOutcome::Failure { status, body }
        })
    }
}
