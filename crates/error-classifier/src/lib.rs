//! Unified error taxonomy shared by the valid-key-pool's verification path
//! and the stream retry engine.
//!
//! Every upstream failure is classified into an `ErrorKind` plus the
//! `KeyAction` the caller should take against the credential that produced
//! it. Classification is driven entirely by the structured `(status, model)`
//! pair, never by matching against a formatted exception string or body.

use serde::Serialize;

/// Broad category of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimit,
    AuthError,
    ClientError,
    ServerError,
    ServiceUnavailable,
    TimeoutError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

/// Action the caller must take against the credential that produced the
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAction {
    /// Cool the (key, model) pair down until the next quota reset.
    CoolDownModel,
    /// Mark the key permanently failed, remove from registry + pool.
    MarkFailed,
    /// Increment the key's failure count and evict from the pool; the
    /// registry keeps the key until its failure count saturates.
    DecrementAndEvict,
    /// Count the failure only; no pool/registry mutation beyond that.
    CountOnly,
}

/// Result of classifying one upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub key_action: KeyAction,
}

/// Classify a 429: a known model is cooled down (and evicted from the
/// pool); an unknown model has no cooldown target, so the key is marked
/// failed instead.
fn classify_429(model: Option<&str>) -> Classification {
    if model.is_some() {
        Classification {
            kind: ErrorKind::RateLimit,
            key_action: KeyAction::CoolDownModel,
        }
    } else {
        Classification {
            kind: ErrorKind::RateLimit,
            key_action: KeyAction::MarkFailed,
        }
    }
}

/// Classify an upstream HTTP failure by status code and the model it
/// targeted, if any.
///
/// Rules are applied in the order given in the mapping table: 429 first
/// (dispatches to `classify_429`), then the fixed per-status mappings, with
/// an `Unknown`/`CountOnly` fallback for anything unrecognized.
pub fn classify(status: u16, model: Option<&str>) -> Classification {
    match status {
        429 => classify_429(model),
        401 | 403 => Classification {
            kind: ErrorKind::AuthError,
            key_action: KeyAction::MarkFailed,
        },
        400 | 404 | 422 => Classification {
            kind: ErrorKind::ClientError,
            key_action: KeyAction::MarkFailed,
        },
        408 => Classification {
            kind: ErrorKind::TimeoutError,
            key_action: KeyAction::DecrementAndEvict,
        },
        500 | 502 | 504 => Classification {
            kind: ErrorKind::ServerError,
            key_action: KeyAction::DecrementAndEvict,
        },
        503 => Classification {
            kind: ErrorKind::ServiceUnavailable,
            key_action: KeyAction::DecrementAndEvict,
        },
        _ => Classification {
            kind: ErrorKind::Unknown,
            key_action: KeyAction::CountOnly,
        },
    }
}

/// Classify a transport-level failure (no HTTP status available): a timed
/// out request maps like a 408, anything else counts only.
pub fn classify_transport(timed_out: bool) -> Classification {
    if timed_out {
        Classification {
            kind: ErrorKind::TimeoutError,
            key_action: KeyAction::DecrementAndEvict,
        }
    } else {
        Classification {
            kind: ErrorKind::Unknown,
            key_action: KeyAction::CountOnly,
        }
    }
}
