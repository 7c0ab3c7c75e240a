//! Stream Retry Engine: recovers mid-stream SSE aborts by reconstructing the
//! conversation prefix and re-issuing the request, splicing the recovered
//! tail back onto the client-visible stream.
//!
//! A stream only ever "completes" from the caller's point of view once it
//! reaches a clean `STOP`/`MAX_TOKENS` finish reason with well-formed
//! trailing punctuation; anything else (a block, an abnormal finish, a
//! finish reason landing mid-thought, a bare connection drop) triggers a
//! bounded number of retries against the same credential before giving up
//! with a terminal `event: error` frame.

pub mod error;

pub use error::{Error, Result};

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Punctuation that makes a finish reason of `STOP` acceptable as complete.
const FINAL_PUNCTUATION: &[char] = &[
    '.', '?', '!', '。', '？', '！', '}', ']', ')', '"', '\'', '\u{201d}', '\u{2019}', '`', '\n',
];

/// Boxed byte stream from the upstream HTTP client (the initial response
/// body, or a retry response body).
pub type BoxByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Why a stream attempt was judged incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionReason {
    /// A finish reason arrived while still inside a "thought" chunk.
    FinishDuringThought,
    /// The response contained a block reason.
    Block,
    /// Finished with `STOP` but the trailing text doesn't look complete.
    FinishIncomplete,
    /// Finished with something other than `STOP`/`MAX_TOKENS`.
    FinishAbnormal,
    /// The stream ended with no finish reason at all.
    Drop,
    /// The underlying transport errored mid-stream.
    FetchError,
}

/// Reissues the upstream request for a retry attempt, with the
/// conversation prefix reconstructed from everything that was accumulated
/// before the interruption.
pub trait RetrySource: Send + Sync {
    fn retry<'a>(
        &'a self,
        model: &'a str,
        key: &'a str,
        body: &'a Value,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<BoxByteStream>> + Send + 'a>>;
}

/// Retry policy for one streamed request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub swallow_thoughts: bool,
}

#[derive(Default)]
struct SessionState {
    accumulated_text: String,
    is_outputting_formal_text: bool,
    swallow_mode_active: bool,
}

#[derive(Debug)]
enum LineEffect {
    Continue,
    Retry(InterruptionReason),
    Clean,
}

enum StreamOutcome {
    Clean,
    Interrupted(InterruptionReason),
}

fn is_data_line(line: &str) -> bool {
    line.starts_with("data: ")
}

fn is_blocked_line(line: &str) -> bool {
    line.contains("blockReason")
}

fn extract_finish_reason(line: &str) -> Option<String> {
    if !line.contains("finishReason") {
        return None;
    }
    let idx = line.find('{')?;
    let value: Value = serde_json::from_str(&line[idx..]).ok()?;
    value
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Default)]
struct LineContent {
    text: String,
    is_thought: bool,
}

fn parse_line_content(line: &str) -> LineContent {
    let Some(idx) = line.find('{') else {
        return LineContent::default();
    };
    let Ok(value) = serde_json::from_str::<Value>(&line[idx..]) else {
        return LineContent::default();
    };
    let Some(part) = value.pointer("/candidates/0/content/parts/0") else {
        return LineContent::default();
    };
    LineContent {
        text: part
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_thought: part.get("thought").and_then(Value::as_bool).unwrap_or(false),
    }
}

/// Reconstruct the request body for a retry: the accumulated text so far is
/// inserted as a model turn immediately after the last user turn, followed
/// by an instruction to continue without repeating itself.
fn build_retry_request_body(original: &Value, accumulated_text: &str) -> Value {
    let mut retry_body = original.clone();
    let Some(obj) = retry_body.as_object_mut() else {
        return retry_body;
    };
    let contents = obj
        .entry("contents")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(arr) = contents.as_array_mut() else {
        return retry_body;
    };

    let last_user_index = arr
        .iter()
        .rposition(|c| c.get("role").and_then(Value::as_str) == Some("user"));

    let history = vec![
        json!({"role": "model", "parts": [{"text": accumulated_text}]}),
        json!({
            "role": "user",
            "parts": [{"text": "Continue exactly where you left off without any preamble or repetition."}]
        }),
    ];

    match last_user_index {
        Some(idx) => {
            for (offset, item) in history.into_iter().enumerate() {
                arr.insert(idx + 1 + offset, item);
            }
        }
        None => arr.extend(history),
    }

    retry_body
}

fn ends_with_final_punctuation(text: &str) -> bool {
    let trimmed = text.trim_end();
    trimmed.is_empty() || trimmed.chars().last().is_some_and(|c| FINAL_PUNCTUATION.contains(&c))
}

async fn handle_line(line: &str, state: &mut SessionState, tx: &mpsc::Sender<Bytes>) -> LineEffect {
    let content = if is_data_line(line) {
        parse_line_content(line)
    } else {
        LineContent::default()
    };

    if state.swallow_mode_active {
        if content.is_thought {
            if extract_finish_reason(line).is_some() {
                warn!("finish reason arrived while swallowing a thought chunk");
                return LineEffect::Retry(InterruptionReason::FinishDuringThought);
            }
            return LineEffect::Continue;
        }
        info!("first formal text chunk after swallowing, resuming normal stream");
        state.swallow_mode_active = false;
    }

    let finish_reason = extract_finish_reason(line);

    let needs_retry = if finish_reason.is_some() && content.is_thought {
        Some(InterruptionReason::FinishDuringThought)
    } else if is_blocked_line(line) {
        Some(InterruptionReason::Block)
    } else if finish_reason.as_deref() == Some("STOP") {
        let candidate = format!("{}{}", state.accumulated_text, content.text);
        if ends_with_final_punctuation(&candidate) {
            None
        } else {
            Some(InterruptionReason::FinishIncomplete)
        }
    } else if let Some(fr) = finish_reason.as_deref() {
        if fr != "MAX_TOKENS" {
            Some(InterruptionReason::FinishAbnormal)
        } else {
            None
        }
    } else {
        None
    };

    if let Some(reason) = needs_retry {
        return LineEffect::Retry(reason);
    }

    if tx.send(Bytes::from(format!("{line}\n\n"))).await.is_err() {
        // Receiver gone (client disconnected) — nothing left to retry for.
        return LineEffect::Clean;
    }

    if !content.text.is_empty() && !content.is_thought {
        state.is_outputting_formal_text = true;
        state.accumulated_text.push_str(&content.text);
    }

    if matches!(finish_reason.as_deref(), Some("STOP") | Some("MAX_TOKENS")) {
        LineEffect::Clean
    } else {
        LineEffect::Continue
    }
}

/// Buffer bytes into complete lines and feed each to `handle_line`, in the
/// same incremental fashion the upstream SSE body arrives in.
async fn consume_stream(
    mut stream: BoxByteStream,
    state: &mut SessionState,
    tx: &mpsc::Sender<Bytes>,
) -> StreamOutcome {
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(bytes) => bytes,
            Err(_) => return StreamOutcome::Interrupted(InterruptionReason::FetchError),
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let raw_line = buffer[..pos].to_string();
            buffer.drain(..=pos);
            let line = raw_line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match handle_line(line, state, tx).await {
                LineEffect::Continue => {}
                LineEffect::Retry(reason) => return StreamOutcome::Interrupted(reason),
                LineEffect::Clean => return StreamOutcome::Clean,
            }
        }
    }

    let trailing = buffer.trim().to_string();
    if !trailing.is_empty() {
        match handle_line(&trailing, state, tx).await {
            LineEffect::Continue => {}
            LineEffect::Retry(reason) => return StreamOutcome::Interrupted(reason),
            LineEffect::Clean => return StreamOutcome::Clean,
        }
    }

    StreamOutcome::Interrupted(InterruptionReason::Drop)
}

async fn run_session(
    initial: BoxByteStream,
    original_body: Value,
    model: String,
    key: String,
    source: Arc<dyn RetrySource>,
    config: RetryConfig,
    tx: mpsc::Sender<Bytes>,
) {
    let mut state = SessionState::default();
    let mut current = initial;
    let mut retries = 0u32;

    loop {
        let outcome = consume_stream(current, &mut state, &tx).await;

        let interruption = match outcome {
            StreamOutcome::Clean => {
                if state.accumulated_text.is_empty()
                    || ends_with_final_punctuation(&state.accumulated_text)
                {
                    info!(retries, "stream completed successfully");
                    return;
                }
                warn!("clean finish but trailing text looks incomplete, retrying");
                InterruptionReason::FinishIncomplete
            }
            StreamOutcome::Interrupted(reason) => reason,
        };

        warn!(?interruption, retries, "stream interrupted");

        if config.swallow_thoughts && state.is_outputting_formal_text {
            state.swallow_mode_active = true;
        }

        if retries >= config.max_retries {
            let payload = json!({
                "error": {
                    "code": 504,
                    "status": "DEADLINE_EXCEEDED",
                    "message": format!(
                        "retry limit ({}) exceeded, last reason: {:?}",
                        config.max_retries, interruption
                    ),
                    "details": [{
                        "@type": "proxy.debug",
                        "accumulated_text_chars": state.accumulated_text.len(),
                    }],
                }
            });
            let _ = tx
                .send(Bytes::from(format!("event: error\ndata: {payload}\n\n")))
                .await;
            return;
        }

        retries += 1;
        let retry_body = build_retry_request_body(&original_body, &state.accumulated_text);

        current = match source.retry(&model, &key, &retry_body).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "retry request itself failed, backing off");
                tokio::time::sleep(config.retry_delay).await;
                // No new stream to read from — loop back around with an
                // already-exhausted one so the next pass immediately
                // re-evaluates and spends another retry rather than
                // spinning without the backoff delay.
                Box::pin(futures_util::stream::empty())
            }
        };
    }
}

/// Drive a streamed request to completion, retrying mid-stream aborts
/// up to `config.max_retries` times. Returns a stream of SSE-framed bytes
/// the caller can forward directly to the client; a terminal
/// `event: error` frame is emitted if retries are exhausted.
pub fn drive(
    initial: BoxByteStream,
    original_body: Value,
    model: String,
    key: String,
    source: Arc<dyn RetrySource>,
    config: RetryConfig,
) -> impl Stream<Item = Bytes> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run_session(initial, original_body, model, key, source, config, tx));
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn byte_stream(chunks: Vec<&'static str>) -> BoxByteStream {
        Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from(c))),
        ))
    }

    fn data_line(text: &str, is_thought: bool, finish_reason: Option<&str>) -> String {
        let mut part = json!({"text": text});
        if is_thought {
            part["thought"] = json!(true);
        }
        let mut candidate = json!({"content": {"parts": [part]}});
        if let Some(fr) = finish_reason {
            candidate["finishReason"] = json!(fr);
        }
        format!("data: {}", json!({"candidates": [candidate]}))
    }

    #[test]
    fn extract_finish_reason_finds_value() {
        let line = data_line("hello", false, Some("STOP"));
        assert_eq!(extract_finish_reason(&line).as_deref(), Some("STOP"));
    }

    #[test]
    fn extract_finish_reason_absent_returns_none() {
        let line = data_line("hello", false, None);
        assert_eq!(extract_finish_reason(&line), None);
    }

    #[test]
    fn parse_line_content_extracts_text_and_thought_flag() {
        let line = data_line("partial", true, None);
        let content = parse_line_content(&line);
        assert_eq!(content.text, "partial");
        assert!(content.is_thought);
    }

    #[test]
    fn is_blocked_line_detects_block_reason() {
        assert!(is_blocked_line(r#"data: {"promptFeedback":{"blockReason":"SAFETY"}}"#));
        assert!(!is_blocked_line(&data_line("fine", false, None)));
    }

    #[test]
    fn build_retry_request_body_inserts_after_last_user_turn() {
        let original = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "partial answer"}]},
            ]
        });
        let retry = build_retry_request_body(&original, "partial answer");
        let contents = retry["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "partial answer");
        assert_eq!(contents[2]["role"], "user");
    }

    #[test]
    fn build_retry_request_body_appends_when_no_user_turn() {
        let original = json!({"contents": []});
        let retry = build_retry_request_body(&original, "text so far");
        assert_eq!(retry["contents"].as_array().unwrap().len(), 2);
    }

    struct ScriptedSource {
        attempts: AtomicUsize,
        scripts: Vec<Vec<&'static str>>,
    }

    impl RetrySource for ScriptedSource {
        fn retry<'a>(
            &'a self,
            _model: &'a str,
            _key: &'a str,
            _body: &'a Value,
        ) -> Pin<Box<dyn std::future::Future<Output = Result<BoxByteStream>> + Send + 'a>> {
            Box::pin(async move {
                let idx = self.attempts.fetch_add(1, Ordering::SeqCst);
                match self.scripts.get(idx) {
                    Some(chunks) => Ok(byte_stream(chunks.clone())),
                    None => Ok(byte_stream(vec![])),
                }
            })
        }
    }

    async fn collect(stream: impl Stream<Item = Bytes>) -> String {
        let chunks: Vec<Bytes> = stream.collect().await;
        chunks.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect()
    }

    #[tokio::test]
    async fn clean_stop_with_punctuation_completes_without_retry() {
        let line = format!("{}\n", data_line("All done.", false, Some("STOP")));
        let initial = byte_stream(vec![Box::leak(line.into_boxed_str())]);
        let source = Arc::new(ScriptedSource {
            attempts: AtomicUsize::new(0),
            scripts: vec![],
        });
        let out = drive(
            initial,
            json!({"contents": []}),
            "gemini-test".into(),
            "key-a".into(),
            source.clone(),
            RetryConfig {
                max_retries: 2,
                retry_delay: Duration::from_millis(1),
                swallow_thoughts: false,
            },
        );
        let output = collect(out).await;
        assert!(output.contains("All done."));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn incomplete_stop_triggers_one_retry_then_completes() {
        let first = format!("{}\n", data_line("mid-sentence", false, Some("STOP")));
        let retry = format!("{}\n", data_line(" continues.", false, Some("STOP")));
        let initial = byte_stream(vec![Box::leak(first.into_boxed_str())]);
        let source = Arc::new(ScriptedSource {
            attempts: AtomicUsize::new(0),
            scripts: vec![vec![Box::leak(retry.into_boxed_str())]],
        });
        let out = drive(
            initial,
            json!({"contents": []}),
            "gemini-test".into(),
            "key-a".into(),
            source.clone(),
            RetryConfig {
                max_retries: 3,
                retry_delay: Duration::from_millis(1),
                swallow_thoughts: false,
            },
        );
        let output = collect(out).await;
        assert!(output.contains("continues."));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_emits_deadline_exceeded() {
        let bad = format!("{}\n", data_line("nope", false, Some("SAFETY")));
        let initial = byte_stream(vec![Box::leak(bad.clone().into_boxed_str())]);
        let source = Arc::new(ScriptedSource {
            attempts: AtomicUsize::new(0),
            scripts: vec![
                vec![Box::leak(bad.clone().into_boxed_str())],
                vec![Box::leak(bad.into_boxed_str())],
            ],
        });
        let out = drive(
            initial,
            json!({"contents": []}),
            "gemini-test".into(),
            "key-a".into(),
            source,
            RetryConfig {
                max_retries: 2,
                retry_delay: Duration::from_millis(1),
                swallow_thoughts: false,
            },
        );
        let output = collect(out).await;
        assert!(output.contains("DEADLINE_EXCEEDED"));
    }

    #[tokio::test]
    async fn bare_drop_with_no_finish_reason_retries() {
        let initial = byte_stream(vec![]);
        let retry_line = format!("{}\n", data_line("recovered", false, Some("STOP")));
        let source = Arc::new(ScriptedSource {
            attempts: AtomicUsize::new(0),
            scripts: vec![vec![Box::leak(retry_line.into_boxed_str())]],
        });
        let out = drive(
            initial,
            json!({"contents": []}),
            "gemini-test".into(),
            "key-a".into(),
            source.clone(),
            RetryConfig {
                max_retries: 2,
                retry_delay: Duration::from_millis(1),
                swallow_thoughts: false,
            },
        );
        let output = collect(out).await;
        assert!(output.contains("recovered"));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 1);
    }
}
