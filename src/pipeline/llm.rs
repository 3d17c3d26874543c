//! Cleanup Engine: send chunks to a text-completion service and repair OCR
//! noise, degrading gracefully when the service misbehaves.
//!
//! The engine sits behind the [`CompletionClient`] seam so tests (and other
//! backends) can substitute the remote call. [`LlmCompletionClient`] adapts
//! any `edgequake-llm` provider to it.
//!
//! ## Retry Strategy
//!
//! Transient failures (network errors, 429, 5xx, timeouts, empty responses)
//! are retried with exponential backoff: `retry_backoff_ms * 2^(attempt-1)`.
//! With the 2 s default and 3 retries the wait sequence is 2 s → 4 s → 8 s.
//! Permanent failures (bad credentials, rejected request, content filter) are
//! not retried.
//!
//! ## Fallback
//!
//! Once retries are exhausted, or on a permanent failure, [`clean`] returns the
//! chunk's original text with `used_fallback = true`. It never returns an
//! error: one bad chunk must not abort a multi-hundred-page book.

use super::artifacts::normalise_completion;
use super::chunk::Chunk;
use crate::config::CleanupConfig;
use crate::debug::DebugArtifacts;
use crate::error::{classify_completion_error, CompletionError};
use crate::progress::ProgressCallback;
use crate::prompts::cleanup_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// One request to the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Instruction template.
    pub system: String,
    /// The chunk text.
    pub user: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// A successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Text-completion service seam.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Run one completion. Errors carry a retryable/permanent classification.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

/// [`CompletionClient`] over an `edgequake-llm` provider.
pub struct LlmCompletionClient {
    provider: Arc<dyn LLMProvider>,
    label: String,
    timeout: Duration,
}

impl LlmCompletionClient {
    /// `label` names the provider/model in logs, e.g. `openai/gpt-4.1-nano`.
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, api_timeout_secs: u64) -> Self {
        Self {
            provider,
            label: label.into(),
            timeout: Duration::from_secs(api_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl CompletionClient for LlmCompletionClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let messages = vec![
            ChatMessage::system(request.system.as_str()),
            ChatMessage::user_with_images(request.user.as_str(), Vec::new()),
        ];
        let options = build_options(request);

        match timeout(self.timeout, self.provider.chat(&messages, Some(&options))).await {
            Err(_) => Err(CompletionError::transient(format!(
                "completion timed out after {}s",
                self.timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(classify_completion_error(&e.to_string())),
            Ok(Ok(response)) => Ok(Completion {
                text: response.content,
                input_tokens: response.prompt_tokens,
                output_tokens: response.completion_tokens,
            }),
        }
    }
}

/// Build `CompletionOptions` from a request.
fn build_options(request: &CompletionRequest) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
        ..Default::default()
    }
}

/// Outcome of cleaning one chunk. One per [`Chunk`], same `sequence_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResult {
    pub sequence_index: usize,
    pub cleaned_text: String,
    /// The original chunk text was kept because every attempt failed.
    pub used_fallback: bool,
    /// Completion calls made, including the successful one.
    pub attempts: u32,
    /// Last failure, when `used_fallback` is set.
    pub error: Option<String>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
}

/// Build the request for one chunk.
pub fn build_request(chunk: &Chunk, config: &CleanupConfig) -> CompletionRequest {
    CompletionRequest {
        system: cleanup_prompt(config.system_prompt.as_deref()).to_string(),
        user: chunk.text.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

/// Clean one chunk. Never fails; see the module docs for the fallback rule.
pub async fn clean(
    chunk: &Chunk,
    client: &dyn CompletionClient,
    config: &CleanupConfig,
    debug_artifacts: Option<&DebugArtifacts>,
) -> CleanupResult {
    let start = Instant::now();
    let request = build_request(chunk, config);
    let idx = chunk.sequence_index;

    let mut last_err: Option<CompletionError> = None;
    let mut attempts = 0u32;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
            warn!(
                "Chunk {}: retry {}/{} after {}ms",
                idx, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }
        attempts += 1;

        if let Some(d) = debug_artifacts {
            d.record_request(idx, attempts, &request);
        }
        let outcome = client.complete(&request).await;
        if let Some(d) = debug_artifacts {
            d.record_response(idx, attempts, &outcome);
        }

        let err = match outcome {
            Ok(completion) => {
                let cleaned = normalise_completion(&completion.text);
                if cleaned.is_empty() {
                    CompletionError::transient("completion service returned empty text")
                } else {
                    debug!(
                        "Chunk {}: {} input tokens, {} output tokens, {:?}",
                        idx,
                        completion.input_tokens,
                        completion.output_tokens,
                        start.elapsed()
                    );
                    return CleanupResult {
                        sequence_index: idx,
                        cleaned_text: cleaned,
                        used_fallback: false,
                        attempts,
                        error: None,
                        input_tokens: completion.input_tokens,
                        output_tokens: completion.output_tokens,
                        duration_ms: start.elapsed().as_millis() as u64,
                    };
                }
            }
            Err(e) => e,
        };

        warn!("Chunk {}: attempt {} failed: {}", idx, attempts, err.message);
        let retryable = err.retryable;
        last_err = Some(err);
        if !retryable {
            break;
        }
    }

    let err = last_err.map(|e| e.message).unwrap_or_else(|| "Unknown error".to_string());
    warn!(
        "Chunk {}: keeping original text after {} attempt(s): {}",
        idx, attempts, err
    );
    CleanupResult {
        sequence_index: idx,
        cleaned_text: chunk.text.clone(),
        used_fallback: true,
        attempts,
        error: Some(err),
        input_tokens: 0,
        output_tokens: 0,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

/// Clean every chunk with at most `config.concurrency` calls in flight.
///
/// Results are written into a slot per sequence index, so the returned
/// vector is in chunk order whatever order the calls finish in.
pub async fn clean_all(
    chunks: &[Chunk],
    client: &dyn CompletionClient,
    config: &CleanupConfig,
    progress: Option<&ProgressCallback>,
    debug_artifacts: Option<&DebugArtifacts>,
) -> Vec<CleanupResult> {
    let total = chunks.len();
    let concurrency = config.concurrency.max(1);
    info!(
        "Cleaning {} chunks via {} (concurrency {})",
        total,
        client.name(),
        concurrency
    );

    let mut slots: Vec<Option<CleanupResult>> = vec![None; total];

    let mut results = stream::iter(chunks.iter().enumerate().map(|(pos, chunk)| async move {
        if let Some(cb) = progress {
            cb.on_chunk_start(pos, total);
        }
        let result = clean(chunk, client, config, debug_artifacts).await;
        if let Some(cb) = progress {
            cb.on_chunk_complete(pos, total, result.used_fallback);
        }
        (pos, result)
    }))
    .buffer_unordered(concurrency);

    while let Some((pos, result)) = results.next().await {
        slots[pos] = Some(result);
    }

    slots
        .into_iter()
        .zip(chunks)
        .map(|(slot, chunk)| {
            // Every position is yielded exactly once by the stream above.
            slot.unwrap_or_else(|| CleanupResult {
                sequence_index: chunk.sequence_index,
                cleaned_text: chunk.text.clone(),
                used_fallback: true,
                attempts: 0,
                error: Some("chunk was not processed".into()),
                input_tokens: 0,
                output_tokens: 0,
                duration_ms: 0,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chunk::chunk;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes, then echoes the input upper-cased.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String, CompletionError>>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<String, CompletionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let text = match next {
                Some(r) => r?,
                None => request.user.to_uppercase(),
            };
            Ok(Completion {
                text,
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    /// Sleeps longer for earlier chunks so they finish last.
    struct ReversedClient;

    #[async_trait]
    impl CompletionClient for ReversedClient {
        fn name(&self) -> &str {
            "reversed"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
            let n: u64 = request.user.trim_start_matches("Part ").trim_end_matches('.').parse().unwrap_or(0);
            sleep(Duration::from_millis(100 * (10 - n))).await;
            Ok(Completion {
                text: format!("clean {}", request.user),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    fn test_config() -> CleanupConfig {
        CleanupConfig {
            max_retries: 2,
            retry_backoff_ms: 10,
            ..Default::default()
        }
    }

    fn one_chunk(text: &str) -> Chunk {
        chunk(text, 6000).remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_normalised() {
        let client = ScriptedClient::new(vec![Ok("```\nCleaned text.\r\n```".into())]);
        let r = clean(&one_chunk("Cleaned te-\nxt."), &client, &test_config(), None).await;
        assert!(!r.used_fallback);
        assert_eq!(r.cleaned_text, "Cleaned text.");
        assert_eq!(r.attempts, 1);
        assert_eq!(r.input_tokens, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::transient("429 rate limit")),
            Ok(String::new()),
        ]);
        let r = clean(&one_chunk("abc"), &client, &test_config(), None).await;
        assert!(!r.used_fallback);
        assert_eq!(r.cleaned_text, "ABC");
        assert_eq!(r.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_original() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::transient("503")),
            Err(CompletionError::transient("503")),
            Err(CompletionError::transient("503 again")),
        ]);
        let c = one_chunk("Original chunk text.");
        let r = clean(&c, &client, &test_config(), None).await;
        assert!(r.used_fallback);
        assert_eq!(r.cleaned_text, c.text);
        assert_eq!(r.attempts, 3);
        assert_eq!(r.error.as_deref(), Some("503 again"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_skips_retries() {
        let client = ScriptedClient::new(vec![Err(CompletionError::permanent("401 Unauthorized"))]);
        let r = clean(&one_chunk("text"), &client, &test_config(), None).await;
        assert!(r.used_fallback);
        assert_eq!(r.attempts, 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_chunk_order_under_concurrency() {
        let text = (0..6).map(|i| format!("Part {i}.")).collect::<Vec<_>>().join("\n\n");
        let chunks = chunk(&text, 100);
        let config = CleanupConfig {
            concurrency: 4,
            ..test_config()
        };
        let results = clean_all(&chunks, &ReversedClient, &config, None, None).await;
        assert_eq!(results.len(), 6);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.sequence_index, i);
            assert_eq!(r.cleaned_text, format!("clean Part {i}."));
        }
    }

    #[test]
    fn request_uses_override_prompt() {
        let config = CleanupConfig {
            system_prompt: Some("Fix it.".into()),
            ..Default::default()
        };
        let req = build_request(&one_chunk("x"), &config);
        assert_eq!(req.system, "Fix it.");
        assert_eq!(req.max_tokens, 4000);
        let opts = build_options(&req);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4000));
    }
}
