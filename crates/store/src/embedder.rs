//! Embedding through an LLM provider, with an explicit retry policy.
//!
//! Embedding endpoints rate-limit aggressively during index builds. Calls
//! are paced, retried with capped exponential backoff, and a provider's
//! `retry-after` hint takes precedence over the computed delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use routeqa_core::error::{ProviderError, StoreError};
use routeqa_core::provider::EmbeddingRequest;
use routeqa_core::{Embedder, Provider};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How embedding calls are retried and spaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Minimum gap between the start of consecutive calls.
    pub pacing: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(30),
            pacing: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no pacing, for interactive query embedding.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            pacing: Duration::ZERO,
        }
    }

    pub fn from_millis(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64, pacing_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            pacing: Duration::from_millis(pacing_ms),
        }
    }

    /// Delay before retry number `retry_index` (0-based): initial, then doubling, capped.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let cap = self.max_backoff.max(self.initial_backoff);
        let factor = 1u32.checked_shl(retry_index.min(20)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(cap)
    }
}

/// Whether a provider failure is worth another attempt.
fn is_transient(err: &ProviderError) -> bool {
    match err {
        ProviderError::RateLimited { .. } | ProviderError::Timeout(_) | ProviderError::Network(_) => true,
        ProviderError::ApiError { status_code, .. } => *status_code >= 500,
        _ => false,
    }
}

/// An [`Embedder`] backed by a [`Provider`]'s embedding endpoint.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
    policy: RetryPolicy,
    last_call: Mutex<Option<Instant>>,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            policy: RetryPolicy::default(),
            last_call: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sleep until `pacing` has passed since the previous call started.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.policy.pacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 0;
        loop {
            self.pace().await;
            attempt += 1;

            let request = EmbeddingRequest {
                model: self.model.clone(),
                inputs: texts.to_vec(),
            };
            let err = match self.provider.embed(request).await {
                Ok(response) => {
                    debug!(model = %self.model, count = texts.len(), attempt, "Embedded batch");
                    return Ok(response.embeddings);
                }
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts || !is_transient(&err) {
                return Err(StoreError::EmbeddingFailed(format!(
                    "{err} (after {attempt} attempt(s))"
                )));
            }

            let delay = match &err {
                ProviderError::RateLimited { retry_after_secs } => {
                    Duration::from_secs(*retry_after_secs).max(self.policy.backoff(attempt - 1))
                }
                _ => self.policy.backoff(attempt - 1),
            };
            warn!(
                model = %self.model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Embedding call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
