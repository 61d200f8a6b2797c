//! Batched, bounded-concurrency client for the external embedding endpoint
//!
//! Wire format: POST `{model, input: [string]}` returning
//! `{data: [{embedding: [float]}]}`. Output order always matches input
//! order. A process-wide semaphore bounds in-flight batches; it is
//! injected as a handle so tests can substitute a deterministic stub for
//! the whole client. Transport errors, timeouts and 5xx retry with
//! jittered exponential backoff; 4xx is fatal for the batch.

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Seam between the pipeline and the embedding service
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order
    ///
    /// Every transient attempt failure (transport error, timeout, 5xx)
    /// bumps `transient_failures`, whether or not a retry follows, so the
    /// per-project status counters see individual attempts.
    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        transient_failures: &AtomicU64,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Model identifier recorded with every stored embedding
    fn model_id(&self) -> &str;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Production client over HTTP
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    endpoint: String,
    in_flight: Arc<Semaphore>,
}

impl HttpEmbedder {
    /// `in_flight` is the process-wide batch semaphore shared across
    /// every project's pipeline.
    pub fn new(config: EmbeddingConfig, in_flight: Arc<Semaphore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .unwrap_or_default();
        let endpoint = format!("{}/v1/embeddings", config.base_url.trim_end_matches('/'));
        Self {
            client,
            config,
            endpoint,
            in_flight,
        }
    }

    async fn call_endpoint(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout(self.config.request_timeout)
                } else {
                    EmbeddingError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Transport(format!("invalid response body: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: parsed.data.len(),
            });
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// One batch with retry; holds an in-flight permit across each attempt
    async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        transient_failures: &AtomicU64,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let max_attempts = self.config.retry.max_attempts;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(EmbeddingError::Cancelled);
            }

            let _permit = tokio::select! {
                permit = self.in_flight.clone().acquire_owned() => {
                    permit.map_err(|_| EmbeddingError::Transport("semaphore closed".to_string()))?
                }
                _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
            };

            let result = tokio::select! {
                result = self.call_endpoint(texts) => result,
                _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
            };

            match result {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    transient_failures.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(self.config.retry.base_delay_ms, attempt);
                    tracing::warn!(
                        "Embedding attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Embedding failed after {} attempts: {}", max_attempts, e);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EmbeddingError::RetriesExhausted(max_attempts))
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        transient_failures: &AtomicU64,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // batches run concurrently up to the semaphore bound; collecting
        // by position keeps outputs in input order
        let batches: Vec<&[String]> = texts.chunks(self.config.batch_size).collect();
        let futures = batches
            .iter()
            .map(|batch| self.embed_batch(batch, cancel, transient_failures));
        let results = futures::future::try_join_all(futures).await?;

        Ok(results.into_iter().flatten().collect())
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}

fn classify_status(status: StatusCode, body: String) -> EmbeddingError {
    if status.is_server_error() {
        EmbeddingError::ServerError {
            status: status.as_u16(),
            body,
        }
    } else {
        EmbeddingError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

/// Exponential backoff with uniform jitter over the final step
fn backoff_delay(base_ms: u64, attempt: usize) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt.min(10) - 1));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}
