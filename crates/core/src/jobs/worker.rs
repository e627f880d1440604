use super::{Job, JobError, JobRegistry, JobStatus, JobStore};
use crate::config::{JobsConfig, MAX_BACKOFF_CEILING_SECS};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Limits of a single batch. `max_runtime` must stay below the host's
/// request timeout: it is checked before each claim, never mid-job.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Queues to drain. `None` means every registered queue.
    pub queues: Option<Vec<String>>,
    pub max_jobs: usize,
    pub max_runtime: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Jobs claimed and executed. `processed == completed + failed`.
    pub processed: usize,
    pub completed: usize,
    /// Executions that errored, whether re-queued or not.
    pub failed: usize,
    /// Subset of `failed` that went back to the queue.
    pub retried: usize,
    pub duration_ms: u64,
}

/// Exponential retry delay with up to 10% jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponential = 2u64.saturating_pow(attempt - 1);
        let capped = self
            .base_secs
            .saturating_mul(exponential)
            .min(self.max_secs)
            .min(MAX_BACKOFF_CEILING_SECS);
        let jitter = rand::random::<f64>() * capped as f64 * 0.1;
        Duration::from_secs_f64(capped as f64 + jitter)
    }
}

pub struct Worker {
    id: String,
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    backoff: Backoff,
    lock_timeout: Duration,
}

impl Worker {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<dyn JobStore>, config: &JobsConfig) -> Self {
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4()),
            registry,
            store,
            backoff: Backoff {
                base_secs: config.backoff_base_secs,
                max_secs: config.max_backoff_secs,
            },
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run jobs until `max_jobs` ran, the queues are drained, or
    /// `max_runtime` elapsed. A short batch is a normal outcome.
    pub async fn process_batch(&self, options: BatchOptions) -> Result<BatchReport, JobError> {
        let started = Instant::now();
        let mut report = BatchReport::default();

        let now = Utc::now();
        let lock_timeout =
            chrono::Duration::from_std(self.lock_timeout).unwrap_or(chrono::Duration::zero());
        let cutoff = now - lock_timeout;
        let released = self.store.release_stale(cutoff, now).await?;
        if released > 0 {
            tracing::warn!(worker = %self.id, released, "Released jobs with expired locks");
        }

        let queues = options.queues.unwrap_or_else(|| self.registry.queues());

        while report.processed < options.max_jobs {
            if started.elapsed() >= options.max_runtime {
                tracing::info!(
                    worker = %self.id,
                    processed = report.processed,
                    "Batch deadline reached, stopping before next claim"
                );
                break;
            }

            let Some(job) = self.store.claim_next(&queues, &self.id, Utc::now()).await? else {
                break;
            };
            report.processed += 1;

            match self.run(&job).await {
                Ok(result) => {
                    match self.store.complete(job.id, &self.id, result, Utc::now()).await {
                        Ok(_) => {
                            report.completed += 1;
                            tracing::info!(job = %job.name, job_id = %job.id, "Job completed");
                        }
                        Err(e) => {
                            // Lock was lost; stale recovery will requeue it
                            report.failed += 1;
                            tracing::error!(job_id = %job.id, "Failed to mark job done: {e}");
                        }
                    }
                }
                Err(error) => {
                    report.failed += 1;
                    if self.record_failure(&job, &error, Utc::now()).await {
                        report.retried += 1;
                    }
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            worker = %self.id,
            processed = report.processed,
            completed = report.completed,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Batch finished"
        );
        Ok(report)
    }

    async fn run(&self, job: &Job) -> Result<serde_json::Value, String> {
        let Some(handler) = self.registry.handler(&job.name) else {
            return Err(format!("no handler registered for '{}'", job.name));
        };
        match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err("job handler panicked".to_string()),
        }
    }

    /// Returns true when the job was re-queued.
    async fn record_failure(&self, job: &Job, error: &str, now: DateTime<Utc>) -> bool {
        let attempt = job.attempt + 1;
        let retry_at = (attempt < job.max_attempts).then(|| {
            let delay = chrono::Duration::from_std(self.backoff.delay(attempt))
                .unwrap_or(chrono::Duration::zero());
            now.checked_add_signed(delay).unwrap_or(now)
        });

        match self
            .store
            .record_failure(job.id, &self.id, error, retry_at, now)
            .await
        {
            Ok(updated) if updated.status == JobStatus::Queued => {
                tracing::warn!(
                    job = %job.name,
                    job_id = %job.id,
                    attempt,
                    max_attempts = job.max_attempts,
                    retry_at = %updated.run_at,
                    "Job failed, retrying: {error}"
                );
                true
            }
            Ok(_) => {
                tracing::error!(
                    job = %job.name,
                    job_id = %job.id,
                    attempt,
                    "Job failed permanently: {error}"
                );
                false
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, "Failed to record job failure: {e}");
                false
            }
        }
    }
}
