use super::store::InsertOutcome;
use super::{Job, JobError, JobRegistry, JobStatus, JobStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Longest accepted `delay_secs` (one year).
pub const MAX_DELAY_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOptions {
    /// Overrides the registered queue.
    pub queue: Option<String>,
    /// Seconds from now before the job becomes runnable.
    pub delay_secs: Option<u64>,
    /// Explicit availability time. Takes precedence over `delay_secs`.
    pub available_at: Option<DateTime<Utc>>,
    /// Overrides the registered priority.
    pub priority: Option<i32>,
    /// Idempotency token. A second dispatch while a job holding the key is
    /// still pending is a no-op.
    pub dedup_key: Option<String>,
}

/// Typed dispatch result. A duplicate is a successful no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Queued {
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },
    Duplicate {
        #[serde(rename = "existingJobId")]
        existing_job_id: Uuid,
    },
}

impl DispatchOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<dyn JobStore>) -> Self {
        Self { registry, store }
    }

    pub async fn dispatch(
        &self,
        name: &str,
        payload: Value,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome, JobError> {
        self.dispatch_at(name, payload, options, Utc::now()).await
    }

    pub async fn dispatch_at(
        &self,
        name: &str,
        payload: Value,
        options: DispatchOptions,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, JobError> {
        let definition = self
            .registry
            .definition(name)
            .ok_or_else(|| JobError::NotRegistered(name.to_string()))?;

        let run_at = options.available_at.unwrap_or_else(|| {
            let delay = options.delay_secs.unwrap_or(0).min(MAX_DELAY_SECS) as i64;
            now + Duration::seconds(delay)
        });

        let job = Job {
            id: Uuid::now_v7(),
            name: name.to_string(),
            queue: options.queue.unwrap_or_else(|| definition.queue.clone()),
            payload,
            status: JobStatus::Queued,
            priority: options.priority.unwrap_or(definition.priority),
            run_at,
            locked_at: None,
            locked_by: None,
            attempt: 0,
            max_attempts: definition.max_attempts,
            last_error: None,
            result: None,
            dedup_key: options.dedup_key.filter(|k| !k.is_empty()),
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        match self.store.insert(job).await? {
            InsertOutcome::Inserted(job_id) => {
                tracing::info!(job = %name, job_id = %job_id, run_at = %run_at, "Job dispatched");
                Ok(DispatchOutcome::Queued { job_id })
            }
            InsertOutcome::Duplicate(existing_job_id) => {
                tracing::info!(
                    job = %name,
                    existing_job_id = %existing_job_id,
                    "Duplicate dispatch ignored"
                );
                Ok(DispatchOutcome::Duplicate { existing_job_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobDefinition, JobFilter, MemoryJobStore, handler_fn};
    use serde_json::json;

    fn dispatcher() -> (Dispatcher, Arc<MemoryJobStore>) {
        let registry = JobRegistry::new().register(
            "email:welcome",
            JobDefinition::new("email", 3, 2),
            handler_fn(|_job: Job| async { Ok(json!(null)) }),
        );
        let store = Arc::new(MemoryJobStore::new());
        (Dispatcher::new(Arc::new(registry), store.clone()), store)
    }

    #[tokio::test]
    async fn test_dispatch_uses_registered_defaults() {
        let (dispatcher, store) = dispatcher();
        let payload = json!({"to": "a@example.com"});
        let outcome = dispatcher
            .dispatch("email:welcome", payload.clone(), DispatchOptions::default())
            .await
            .unwrap();
        let DispatchOutcome::Queued { job_id } = outcome else {
            panic!("expected queued, got {outcome:?}");
        };
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.payload, payload);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.queue, "email");
        assert_eq!(job.priority, 2);
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_unregistered_rejected_before_store() {
        let (dispatcher, store) = dispatcher();
        let err = dispatcher
            .dispatch("nonexistent:job", json!({}), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotRegistered(_)));
        assert!(err.to_string().contains("not registered"));
        assert_eq!(store.counts().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_dedup_key_returns_duplicate() {
        let (dispatcher, store) = dispatcher();
        let opts = || DispatchOptions {
            dedup_key: Some("welcome:user-1".into()),
            ..Default::default()
        };
        let first = dispatcher.dispatch("email:welcome", json!({}), opts()).await.unwrap();
        let second = dispatcher.dispatch("email:welcome", json!({}), opts()).await.unwrap();
        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(store.list(&JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_available_at_beats_delay() {
        let (dispatcher, store) = dispatcher();
        let now = Utc::now();
        let at = now + Duration::seconds(3600);
        let outcome = dispatcher
            .dispatch_at(
                "email:welcome",
                json!({}),
                DispatchOptions {
                    delay_secs: Some(10),
                    available_at: Some(at),
                    queue: Some("priority-mail".into()),
                    priority: Some(9),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        let DispatchOutcome::Queued { job_id } = outcome else {
            panic!("expected queued");
        };
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.run_at, at);
        assert_eq!(job.queue, "priority-mail");
        assert_eq!(job.priority, 9);

        let outcome = dispatcher
            .dispatch_at(
                "email:welcome",
                json!({}),
                DispatchOptions {
                    delay_secs: Some(10),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        let DispatchOutcome::Queued { job_id } = outcome else {
            panic!("expected queued");
        };
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.run_at, now + Duration::seconds(10));
    }

    #[test]
    fn test_outcome_serialization() {
        let id = Uuid::nil();
        let v = serde_json::to_value(DispatchOutcome::Duplicate { existing_job_id: id }).unwrap();
        assert_eq!(v["status"], "duplicate");
        let v = serde_json::to_value(DispatchOutcome::Queued { job_id: id }).unwrap();
        assert_eq!(v["status"], "queued");
        assert!(v["jobId"].is_string());
    }
}
