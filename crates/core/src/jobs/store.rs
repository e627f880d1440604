use super::{Job, JobStatus};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result of an insert that honours dedup keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// A pending job already holds the dedup key.
    Duplicate(Uuid),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub queue: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// Persistence for the job queue. Every method is a single atomic operation
/// so a cancelled caller cannot leave a job half-claimed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert unless a pending job carries the same dedup key.
    async fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError>;

    /// Claim the best runnable job across `queues` (all queues when empty).
    /// Order: priority descending, then `run_at`, then creation time.
    async fn claim_next(
        &self,
        queues: &[String],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Mark a job claimed by `worker_id` as done.
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Record a failed attempt. With `retry_at` the job goes back to
    /// `queued`, otherwise it becomes permanently `failed`.
    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Unlock `running` jobs locked before `cutoff`, counting the lost run as
    /// an attempt. Returns how many jobs were released.
    async fn release_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
    -> Result<usize, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    /// Dedup key → id of the pending job holding it.
    dedup: HashMap<String, Uuid>,
}

impl QueueState {
    /// Free the job's dedup key once it has left the pending states.
    fn release_dedup(&mut self, job: &Job) {
        if !job.status.is_pending()
            && let Some(key) = &job.dedup_key
            && self.dedup.get(key) == Some(&job.id)
        {
            self.dedup.remove(key);
        }
    }

    fn owned_running(&mut self, id: Uuid, worker_id: &str) -> Result<&mut Job, StoreError> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict(format!(
                "job {id} is not locked by {worker_id}"
            )));
        }
        Ok(job)
    }
}

/// In-process job store. All state sits behind one async mutex, which makes
/// every trait method atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<QueueState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(key) = &job.dedup_key {
            if let Some(existing) = state.dedup.get(key) {
                return Ok(InsertOutcome::Duplicate(*existing));
            }
            state.dedup.insert(key.clone(), job.id);
        }
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn claim_next(
        &self,
        queues: &[String],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let candidate = state
            .jobs
            .values()
            .filter(|j| j.is_runnable(now))
            .filter(|j| queues.is_empty() || queues.iter().any(|q| *q == j.queue))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.run_at.cmp(&b.run_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.to_string());
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.owned_running(id, worker_id)?;
        job.status = JobStatus::Done;
        job.result = Some(result);
        job.completed_at = Some(now);
        job.locked_at = None;
        job.locked_by = None;
        let done = job.clone();
        state.release_dedup(&done);
        Ok(done)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.owned_running(id, worker_id)?;
        job.attempt += 1;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;
        match retry_at {
            Some(run_at) => {
                job.status = JobStatus::Queued;
                job.run_at = run_at;
            }
            None => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
        }
        let updated = job.clone();
        state.release_dedup(&updated);
        Ok(updated)
    }

    async fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut exhausted = Vec::new();
        let mut released = 0;
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.locked_at.is_some_and(|at| at < cutoff);
            if !stale {
                continue;
            }
            job.attempt += 1;
            job.last_error = Some(format!(
                "lock held by {} expired",
                job.locked_by.as_deref().unwrap_or("unknown worker")
            ));
            job.locked_at = None;
            job.locked_by = None;
            if job.attempt >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                exhausted.push(job.clone());
            } else {
                job.status = JobStatus::Queued;
                job.run_at = now;
            }
            released += 1;
        }
        for job in &exhausted {
            state.release_dedup(job);
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| filter.queue.as_ref().is_none_or(|q| *q == j.queue))
            .filter(|j| filter.name.as_ref().is_none_or(|n| *n == j.name))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(filter.limit.unwrap_or(50).clamp(1, 500));
        Ok(jobs)
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn job(name: &str, queue: &str, priority: i32, run_at: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::now_v7(),
            name: name.into(),
            queue: queue.into(),
            payload: json!({}),
            status: JobStatus::Queued,
            priority,
            run_at,
            locked_at: None,
            locked_by: None,
            attempt: 0,
            max_attempts: 2,
            last_error: None,
            result: None,
            dedup_key: None,
            created_at: run_at,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_dedup_until_finished() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut first = job("a", "q", 0, now);
        first.dedup_key = Some("k".into());
        let mut second = job("a", "q", 0, now);
        second.dedup_key = Some("k".into());
        let first_id = first.id;

        assert_eq!(store.insert(first).await.unwrap(), InsertOutcome::Inserted(first_id));
        assert_eq!(
            store.insert(second.clone()).await.unwrap(),
            InsertOutcome::Duplicate(first_id)
        );

        let claimed = store.claim_next(&[], "w1", now).await.unwrap().unwrap();
        store.complete(claimed.id, "w1", json!(1), now).await.unwrap();

        // key is free once the first job is done
        assert_eq!(
            store.insert(second.clone()).await.unwrap(),
            InsertOutcome::Inserted(second.id)
        );
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_run_at() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let low = job("low", "q", 0, now - Duration::seconds(10));
        let high = job("high", "q", 5, now - Duration::seconds(1));
        let older_high = job("older", "q", 5, now - Duration::seconds(5));
        for j in [low, high, older_high] {
            store.insert(j).await.unwrap();
        }
        let names: Vec<String> = {
            let mut names = Vec::new();
            while let Some(j) = store.claim_next(&[], "w", now).await.unwrap() {
                names.push(j.name);
            }
            names
        };
        assert_eq!(names, vec!["older", "high", "low"]);
    }

    #[tokio::test]
    async fn test_claim_respects_run_at_and_queue() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.insert(job("later", "q", 0, now + Duration::seconds(30))).await.unwrap();
        store.insert(job("other", "elsewhere", 0, now)).await.unwrap();
        assert!(store.claim_next(&["q".into()], "w", now).await.unwrap().is_none());
        assert!(store.claim_next(&[], "w", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.insert(job("a", "q", 0, now)).await.unwrap();
        let first = store.claim_next(&[], "w1", now).await.unwrap();
        let second = store.claim_next(&[], "w2", now).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let err = store
            .complete(first.unwrap().id, "w2", json!(null), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_failure_retry_then_permanent() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let j = job("a", "q", 0, now);
        let id = j.id;
        store.insert(j).await.unwrap();

        store.claim_next(&[], "w", now).await.unwrap();
        let retry_at = now + Duration::seconds(5);
        let updated = store
            .record_failure(id, "w", "boom", Some(retry_at), now)
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(updated.attempt, 1);
        assert_eq!(updated.run_at, retry_at);

        store.claim_next(&[], "w", retry_at).await.unwrap().unwrap();
        let updated = store
            .record_failure(id, "w", "boom again", None, retry_at)
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.last_error.as_deref(), Some("boom again"));
        assert_eq!(store.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_dedup_held_through_retry() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut j = job("a", "q", 0, now);
        j.dedup_key = Some("k".into());
        let id = j.id;
        store.insert(j).await.unwrap();
        let mut again = job("a", "q", 0, now);
        again.dedup_key = Some("k".into());

        store.claim_next(&[], "w", now).await.unwrap();
        store.record_failure(id, "w", "boom", Some(now), now).await.unwrap();
        assert_eq!(
            store.insert(again.clone()).await.unwrap(),
            InsertOutcome::Duplicate(id)
        );

        store.claim_next(&[], "w", now).await.unwrap();
        store.record_failure(id, "w", "boom", None, now).await.unwrap();
        assert_eq!(
            store.insert(again.clone()).await.unwrap(),
            InsertOutcome::Inserted(again.id)
        );
    }

    #[test]
    fn test_pending_states() {
        assert!(JobStatus::Queued.is_pending());
        assert!(JobStatus::Running.is_pending());
        assert!(!JobStatus::Done.is_pending());
        assert!(!JobStatus::Failed.is_pending());
    }

    #[tokio::test]
    async fn test_release_stale_locks() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.insert(job("a", "q", 0, now)).await.unwrap();
        store.claim_next(&[], "dead-worker", now).await.unwrap();

        let later = now + Duration::seconds(600);
        let released = store
            .release_stale(later - Duration::seconds(300), later)
            .await
            .unwrap();
        assert_eq!(released, 1);

        let j = store.list(&JobFilter::default()).await.unwrap().remove(0);
        assert_eq!(j.status, JobStatus::Queued);
        assert_eq!(j.attempt, 1);
        assert!(j.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.insert(job("a", "q1", 0, now)).await.unwrap();
        store.insert(job("b", "q2", 0, now)).await.unwrap();
        let filter = JobFilter {
            queue: Some("q2".into()),
            ..Default::default()
        };
        let jobs = store.list(&filter).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "b");
    }
}
