//! At-least-once job queue: registration, dispatch, and bounded worker batches.
//!
//! Lifecycle of a job: `queued → running → done`, or on a failed run back to
//! `queued` with a later `run_at` until `max_attempts` is reached, after
//! which it stays `failed`. Claiming is a compare-and-set in the store, so a
//! job is executed by at most one worker at a time.

pub mod builtin;
pub mod dispatcher;
pub mod registry;
pub mod store;
pub mod worker;

pub use dispatcher::{DispatchOptions, DispatchOutcome, Dispatcher};
pub use registry::{JobDefinition, JobHandler, JobRegistry, handler_fn};
pub use store::{JobCounts, JobFilter, JobStore, MemoryJobStore};
pub use worker::{BatchOptions, BatchReport, Worker};

use crate::error::{ApiError, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Queued and running jobs hold their dedup key.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    /// Registered job name, e.g. `email:welcome`.
    #[serde(rename = "type")]
    pub name: String,
    pub queue: String,
    pub payload: Value,
    pub status: JobStatus,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.locked_by.is_none() && self.run_at <= now
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job '{0}' is not registered")]
    NotRegistered(String),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotRegistered(_) => ApiError::BadRequest(e.to_string()),
            JobError::Store(inner) => ApiError::from(inner),
        }
    }
}
