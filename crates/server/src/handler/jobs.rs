//! Internal job endpoints, called by schedulers and other services.

use crate::AppState;
use crate::pipeline::{HandlerInput, RouteOptions, secure};
use crate::response;
use axum::http::Method;
use axum::response::Response;
use axum::routing::MethodRouter;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use warden_core::error::ApiError;
use warden_core::jobs::dispatcher::MAX_DELAY_SECS;
use warden_core::jobs::{BatchOptions, DispatchOptions, DispatchOutcome, JobFilter, JobStatus};
use warden_core::validation::{Field, Schema};

/// Upper bound for `maxJobs` in one batch.
pub const MAX_BATCH_JOBS: i64 = 100;
/// Upper bound for `maxRuntimeMs`; hosts usually cut requests at 30-60 s.
pub const MAX_BATCH_RUNTIME_MS: i64 = 55_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    queues: Option<Vec<String>>,
    max_jobs: Option<usize>,
    max_runtime_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<JobStatus>,
    queue: Option<String>,
    #[serde(rename = "type")]
    name: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchRequest {
    #[serde(rename = "type")]
    name: String,
    #[serde(default = "empty_object")]
    payload: Value,
    #[serde(flatten)]
    options: DispatchOptions,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn batch_schema() -> Schema {
    Schema::new()
        .field(
            "queues",
            Field::array(Some(Field::string().min_len(1).max_len(64))).max_len(32),
        )
        .field("maxJobs", Field::integer().min(1).max(MAX_BATCH_JOBS))
        .field(
            "maxRuntimeMs",
            Field::integer().min(1).max(MAX_BATCH_RUNTIME_MS),
        )
}

fn list_schema() -> Schema {
    Schema::new()
        .field("status", Field::one_of(["queued", "running", "done", "failed"]))
        .field("queue", Field::string().max_len(64))
        .field("type", Field::string().max_len(128))
        .field("limit", Field::integer().min(1).max(500))
}

fn dispatch_schema() -> Schema {
    Schema::new()
        .field("type", Field::string().required().min_len(1).max_len(128))
        .field("payload", Field::object(None))
        .field("queue", Field::string().min_len(1).max_len(64))
        .field("delaySecs", Field::integer().min(0).max(MAX_DELAY_SECS as i64))
        .field("availableAt", Field::datetime().max_len(64))
        .field("priority", Field::integer().min(-100).max(100))
        .field("dedupKey", Field::string().min_len(1).max_len(200))
}

/// `POST /internal/jobs/worker` runs one batch, `GET` inspects the queue.
pub fn worker_routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new()
            .methods([Method::POST])
            .no_rate_limit()
            .body_schema(batch_schema()),
        process_batch,
    )
    .and(secure(
        RouteOptions::new().no_rate_limit().query_schema(list_schema()),
        queue_status,
    ))
    .into_method_router()
}

/// `POST /internal/jobs/dispatch` enqueues, `GET` lists registered job types.
pub fn dispatch_routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new()
            .methods([Method::POST])
            .no_rate_limit()
            .body_schema(dispatch_schema()),
        dispatch,
    )
    .and(secure(RouteOptions::new().no_rate_limit(), registered_jobs))
    .into_method_router()
}

async fn process_batch(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let request: BatchRequest = input.body_as()?;
    let (default_jobs, default_runtime_ms) = {
        let config = state.config.load();
        (config.jobs.worker.max_jobs, config.jobs.worker.max_runtime_ms)
    };
    let options = BatchOptions {
        queues: request.queues.filter(|q| !q.is_empty()),
        max_jobs: request.max_jobs.unwrap_or(default_jobs),
        max_runtime: Duration::from_millis(request.max_runtime_ms.unwrap_or(default_runtime_ms)),
    };
    let report = state.worker.process_batch(options).await?;
    Ok(response::ok(report))
}

async fn queue_status(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let query: ListQuery = input.query_as()?;
    let filter = JobFilter {
        status: query.status,
        queue: query.queue,
        name: query.name,
        limit: query.limit,
    };
    let counts = state.jobs.counts().await?;
    let jobs = state.jobs.list(&filter).await?;
    Ok(response::ok(json!({
        "workerId": state.worker.id(),
        "queues": state.registry.queues(),
        "counts": counts,
        "jobs": jobs,
    })))
}

async fn dispatch(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let request: DispatchRequest = input.body_as()?;
    let outcome = state
        .dispatcher
        .dispatch(&request.name, request.payload, request.options)
        .await?;
    Ok(match outcome {
        DispatchOutcome::Queued { .. } => response::created(outcome),
        DispatchOutcome::Duplicate { .. } => response::ok(outcome),
    })
}

async fn registered_jobs(state: AppState, _input: HandlerInput) -> Result<Response, ApiError> {
    let jobs: Vec<Value> = state
        .registry
        .definitions()
        .into_iter()
        .map(|(name, def)| {
            json!({
                "type": name,
                "queue": def.queue,
                "maxAttempts": def.max_attempts,
                "priority": def.priority,
            })
        })
        .collect();
    Ok(response::ok(json!({ "jobs": jobs })))
}
