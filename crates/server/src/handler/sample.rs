//! Example resource showing the full pipeline on a public route.

use crate::AppState;
use crate::pipeline::{HandlerInput, RouteOptions, secure};
use crate::response;
use axum::http::Method;
use axum::response::Response;
use axum::routing::MethodRouter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_core::error::ApiError;
use warden_core::jobs::DispatchOptions;
use warden_core::jobs::builtin::SAMPLE_PROCESS;
use warden_core::rate_limit::RateLimitTier;
use warden_core::validation::{Field, Schema};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSample {
    name: String,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Sample {
    id: Uuid,
    name: String,
    description: Option<String>,
    tags: Vec<String>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DescribeQuery {
    verbose: Option<bool>,
}

/// `GET /v1/sample` describes the caller, `POST` creates a sample and
/// queues its processing. POST is counted on the heavy tier.
pub fn routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new().query_schema(Schema::new().field("verbose", Field::boolean())),
        describe,
    )
    .and(secure(
        RouteOptions::new()
            .methods([Method::POST])
            .rate_limit(RateLimitTier::Heavy)
            .limit_by_method()
            .body_schema(create_schema()),
        create,
    ))
    .into_method_router()
}

fn create_schema() -> Schema {
    Schema::new()
        .field(
            "name",
            Field::string().required().min_len(1).max_len(100).pattern(r"\S"),
        )
        .field("description", Field::string().max_len(500))
        .field(
            "tags",
            Field::array(Some(Field::string().min_len(1).max_len(30))).max_len(10),
        )
}

async fn describe(_state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let query: DescribeQuery = input.query_as()?;
    let ctx = &input.ctx;
    let mut data = serde_json::json!({
        "requestId": ctx.request_id,
        "authenticated": ctx.auth.is_some(),
    });
    if query.verbose.unwrap_or(false) {
        data["ip"] = ctx.ip.clone().into();
        data["userAgent"] = serde_json::to_value(&ctx.user_agent)?;
        data["role"] = serde_json::to_value(ctx.auth.as_ref().map(|a| a.role))?;
    }
    Ok(response::ok(data))
}

async fn create(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let request: CreateSample = input.body_as()?;
    let sample = Sample {
        id: Uuid::new_v4(),
        name: request.name.trim().to_string(),
        description: request.description,
        tags: request.tags,
        created_by: input.ctx.user_id().map(str::to_string),
        created_at: Utc::now(),
    };

    state
        .dispatcher
        .dispatch(
            SAMPLE_PROCESS,
            serde_json::to_value(&sample)?,
            DispatchOptions {
                dedup_key: Some(format!("sample:{}", sample.id)),
                ..Default::default()
            },
        )
        .await?;

    Ok(response::created(sample))
}
