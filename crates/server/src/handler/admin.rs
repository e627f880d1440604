use crate::AppState;
use crate::pipeline::{HandlerInput, RouteOptions, secure};
use crate::response;
use axum::response::Response;
use axum::routing::MethodRouter;
use warden_core::auth::Role;
use warden_core::error::ApiError;

/// `GET /v1/admin/overview`, admins only.
pub fn routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new().require_roles([Role::Admin, Role::SuperAdmin]),
        overview,
    )
    .into_method_router()
}

/// Operational snapshot. Secrets are never included.
async fn overview(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let config = state.config.load();
    let jobs = state.jobs.counts().await?;
    let registered: Vec<serde_json::Value> = state
        .registry
        .definitions()
        .into_iter()
        .map(|(name, def)| {
            serde_json::json!({
                "type": name,
                "queue": def.queue,
                "maxAttempts": def.max_attempts,
                "priority": def.priority,
            })
        })
        .collect();

    Ok(response::ok(serde_json::json!({
        "requestedBy": input.ctx.user_id(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "jobs": jobs,
        "registeredJobs": registered,
        "rateLimit": {
            "enabled": config.rate_limit.enabled,
            "failMode": config.rate_limit.fail_mode,
            "public": config.rate_limit.public,
            "heavy": config.rate_limit.heavy,
            "strict": config.rate_limit.strict,
        },
        "internalSecretConfigured": config.resolve_internal_secret().is_some(),
    })))
}
