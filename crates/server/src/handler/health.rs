use crate::AppState;
use crate::pipeline::{HandlerInput, RouteOptions, secure};
use crate::response;
use axum::http::Method;
use axum::response::Response;
use axum::routing::MethodRouter;
use warden_core::error::ApiError;

/// `GET|POST /internal/health`
pub fn routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new()
            .methods([Method::GET, Method::POST])
            .no_rate_limit(),
        health,
    )
    .into_method_router()
}

async fn health(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let jobs = state.jobs.counts().await?;
    Ok(response::ok(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "requestId": input.ctx.request_id,
        "jobs": jobs,
    })))
}
