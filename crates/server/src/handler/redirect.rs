use crate::AppState;
use crate::pipeline::{HandlerInput, RouteOptions, secure};
use crate::response::{self, safe_redirect};
use axum::response::Response;
use axum::routing::MethodRouter;
use serde::Deserialize;
use warden_core::error::ApiError;
use warden_core::validation::{Field, Schema};

#[derive(Debug, Deserialize)]
struct RedirectQuery {
    to: String,
}

/// `GET /v1/redirect?to=<target>`: 302 to `target` when it is same-origin
/// or on an allow-listed host, to the configured fallback otherwise.
pub fn routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new()
            .query_schema(Schema::new().field("to", Field::string().required().max_len(2048))),
        redirect,
    )
    .into_method_router()
}

async fn redirect(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let query: RedirectQuery = input.query_as()?;
    let config = state.config.load();
    let location = safe_redirect(
        &query.to,
        &config.redirect.allowed_hosts,
        &config.redirect.fallback,
    );
    Ok(response::redirect(&location))
}
