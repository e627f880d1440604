pub mod admin;
pub mod health;
pub mod jobs;
pub mod profile;
pub mod redirect;
pub mod sample;

use crate::response::error_response;
use axum::extract::Request;
use axum::response::Response;
use warden_core::context::RequestContext;
use warden_core::error::ApiError;

/// JSON 404 for every unmatched path.
pub async fn not_found(request: Request) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone());
    error_response(
        &ApiError::NotFound(format!("No route for {}", request.uri().path())),
        request_id.as_deref(),
    )
}
