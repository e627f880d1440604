use crate::AppState;
use crate::response::{INTERNAL_SECRET_HEADER, error_response};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use warden_core::context::RequestContext;
use warden_core::error::ApiError;

/// Gate for `/internal/*`: the `x-internal-secret` header must match the
/// configured secret. With no secret configured every call is refused.
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (request_id, ip) = match request.extensions().get::<RequestContext>() {
        Some(ctx) => (ctx.request_id.clone(), ctx.ip.clone()),
        None => {
            let ctx = RequestContext::from_headers(request.headers());
            (ctx.request_id, ctx.ip)
        }
    };
    let path = request.uri().path().to_string();

    let Some(expected) = state.config.load().resolve_internal_secret() else {
        tracing::error!(
            request_id = %request_id,
            path = %path,
            "Internal secret is not configured, refusing internal call"
        );
        return error_response(
            &ApiError::Unauthorized("Invalid internal secret".into()),
            Some(&request_id),
        );
    };

    let provided = request
        .headers()
        .get(INTERNAL_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if !bool::from(provided.ct_eq(expected.as_bytes())) {
        tracing::warn!(
            target: "warden::security",
            event = "internal_secret_mismatch",
            request_id = %request_id,
            ip = %ip,
            path = %path,
            "Rejected internal call"
        );
        return error_response(
            &ApiError::Unauthorized("Invalid internal secret".into()),
            Some(&request_id),
        );
    }

    next.run(request).await
}
