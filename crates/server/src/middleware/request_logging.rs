use axum::{extract::Request, middleware::Next, response::Response};
use warden_core::context::{RequestContext, UNKNOWN};

/// Access log: one line when a request arrives, one when it completes.
/// Server errors complete at `error` level, client errors at `warn`.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let Some(ctx) = request.extensions().get::<RequestContext>().cloned() else {
        tracing::debug!(path = %request.uri().path(), "No request context, skipping access log");
        return next.run(request).await;
    };
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ip = if ctx.ip.is_empty() { UNKNOWN } else { ctx.ip.as_str() };

    tracing::info!(
        request_id = %ctx.request_id,
        ip = %ip,
        method = %method,
        path = %path,
        bot = ctx.user_agent.is_bot,
        "Request received"
    );

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = ctx.elapsed_ms() as u64;

    if status.is_server_error() {
        tracing::error!(request_id = %ctx.request_id, method = %method, path = %path, status = status.as_u16(), elapsed_ms, "Request completed");
    } else if status.is_client_error() {
        tracing::warn!(request_id = %ctx.request_id, method = %method, path = %path, status = status.as_u16(), elapsed_ms, "Request completed");
    } else {
        tracing::info!(request_id = %ctx.request_id, method = %method, path = %path, status = status.as_u16(), elapsed_ms, "Request completed");
    }

    response
}
