use crate::response::apply_standard_headers;
use axum::{extract::Request, middleware::Next, response::Response};
use warden_core::context::RequestContext;

/// Injects a `RequestContext` as an axum Extension and stamps the standard
/// security headers and `X-Request-ID` on whatever response comes back.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let ctx = RequestContext::from_headers(request.headers());
    let request_id = ctx.request_id.clone();
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;
    apply_standard_headers(response.headers_mut(), Some(&request_id));
    response
}
