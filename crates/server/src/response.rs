//! Success/error envelopes and the headers every response carries.

use axum::Json;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use warden_core::error::ApiError;
use warden_core::rate_limit::RateLimitResult;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const INTERNAL_SECRET_HEADER: HeaderName = HeaderName::from_static("x-internal-secret");
const PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// `{"success": true, "data": ...}` with the given status.
pub fn success<T: Serialize>(status: StatusCode, data: T) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => (status, Json(json!({ "success": true, "data": data }))).into_response(),
        Err(e) => error_response(&ApiError::from(e), None),
    }
}

pub fn ok<T: Serialize>(data: T) -> Response {
    success(StatusCode::OK, data)
}

pub fn created<T: Serialize>(data: T) -> Response {
    success(StatusCode::CREATED, data)
}

/// Render `err` as the error envelope. Server errors are logged in full
/// here, keyed by request id; the client only sees the public message.
pub fn error_response(err: &ApiError, request_id: Option<&str>) -> Response {
    if err.is_server_error() {
        tracing::error!(
            request_id = request_id.unwrap_or("-"),
            code = err.code().as_str(),
            error = %err,
            "Request failed"
        );
    }
    let body = json!({
        "success": false,
        "error": err.body(request_id),
    });
    (err.status_code(), Json(body)).into_response()
}

/// 302 to an already validated location. See [`safe_redirect`].
pub fn redirect(location: &str) -> Response {
    let mut response = success(StatusCode::FOUND, json!({ "location": location }));
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => error_response(
            &ApiError::BadRequest("Redirect target is not a valid header value".into()),
            None,
        ),
    }
}

pub fn apply_standard_headers(headers: &mut HeaderMap, request_id: Option<&str>) {
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        PERMISSIONS_POLICY,
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if let Some(id) = request_id
        && let Ok(value) = HeaderValue::from_str(id)
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

/// `X-RateLimit-*` headers, plus `Retry-After` when the request was denied.
/// `X-RateLimit-Reset` is the window end as unix seconds.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult, now: DateTime<Utc>) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(result.reset_at.timestamp()));
    if !result.allowed {
        let retry_after = result.retry_after_secs(now).max(1);
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

/// Validate a redirect destination. Same-origin paths pass through, absolute
/// http(s) URLs only when their host is allow-listed; anything else yields
/// `fallback`.
pub fn safe_redirect(target: &str, allowed_hosts: &[String], fallback: &str) -> String {
    let target = target.trim();
    if is_local_path(target) {
        return target.to_string();
    }
    if let Ok(url) = url::Url::parse(target)
        && matches!(url.scheme(), "http" | "https")
        && url
            .host_str()
            .is_some_and(|host| allowed_hosts.iter().any(|a| a.eq_ignore_ascii_case(host)))
    {
        return url.to_string();
    }
    tracing::warn!(
        target: "warden::security",
        event = "unsafe_redirect",
        destination = %target,
        "Redirect target rejected, using fallback"
    );
    fallback.to_string()
}

fn is_local_path(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.starts_with("/\\")
        && !target.contains(['\r', '\n'])
}
