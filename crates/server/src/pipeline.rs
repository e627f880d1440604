//! Secure route handlers.
//!
//! [`secure`] wraps business logic in a fixed sequence of checks, each of
//! which ends the request on failure:
//!
//! 1. method allow-list
//! 2. rate limit (ip + path, optionally method)
//! 3. authentication, then role (any-of), then permissions (all-of)
//! 4. body: size ceiling from `Content-Length`, JSON parse, sanitize, schema
//! 5. query: coerce, sanitize, schema
//! 6. the handler itself, with panics turned into `INTERNAL_ERROR`
//!
//! Cheap checks come first so a rejected request never reaches the rate
//! limit store or the auth resolver, and payloads are only read once the
//! caller is known to be allowed.

use crate::AppState;
use crate::response::{apply_rate_limit_headers, error_response};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use axum::routing::MethodRouter;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use warden_core::auth::{AuthContext, Role};
use warden_core::context::RequestContext;
use warden_core::error::ApiError;
use warden_core::rate_limit::{RateLimitResult, RateLimitTier, rate_limit_key};
use warden_core::sanitize::sanitize_value;
use warden_core::validation::Schema;

/// Body ceiling when a route does not set one (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Checks applied to one group of methods on a route.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    methods: Vec<Method>,
    rate_limit: Option<RateLimitTier>,
    limit_by_method: bool,
    require_auth: bool,
    roles: Vec<Role>,
    permissions: Vec<String>,
    body_schema: Option<Arc<Schema>>,
    query_schema: Option<Arc<Schema>>,
    max_body_size: usize,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            methods: vec![Method::GET],
            rate_limit: Some(RateLimitTier::Public),
            limit_by_method: false,
            require_auth: false,
            roles: Vec::new(),
            permissions: Vec::new(),
            body_schema: None,
            query_schema: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl RouteOptions {
    /// `GET` only, public rate-limit tier, no auth.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn rate_limit(mut self, tier: RateLimitTier) -> Self {
        self.rate_limit = Some(tier);
        self
    }

    pub fn no_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    /// Count this method separately from other methods on the same path.
    pub fn limit_by_method(mut self) -> Self {
        self.limit_by_method = true;
        self
    }

    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    /// Caller's role must be one of `roles`. Implies authentication.
    pub fn require_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Caller must hold every one of `permissions`. Implies authentication.
    pub fn require_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Validated for POST, PUT and PATCH.
    pub fn body_schema(mut self, schema: Schema) -> Self {
        self.body_schema = Some(Arc::new(schema));
        self
    }

    pub fn query_schema(mut self, schema: Schema) -> Self {
        self.query_schema = Some(Arc::new(schema));
        self
    }

    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    fn needs_auth(&self) -> bool {
        self.require_auth || !self.roles.is_empty() || !self.permissions.is_empty()
    }
}

/// Everything a handler receives once all checks passed.
pub struct HandlerInput {
    /// Context with the resolved identity attached.
    pub ctx: RequestContext,
    /// Sanitized, schema-valid body. `None` when the route has no body schema.
    pub body: Option<Value>,
    /// Sanitized, schema-valid query. `None` when the route has no query schema.
    pub query: Option<Value>,
    pub parts: Parts,
}

impl HandlerInput {
    pub fn auth(&self) -> Result<&AuthContext, ApiError> {
        self.ctx
            .auth
            .as_ref()
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        decode(self.body.as_ref(), "body")
    }

    pub fn query_as<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        decode(self.query.as_ref(), "query")
    }
}

fn decode<T: DeserializeOwned>(value: Option<&Value>, what: &str) -> Result<T, ApiError> {
    let value = value.cloned().unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request {what}: {e}")))
}

type BoxedHandler =
    Arc<dyn Fn(AppState, HandlerInput) -> BoxFuture<'static, Result<Response, ApiError>> + Send + Sync>;

struct SecuredRoute {
    options: RouteOptions,
    handler: BoxedHandler,
}

/// One or more secured method groups sharing a path.
pub struct Secured {
    routes: Vec<SecuredRoute>,
}

/// Wrap `handler` in the check sequence described by `options`.
pub fn secure<H, Fut>(options: RouteOptions, handler: H) -> Secured
where
    H: Fn(AppState, HandlerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
{
    let handler: BoxedHandler = Arc::new(move |state, input| handler(state, input).boxed());
    Secured {
        routes: vec![SecuredRoute { options, handler }],
    }
}

impl Secured {
    /// Serve another method group on the same path. The first group listing
    /// a method handles it.
    pub fn and(mut self, other: Secured) -> Self {
        self.routes.extend(other.routes);
        self
    }

    pub fn into_method_router(self) -> MethodRouter<AppState> {
        let secured = Arc::new(self);
        axum::routing::any(move |State(state): State<AppState>, request: Request| {
            let secured = secured.clone();
            async move { secured.handle(state, request).await }
        })
    }

    fn allowed_methods(&self) -> Vec<Method> {
        let mut allowed: Vec<Method> = Vec::new();
        for method in self.routes.iter().flat_map(|r| &r.options.methods) {
            if !allowed.contains(method) {
                allowed.push(method.clone());
            }
        }
        allowed
    }

    async fn handle(&self, state: AppState, request: Request) -> Response {
        let ctx = request
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(|| RequestContext::from_headers(request.headers()));
        let request_id = ctx.request_id.clone();
        let method = request.method().clone();
        let allowed = self.allowed_methods();
        let mut rate = None;

        let route = self.routes.iter().find(|r| r.options.methods.contains(&method));
        let result = match route {
            Some(route) => route.run(state, ctx, request, &mut rate).await,
            None => Err(ApiError::MethodNotAllowed {
                method: method.to_string(),
                allowed: allowed.iter().map(ToString::to_string).collect(),
            }),
        };

        let mut response = result.unwrap_or_else(|e| error_response(&e, Some(&request_id)));
        let status = response.status();
        let headers = response.headers_mut();
        if let Some(rate) = &rate {
            apply_rate_limit_headers(headers, rate, Utc::now());
        }
        let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
        if let Ok(value) = HeaderValue::from_str(&allow) {
            if status == StatusCode::METHOD_NOT_ALLOWED {
                headers.insert(header::ALLOW, value.clone());
            }
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }
        response
    }
}

impl SecuredRoute {
    async fn run(
        &self,
        state: AppState,
        ctx: RequestContext,
        request: Request,
        rate: &mut Option<RateLimitResult>,
    ) -> Result<Response, ApiError> {
        let options = &self.options;
        let (parts, raw_body) = request.into_parts();
        let path = parts.uri.path().to_string();

        if let Some(tier) = options.rate_limit {
            let method = options.limit_by_method.then(|| parts.method.as_str());
            let key = rate_limit_key(&ctx.ip, &path, method);
            let result = state.rate_limiter.limit(&key, tier).await;
            let allowed = result.allowed;
            let retry_after_secs = result.retry_after_secs(Utc::now()).max(1);
            *rate = Some(result);
            if !allowed {
                tracing::warn!(
                    target: "warden::security",
                    event = "rate_limited",
                    request_id = %ctx.request_id,
                    ip = %ctx.ip,
                    path = %path,
                    tier = tier.as_str(),
                    "Rate limit exceeded"
                );
                return Err(ApiError::RateLimited { retry_after_secs });
            }
        }

        let auth = match state.auth.resolve(&parts.headers).await {
            Ok(auth) => auth,
            Err(e) if options.needs_auth() => {
                tracing::error!(request_id = %ctx.request_id, "Auth resolver failed: {e}");
                return Err(ApiError::ServiceUnavailable(e.to_string()));
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    "Auth resolver failed, continuing anonymously: {e}"
                );
                None
            }
        };
        let ctx = ctx.with_auth(auth);

        if options.needs_auth() && ctx.auth.is_none() {
            return Err(ApiError::Unauthorized("Authentication required".into()));
        }
        if let Some(auth) = &ctx.auth {
            if !options.roles.is_empty() && !options.roles.contains(&auth.role) {
                tracing::warn!(
                    target: "warden::security",
                    event = "role_denied",
                    request_id = %ctx.request_id,
                    ip = %ctx.ip,
                    path = %path,
                    user_id = %auth.user_id,
                    role = auth.role.as_str(),
                    "Role not permitted"
                );
                return Err(ApiError::Forbidden("Insufficient role".into()));
            }
            let missing = auth.missing_permissions(&options.permissions);
            if !missing.is_empty() {
                tracing::warn!(
                    target: "warden::security",
                    event = "permission_denied",
                    request_id = %ctx.request_id,
                    ip = %ctx.ip,
                    path = %path,
                    user_id = %auth.user_id,
                    missing = ?missing,
                    "Missing permissions"
                );
                return Err(ApiError::Forbidden("Missing required permissions".into()));
            }
        }

        let body = match &options.body_schema {
            Some(schema) if carries_body(&parts.method) => {
                Some(read_json_body(&parts, raw_body, options.max_body_size, schema).await?)
            }
            _ => None,
        };

        let query = match &options.query_schema {
            Some(schema) => {
                let pairs: Vec<(String, String)> =
                    url::form_urlencoded::parse(parts.uri.query().unwrap_or("").as_bytes())
                        .into_owned()
                        .collect();
                let value = sanitize_value(schema.coerce_query(&pairs));
                schema.validate(&value).map_err(ApiError::Validation)?;
                Some(value)
            }
            None => None,
        };

        let input = HandlerInput {
            ctx,
            body,
            query,
            parts,
        };
        match AssertUnwindSafe((self.handler)(state, input)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ApiError::Internal(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Enforce the size ceiling, parse, sanitize and validate. A declared
/// `Content-Length` above the limit is rejected before the body is polled.
async fn read_json_body(
    parts: &Parts,
    body: Body,
    limit: usize,
    schema: &Schema,
) -> Result<Value, ApiError> {
    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(ApiError::BadRequest(format!(
            "Request body exceeds {limit} bytes"
        )));
    }

    let bytes = axum::body::to_bytes(body, limit).await.map_err(|_| {
        ApiError::BadRequest(format!("Request body exceeds {limit} bytes or could not be read"))
    })?;
    let value = if bytes.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("Malformed JSON body: {e}")))?
    };

    let value = sanitize_value(value);
    schema.validate(&value).map_err(ApiError::Validation)?;
    Ok(value)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
