use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Poll;
use tower::ServiceExt;
use warden_core::auth::{AuthContext, AuthError, AuthResolver, JwtAuthResolver, Role, issue_token};
use warden_core::config::{Config, FailMode};
use warden_core::error::StoreError;
use warden_core::jobs::{JobRegistry, MemoryJobStore};
use warden_core::profile::MemoryProfileStore;
use warden_core::rate_limit::{MemoryRateLimitStore, RateLimitStore, RateLimitTier, WindowCount};
use warden_core::validation::{Field, Schema};
use warden_server::middleware::request_context::request_context_middleware;
use warden_server::pipeline::{HandlerInput, RouteOptions, Secured, secure};
use warden_server::{AppState, Services, response};

const JWT_SECRET: &str = "pipeline-test-secret";

// ---------------------------------------------------------------------------
// Instrumented collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingStore {
    inner: MemoryRateLimitStore,
    hits: AtomicUsize,
}

#[async_trait]
impl RateLimitStore for CountingStore {
    async fn hit(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.inner.hit(key, window, now).await
    }
}

struct BrokenStore;

#[async_trait]
impl RateLimitStore for BrokenStore {
    async fn hit(
        &self,
        _key: &str,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

struct CountingAuth {
    inner: JwtAuthResolver,
    calls: AtomicUsize,
}

#[async_trait]
impl AuthResolver for CountingAuth {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<AuthContext>, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(headers).await
    }
}

struct DownAuth;

#[async_trait]
impl AuthResolver for DownAuth {
    async fn resolve(&self, _headers: &HeaderMap) -> Result<Option<AuthContext>, AuthError> {
        Err(AuthError::Unavailable("identity provider timed out".into()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestHarness {
    state: AppState,
    store: Arc<CountingStore>,
    auth: Arc<CountingAuth>,
    handler_calls: Arc<AtomicUsize>,
}

fn create_test_harness() -> TestHarness {
    create_harness_with(Config::default(), None, None)
}

fn create_harness_with(
    config: Config,
    rate_store: Option<Arc<dyn RateLimitStore>>,
    auth: Option<Arc<dyn AuthResolver>>,
) -> TestHarness {
    let store = Arc::new(CountingStore::default());
    let counting_auth = Arc::new(CountingAuth {
        inner: JwtAuthResolver::new(JWT_SECRET),
        calls: AtomicUsize::new(0),
    });
    let services = Services {
        rate_limit_store: rate_store.unwrap_or_else(|| store.clone()),
        auth: auth.unwrap_or_else(|| counting_auth.clone()),
        registry: Arc::new(JobRegistry::builtin(&config.jobs)),
        jobs: Arc::new(MemoryJobStore::new()),
        profiles: Arc::new(MemoryProfileStore::new()),
    };
    TestHarness {
        state: AppState::new(Arc::new(ArcSwap::new(Arc::new(config))), services),
        store,
        auth: counting_auth,
        handler_calls: Arc::new(AtomicUsize::new(0)),
    }
}

impl TestHarness {
    /// Secured route whose handler counts calls and echoes what it received.
    fn echo(&self, options: RouteOptions) -> Secured {
        let calls = self.handler_calls.clone();
        secure(options, move |_state: AppState, input: HandlerInput| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(response::ok(json!({
                    "body": input.body,
                    "query": input.query,
                    "userId": input.ctx.user_id(),
                })))
            }
        })
    }

    fn router(&self, route: Secured) -> Router {
        Router::new()
            .route("/test", route.into_method_router())
            .layer(axum::middleware::from_fn(request_context_middleware))
            .with_state(self.state.clone())
    }

    fn hits(&self) -> usize {
        self.store.hits.load(Ordering::SeqCst)
    }

    fn handler_calls(&self) -> usize {
        self.handler_calls.load(Ordering::SeqCst)
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = router.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let headers = response.headers().clone();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    let value: Value = serde_json::from_slice(&body_bytes).unwrap_or(json!({}));
    (status, headers, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn token(role: Role) -> String {
    issue_token("user-1", None, role, &[], JWT_SECRET, 3600).unwrap()
}

fn authed_get(uri: &str, role: Role) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", token(role)))
        .body(Body::empty())
        .unwrap()
}

fn error_fields(body: &Value) -> BTreeSet<String> {
    body["error"]["details"]["errors"]
        .as_array()
        .expect("no validation errors in body")
        .iter()
        .map(|e| e["field"].as_str().unwrap().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_method_check_runs_before_rate_limit_and_auth() {
    let h = create_test_harness();
    let router = h.router(h.echo(RouteOptions::new().require_auth()));

    let (status, headers, body) = send(&router, post_json("/test", json!({}))).await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"]["code"], "METHOD_NOT_ALLOWED");
    assert_eq!(body["error"]["details"]["allowed"], json!(["GET"]));
    assert_eq!(headers[header::ALLOW], "GET");
    assert_eq!(h.hits(), 0);
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.handler_calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_denial_headers() {
    let h = create_test_harness();
    let router = h.router(h.echo(RouteOptions::new().rate_limit(RateLimitTier::Strict)));

    for i in 0..5 {
        let (status, headers, _) = send(&router, get("/test")).await;
        assert_eq!(status, StatusCode::OK, "request {i} should pass");
        assert_eq!(headers["x-ratelimit-limit"], "5");
    }

    let (status, headers, body) = send(&router, get("/test")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0);
    assert_eq!(h.handler_calls(), 5);
}

#[tokio::test]
async fn test_rate_limit_store_down_fail_open_and_closed() {
    let open = create_harness_with(Config::default(), Some(Arc::new(BrokenStore)), None);
    let router = open.router(open.echo(RouteOptions::new()));
    let (status, _, _) = send(&router, get("/test")).await;
    assert_eq!(status, StatusCode::OK);

    let mut config = Config::default();
    config.rate_limit.fail_mode = FailMode::Closed;
    let closed = create_harness_with(config, Some(Arc::new(BrokenStore)), None);
    let router = closed.router(closed.echo(RouteOptions::new()));
    let (status, _, _) = send(&router, get("/test")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(closed.handler_calls(), 0);
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_require_auth_without_identity_is_401() {
    let h = create_test_harness();
    let router = h.router(h.echo(RouteOptions::new().require_auth()));

    let (status, headers, body) = send(&router, get("/test")).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(
        body["error"]["requestId"].as_str(),
        headers["x-request-id"].to_str().ok()
    );
    assert_eq!(h.handler_calls(), 0);
    assert_eq!(h.hits(), 1);
}

#[tokio::test]
async fn test_invalid_token_is_anonymous() {
    let h = create_test_harness();
    let router = h.router(h.echo(RouteOptions::new()));

    let request = Request::builder()
        .uri("/test")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["userId"], Value::Null);
}

#[tokio::test]
async fn test_permissions_are_all_of() {
    let h = create_test_harness();
    let router = h.router(
        h.echo(RouteOptions::new().require_permissions(["content:moderate", "users:read"])),
    );

    // moderators have content:moderate but not users:read
    let (status, _, body) = send(&router, authed_get("/test", Role::Moderator)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
    assert_eq!(h.handler_calls(), 0);

    let (status, _, body) = send(&router, authed_get("/test", Role::Admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["userId"], "user-1");
}

#[tokio::test]
async fn test_roles_are_any_of() {
    let h = create_test_harness();
    let router = h.router(h.echo(RouteOptions::new().require_roles([Role::Moderator, Role::Admin])));

    let (status, _, _) = send(&router, authed_get("/test", Role::User)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(&router, authed_get("/test", Role::Moderator)).await;
    assert_eq!(status, StatusCode::OK);

    // membership, not hierarchy
    let (status, _, _) = send(&router, authed_get("/test", Role::SuperAdmin)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_resolver_outage() {
    let h = create_harness_with(Config::default(), None, Some(Arc::new(DownAuth)));

    let router = h.router(h.echo(RouteOptions::new().require_auth()));
    let (status, _, body) = send(&router, get("/test")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body.to_string().contains("timed out"));

    let router = h.router(h.echo(RouteOptions::new()));
    let (status, _, _) = send(&router, get("/test")).await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn person_schema() -> Schema {
    Schema::new()
        .field("name", Field::string().required().max_len(50))
        .field("age", Field::integer().min(0))
}

#[tokio::test]
async fn test_oversized_content_length_never_reads_body() {
    let h = create_test_harness();
    let router = h.router(h.echo(
        RouteOptions::new()
            .methods([Method::POST])
            .body_schema(person_schema()),
    ));

    let polled = Arc::new(AtomicBool::new(false));
    let flag = polled.clone();
    let stream = futures::stream::poll_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
        Poll::Ready(None::<Result<Bytes, std::io::Error>>)
    });
    let request = Request::builder()
        .method("POST")
        .uri("/test")
        .header("content-type", "application/json")
        .header("content-length", (2 * 1024 * 1024).to_string())
        .body(Body::from_stream(stream))
        .unwrap();

    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert!(!polled.load(Ordering::SeqCst));
    assert_eq!(h.handler_calls(), 0);
}

#[tokio::test]
async fn test_body_over_limit_without_content_length() {
    let h = create_test_harness();
    let router = h.router(h.echo(
        RouteOptions::new()
            .methods([Method::POST])
            .body_schema(person_schema().allow_unknown())
            .max_body_size(32),
    ));

    let body = json!({"name": "x", "padding": "y".repeat(64)});
    let (status, _, _) = send(&router, post_json("/test", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.handler_calls(), 0);
}

#[tokio::test]
async fn test_validation_errors_are_aggregated() {
    let h = create_test_harness();
    let router = h.router(h.echo(
        RouteOptions::new()
            .methods([Method::POST])
            .body_schema(person_schema()),
    ));

    let (status, _, body) = send(&router, post_json("/test", json!({"age": -1, "bogus": true}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    let fields = error_fields(&body);
    assert!(fields.contains("name"));
    assert!(fields.contains("age"));
    assert!(fields.contains("bogus"));
    assert_eq!(h.handler_calls(), 0);
}

#[tokio::test]
async fn test_reserved_keys_stripped_before_validation() {
    let h = create_test_harness();
    let router = h.router(h.echo(
        RouteOptions::new()
            .methods([Method::POST])
            .body_schema(person_schema()),
    ));

    let payload = json!({"name": "Ada", "__proto__": {"isAdmin": true}, "constructor": 1});
    let (status, _, body) = send(&router, post_json("/test", payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["body"], json!({"name": "Ada"}));
}

#[tokio::test]
async fn test_malformed_json() {
    let h = create_test_harness();
    let router = h.router(h.echo(
        RouteOptions::new()
            .methods([Method::POST])
            .body_schema(person_schema()),
    ));

    let request = Request::builder()
        .method("POST")
        .uri("/test")
        .body(Body::from("{\"name\": "))
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_query_is_coerced_and_validated() {
    let h = create_test_harness();
    let router = h.router(h.echo(
        RouteOptions::new().query_schema(Schema::new().field("page", Field::integer().min(1))),
    ));

    let (status, _, body) = send(&router, get("/test?page=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _, body) = send(&router, get("/test?page=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["query"], json!({"page": 2}));
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handler_panic_becomes_internal_error() {
    let h = create_test_harness();
    let route = secure(RouteOptions::new(), |_state: AppState, input: HandlerInput| async move {
        if input.query.is_none() {
            panic!("secret connection string leaked");
        }
        Ok(response::ok(json!({})))
    });
    let router = h.router(route);

    let (status, headers, body) = send(&router, get("/test")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
    assert_eq!(body["error"]["message"], "An unexpected error occurred");
    assert!(!body.to_string().contains("secret"));
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_method_groups_share_a_path() {
    let h = create_test_harness();
    let route = h
        .echo(RouteOptions::new())
        .and(h.echo(RouteOptions::new().methods([Method::POST]).require_auth()));
    let router = h.router(route);

    let (status, _, _) = send(&router, get("/test")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&router, post_json("/test", json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("DELETE")
        .uri("/test")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers[header::ALLOW], "GET, POST");
}
