pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod response;

use arc_swap::ArcSwap;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{Router, middleware as axum_mw};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use warden_core::auth::{AuthResolver, JwtAuthResolver, NoAuthResolver};
use warden_core::config::{Config, CorsConfig};
use warden_core::jobs::{Dispatcher, JobRegistry, JobStore, Worker};
use warden_core::profile::ProfileStore;
use warden_core::rate_limit::{RateLimitStore, RateLimiter};

/// Backing collaborators the application is assembled from.
pub struct Services {
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub auth: Arc<dyn AuthResolver>,
    pub registry: Arc<JobRegistry>,
    pub jobs: Arc<dyn JobStore>,
    pub profiles: Arc<dyn ProfileStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: Arc<dyn AuthResolver>,
    pub registry: Arc<JobRegistry>,
    pub jobs: Arc<dyn JobStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub worker: Arc<Worker>,
    pub profiles: Arc<dyn ProfileStore>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<ArcSwap<Config>>, services: Services) -> Self {
        let snapshot = config.load();
        let rate_limiter = Arc::new(RateLimiter::new(
            services.rate_limit_store,
            &snapshot.rate_limit,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            services.registry.clone(),
            services.jobs.clone(),
        ));
        let worker = Arc::new(Worker::new(
            services.registry.clone(),
            services.jobs.clone(),
            &snapshot.jobs,
        ));
        Self {
            config: config.clone(),
            rate_limiter,
            auth: services.auth,
            registry: services.registry,
            jobs: services.jobs,
            dispatcher,
            worker,
            profiles: services.profiles,
            start_time: Instant::now(),
        }
    }
}

/// JWT bearer auth when a signing secret is configured, anonymous otherwise.
pub fn auth_resolver_for(config: &Config) -> Arc<dyn AuthResolver> {
    match config.auth.resolve_jwt_secret() {
        Some(secret) => Arc::new(JwtAuthResolver::new(&secret)),
        None => {
            tracing::warn!("No JWT secret configured, every request is anonymous");
            Arc::new(NoAuthResolver)
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let config = state.config.load();
    let cors = cors_layer(&config.cors);

    // Internal routes, shared-secret header required
    let internal_routes = Router::new()
        .route("/internal/health", handler::health::routes())
        .route("/internal/jobs/worker", handler::jobs::worker_routes())
        .route("/internal/jobs/dispatch", handler::jobs::dispatch_routes())
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::internal_auth::internal_auth_middleware,
        ));

    // Public API, every route runs through the secure pipeline
    let api_routes = Router::new()
        .route("/v1/sample", handler::sample::routes())
        .route("/v1/profile", handler::profile::routes())
        .route("/v1/admin/overview", handler::admin::routes())
        .route("/v1/redirect", handler::redirect::routes());

    // Compose, then global middleware layers (outer → inner)
    Router::new()
        .merge(internal_routes)
        .merge(api_routes)
        .fallback(handler::not_found)
        .layer(axum_mw::from_fn(
            middleware::request_logging::request_logging_middleware,
        ))
        .layer(axum_mw::from_fn(
            middleware::request_context::request_context_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-internal-secret"),
        ])
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            header::RETRY_AFTER,
        ])
}
