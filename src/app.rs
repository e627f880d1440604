//! Application struct that encapsulates server assembly and serving logic.

use crate::cli::RunArgs;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use warden_core::config::{Config, ConfigWatcher};
use warden_core::jobs::{JobRegistry, MemoryJobStore};
use warden_core::lifecycle::signal::SignalHandler;
use warden_core::lifecycle::{self, Lifecycle};
use warden_core::profile::MemoryProfileStore;
use warden_core::rate_limit::{MemoryRateLimitStore, RateLimiter};
use warden_server::{AppState, Services};

/// How often expired rate-limit windows are dropped from memory.
const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Application {
    config: Arc<ArcSwap<Config>>,
    app_router: axum::Router,
    config_path: String,
    rate_limiter: Arc<RateLimiter>,
    rate_limit_store: Arc<MemoryRateLimitStore>,
    lifecycle: Box<dyn Lifecycle>,
    shutdown_timeout: u64,
}

impl Application {
    /// Build the application from CLI args: load config, create the backing
    /// stores and job registry, and assemble the router.
    pub fn build(args: &RunArgs) -> anyhow::Result<Self> {
        let config_path = args.config.config.clone();
        let mut config = match Config::load(&config_path) {
            Ok(config) => config,
            Err(e) if std::path::Path::new(&config_path).exists() => {
                return Err(e.context(format!("invalid config '{config_path}'")));
            }
            Err(e) => {
                tracing::warn!("Failed to load config from '{config_path}': {e}, using defaults");
                Config::default()
            }
        };

        // CLI overrides
        if let Some(ref host) = args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }

        if config.resolve_internal_secret().is_none() {
            tracing::warn!("No internal secret configured, /internal routes will refuse every call");
        }

        let rate_limit_store = Arc::new(MemoryRateLimitStore::new());
        let registry = Arc::new(JobRegistry::builtin(&config.jobs));
        tracing::info!(
            job_types = registry.len(),
            queues = ?registry.queues(),
            "Job registry ready"
        );

        let services = Services {
            rate_limit_store: rate_limit_store.clone(),
            auth: warden_server::auth_resolver_for(&config),
            registry,
            jobs: Arc::new(MemoryJobStore::new()),
            profiles: Arc::new(MemoryProfileStore::new()),
        };
        let config = Arc::new(ArcSwap::from_pointee(config));
        let state = AppState::new(config.clone(), services);
        let rate_limiter = state.rate_limiter.clone();
        let app_router = warden_server::build_router(state);

        Ok(Self {
            config,
            app_router,
            config_path,
            rate_limiter,
            rate_limit_store,
            lifecycle: lifecycle::detect_lifecycle(),
            shutdown_timeout: args.shutdown_timeout,
        })
    }

    /// Start serving HTTP/HTTPS, handle signals, and drain gracefully.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Self {
            config,
            app_router,
            config_path,
            rate_limiter,
            rate_limit_store,
            lifecycle,
            shutdown_timeout,
        } = self;

        // Config file watcher
        let watcher_rate_limiter = rate_limiter.clone();
        let _watcher = match ConfigWatcher::start(config_path.clone(), config.clone(), move |new_cfg| {
            watcher_rate_limiter.update_config(&new_cfg.rate_limit);
            tracing::info!(
                rate_limit_enabled = new_cfg.rate_limit.enabled,
                fail_mode = ?new_cfg.rate_limit.fail_mode,
                "Config reloaded from file"
            );
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!("Config watcher not started for '{config_path}': {e}");
                None
            }
        };

        let (signal_handler, shutdown_rx) = SignalHandler::new();

        // SIGHUP reload
        let reload_config = config.clone();
        let reload_rate_limiter = rate_limiter.clone();
        let reload_path = config_path.clone();
        let reload_lifecycle: Arc<dyn Lifecycle> = Arc::from(lifecycle::detect_lifecycle());
        let reload_fn = move || {
            reload_lifecycle.on_reloading();
            match Config::load(&reload_path) {
                Ok(new_cfg) => {
                    reload_rate_limiter.update_config(&new_cfg.rate_limit);
                    reload_config.store(Arc::new(new_cfg));
                    reload_lifecycle.on_reloaded();
                }
                Err(e) => {
                    tracing::error!("SIGHUP config reload failed: {e}");
                }
            }
        };

        tokio::spawn(async move {
            if let Err(e) = signal_handler.run(reload_fn).await {
                tracing::error!("Signal handler failed: {e}");
            }
        });

        // Expired window cleanup
        let mut purge_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RATE_LIMIT_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = rate_limit_store.purge_expired(chrono::Utc::now());
                        if removed > 0 {
                            tracing::debug!(removed, remaining = rate_limit_store.len(), "Purged rate-limit windows");
                        }
                    }
                    _ = purge_shutdown.wait_for(|v| *v) => break,
                }
            }
        });

        // Bind and serve
        let cfg = config.load_full();
        let addr = format!("{}:{}", cfg.host, cfg.port);

        if cfg.tls.enable {
            serve_tls(&addr, &cfg, app_router, shutdown_rx, &*lifecycle, shutdown_timeout).await?;
        } else {
            serve_http(&addr, app_router, shutdown_rx, &*lifecycle, shutdown_timeout).await?;
        }

        tracing::info!("Server shut down.");
        Ok(())
    }
}

async fn serve_http(
    addr: &str,
    app_router: axum::Router,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    lifecycle: &dyn Lifecycle,
    shutdown_timeout: u64,
) -> anyhow::Result<()> {
    tracing::info!("Starting HTTP server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    lifecycle.on_ready(addr);

    let shutdown = async move {
        let _ = shutdown_rx.wait_for(|v| *v).await;
    };

    axum::serve(listener, app_router)
        .with_graceful_shutdown(shutdown)
        .await?;

    lifecycle.on_stopping();
    tokio::time::sleep(Duration::from_secs(shutdown_timeout.min(1))).await;
    Ok(())
}

async fn serve_tls(
    addr: &str,
    cfg: &Config,
    app_router: axum::Router,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    lifecycle: &dyn Lifecycle,
    shutdown_timeout: u64,
) -> anyhow::Result<()> {
    use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};

    let (Some(cert_path), Some(key_path)) = (cfg.tls.cert.as_ref(), cfg.tls.key.as_ref()) else {
        anyhow::bail!("TLS enabled but cert or key path missing");
    };

    let certs: Vec<CertificateDer<'static>> =
        CertificateDer::pem_file_iter(cert_path)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    tracing::info!("Starting HTTPS server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    lifecycle.on_ready(addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("TCP accept failed: {e}");
                        continue;
                    }
                };
                let acceptor = tls_acceptor.clone();
                let router = app_router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::debug!("TLS accept error from {peer_addr}: {e}");
                            return;
                        }
                    };
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let service = hyper::service::service_fn(
                        move |req: hyper::Request<hyper::body::Incoming>| {
                            let router = router.clone();
                            async move {
                                let (parts, body) = req.into_parts();
                                let req = axum::http::Request::from_parts(parts, axum::body::Body::new(body));
                                tower::ServiceExt::oneshot(router, req).await
                            }
                        },
                    );
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .serve_connection(io, service)
                    .await
                    {
                        tracing::debug!("TLS connection error from {peer_addr}: {e}");
                    }
                });
            }
            _ = shutdown_rx.wait_for(|v| *v) => {
                tracing::info!("Stopping TLS listener, waiting for connections to drain...");
                break;
            }
        }
    }

    lifecycle.on_stopping();
    tokio::time::sleep(Duration::from_secs(shutdown_timeout.min(5))).await;
    Ok(())
}
