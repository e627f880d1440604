use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const INTERNAL_SECRET_ENV: &str = "WARDEN_INTERNAL_SECRET";
pub const JWT_SECRET_ENV: &str = "WARDEN_JWT_SECRET";
/// Upper bound for `jobs.max-backoff-secs` (one week).
pub const MAX_BACKOFF_CEILING_SECS: u64 = 7 * 24 * 60 * 60;

// ─── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub tls: TlsConfig,

    // Logging
    pub logging_to_file: bool,
    pub log_dir: Option<String>,

    // Shared secret for /internal routes
    pub internal_secret: Option<String>,

    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub jobs: JobsConfig,
    pub redirect: RedirectConfig,
    pub cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: TlsConfig::default(),
            logging_to_file: false,
            log_dir: None,
            internal_secret: None,
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            jobs: JobsConfig::default(),
            redirect: RedirectConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a YAML file, sanitize, and validate.
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let mut config: Config = serde_yaml_ng::from_str(contents)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.tls.enable {
            anyhow::ensure!(self.tls.cert.is_some(), "TLS enabled but cert path missing");
            anyhow::ensure!(self.tls.key.is_some(), "TLS enabled but key path missing");
        }
        for (name, tier) in [
            ("public", &self.rate_limit.public),
            ("heavy", &self.rate_limit.heavy),
            ("strict", &self.rate_limit.strict),
        ] {
            anyhow::ensure!(
                tier.max_requests > 0,
                "rate-limit tier '{name}' needs max-requests > 0"
            );
            anyhow::ensure!(
                tier.window_secs > 0,
                "rate-limit tier '{name}' needs window-secs > 0"
            );
        }
        anyhow::ensure!(
            self.jobs.worker.max_runtime_ms > 0,
            "jobs.worker.max-runtime-ms must be > 0"
        );
        anyhow::ensure!(
            self.jobs.default_max_attempts > 0,
            "jobs.default-max-attempts must be > 0"
        );
        anyhow::ensure!(
            self.jobs.max_backoff_secs <= MAX_BACKOFF_CEILING_SECS,
            "jobs.max-backoff-secs must be <= {MAX_BACKOFF_CEILING_SECS}"
        );
        anyhow::ensure!(
            self.jobs.backoff_base_secs <= self.jobs.max_backoff_secs,
            "jobs.backoff-base-secs must be <= jobs.max-backoff-secs"
        );
        anyhow::ensure!(
            self.jobs.lock_timeout_secs <= MAX_BACKOFF_CEILING_SECS,
            "jobs.lock-timeout-secs must be <= {MAX_BACKOFF_CEILING_SECS}"
        );
        for host in &self.redirect.allowed_hosts {
            anyhow::ensure!(
                !host.contains('/') && !host.is_empty(),
                "redirect allowed host '{host}' must be a bare host name"
            );
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        // Empty strings in YAML mean "unset"
        if self.internal_secret.as_deref().is_some_and(str::is_empty) {
            self.internal_secret = None;
        }
        if self.auth.jwt_secret.as_deref().is_some_and(str::is_empty) {
            self.auth.jwt_secret = None;
        }
        for host in self.redirect.allowed_hosts.iter_mut() {
            *host = host.trim().to_ascii_lowercase();
        }
        self.redirect.allowed_hosts.retain(|h| !h.is_empty());
        self.cors.allowed_origins.retain(|o| !o.trim().is_empty());
    }

    /// Internal secret from config, falling back to the environment.
    pub fn resolve_internal_secret(&self) -> Option<String> {
        self.internal_secret
            .clone()
            .or_else(|| std::env::var(INTERNAL_SECRET_ENV).ok())
            .filter(|s| !s.is_empty())
    }
}

// ─── Sub-configs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsConfig {
    pub enable: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_secs: 3600,
        }
    }
}

impl AuthConfig {
    pub fn resolve_jwt_secret(&self) -> Option<String> {
        self.jwt_secret
            .clone()
            .or_else(|| std::env::var(JWT_SECRET_ENV).ok())
            .filter(|s| !s.is_empty())
    }
}

/// What to do when the rate-limit store cannot be reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailMode {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TierLimits {
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub fail_mode: FailMode,
    pub public: TierLimits,
    pub heavy: TierLimits,
    pub strict: TierLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_mode: FailMode::Open,
            public: TierLimits {
                max_requests: 60,
                window_secs: 60,
            },
            heavy: TierLimits {
                max_requests: 10,
                window_secs: 60,
            },
            strict: TierLimits {
                max_requests: 5,
                window_secs: 60,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct JobsConfig {
    pub default_max_attempts: u32,
    pub backoff_base_secs: u64,
    pub max_backoff_secs: u64,
    /// A `running` job locked for longer than this is considered orphaned.
    pub lock_timeout_secs: u64,
    pub worker: WorkerConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            backoff_base_secs: 5,
            max_backoff_secs: 300,
            lock_timeout_secs: 300,
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    pub max_jobs: usize,
    /// Must stay below the host's request timeout.
    pub max_runtime_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10,
            max_runtime_ms: 25_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RedirectConfig {
    pub allowed_hosts: Vec<String>,
    pub fallback: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            fallback: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct CorsConfig {
    /// Empty means permissive.
    pub allowed_origins: Vec<String>,
}

// ─── Config Watcher ────────────────────────────────────────────────────────

pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching a config file. On changes (debounced 150ms, SHA256 dedup),
    /// reload the config and atomically swap it in via ArcSwap.
    pub fn start(
        path: String,
        config: Arc<ArcSwap<Config>>,
        on_reload: impl Fn(&Config) + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })?;
        watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;
            let mut debounce: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        debounce = Some(tokio::time::Instant::now() + Duration::from_millis(150));
                    }
                    _ = async {
                        match debounce {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce = None;
                        let contents = match std::fs::read(&path) {
                            Ok(c) => c,
                            Err(e) => {
                                tracing::error!(path = %path, "Config file read failed: {e}");
                                continue;
                            }
                        };
                        let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                        if last_hash.as_ref() == Some(&hash) {
                            continue;
                        }
                        last_hash = Some(hash);

                        match Config::load(&path) {
                            Ok(new_cfg) => {
                                tracing::info!(path = %path, "Configuration reloaded");
                                on_reload(&new_cfg);
                                config.store(Arc::new(new_cfg));
                            }
                            Err(e) => {
                                tracing::error!(path = %path, "Config reload failed, keeping previous: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}
