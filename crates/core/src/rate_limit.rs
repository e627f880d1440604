use crate::config::{FailMode, RateLimitConfig, TierLimits};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};

/// Named limit classes. Mutating or expensive routes use tighter tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    Public,
    Heavy,
    Strict,
}

impl RateLimitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Heavy => "heavy",
            Self::Strict => "strict",
        }
    }

    fn limits(self, config: &RateLimitConfig) -> TierLimits {
        match self {
            Self::Public => config.public,
            Self::Heavy => config.heavy,
            Self::Strict => config.strict,
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    /// Requests left in the window. Zero on the last allowed request.
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitResult {
    /// Whole seconds until the window resets, never negative.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }
}

/// Counter state of one window after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Backing store for rate-limit counters. `hit` must be a single atomic
/// increment so concurrent requests observe one consistent window.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError>;
}

/// In-process fixed-window counters.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, WindowCount>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that have already reset. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.reset_at > now);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut entry = self.windows.entry(key.to_string()).or_insert(WindowCount {
            count: 0,
            reset_at: now + window,
        });
        if entry.reset_at <= now {
            *entry = WindowCount {
                count: 0,
                reset_at: now + window,
            };
        }
        entry.count = entry.count.saturating_add(1);
        Ok(*entry)
    }
}

/// Deterministic limiter key for a client and route. Passing the method
/// isolates mutations from reads on the same path.
pub fn rate_limit_key(ip: &str, path: &str, method: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    if let Some(method) = method {
        hasher.update(b"|");
        hasher.update(method.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    format!("rl:{hex}")
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RwLock<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            config: RwLock::new(config.clone()),
        }
    }

    /// Update configuration (called on hot-reload).
    pub fn update_config(&self, config: &RateLimitConfig) {
        if let Ok(mut cfg) = self.config.write() {
            *cfg = config.clone();
        }
    }

    fn snapshot(&self) -> RateLimitConfig {
        match self.config.read() {
            Ok(cfg) => cfg.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn limit(&self, key: &str, tier: RateLimitTier) -> RateLimitResult {
        self.limit_at(key, tier, Utc::now()).await
    }

    pub async fn limit_at(
        &self,
        key: &str,
        tier: RateLimitTier,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let config = self.snapshot();
        let limits = tier.limits(&config);
        let window = Duration::seconds(limits.window_secs as i64);

        if !config.enabled {
            return RateLimitResult {
                allowed: true,
                limit: limits.max_requests,
                remaining: limits.max_requests,
                reset_at: now + window,
            };
        }

        match self.store.hit(key, window, now).await {
            Ok(counted) => RateLimitResult {
                allowed: counted.count <= limits.max_requests,
                limit: limits.max_requests,
                remaining: limits.max_requests.saturating_sub(counted.count),
                reset_at: counted.reset_at,
            },
            Err(e) => match config.fail_mode {
                FailMode::Open => {
                    tracing::warn!(
                        key = %key,
                        tier = tier.as_str(),
                        "Rate limit store unavailable, allowing request: {e}"
                    );
                    RateLimitResult {
                        allowed: true,
                        limit: limits.max_requests,
                        remaining: limits.max_requests,
                        reset_at: now + window,
                    }
                }
                FailMode::Closed => {
                    tracing::error!(
                        key = %key,
                        tier = tier.as_str(),
                        "Rate limit store unavailable, denying request: {e}"
                    );
                    RateLimitResult {
                        allowed: false,
                        limit: limits.max_requests,
                        remaining: 0,
                        reset_at: now + window,
                    }
                }
            },
        }
    }
}
