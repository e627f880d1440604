use crate::auth::AuthContext;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Instant;

pub const UNKNOWN: &str = "unknown";

/// Proxy headers trusted for the client address, in priority order.
pub const TRUSTED_IP_HEADERS: [&str; 5] = [
    "cf-connecting-ip",
    "x-real-ip",
    "x-forwarded-for",
    "x-client-ip",
    "true-client-ip",
];

/// Per-request metadata for security decisions, logging and audit.
/// Built once per request and injected as an axum `Extension`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Time-ordered unique identifier (UUID v7). For correlation only.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub start_time: Instant,
    /// Client address, or `"unknown"`.
    pub ip: String,
    pub user_agent: UserAgentInfo,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub auth: Option<AuthContext>,
}

impl RequestContext {
    /// Build a context from request headers. Never fails.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let raw_ua = header_str(headers, "user-agent").unwrap_or(UNKNOWN);
        Self {
            request_id: generate_request_id(),
            timestamp: Utc::now(),
            start_time: Instant::now(),
            ip: extract_client_ip(headers),
            user_agent: UserAgentInfo::parse(raw_ua),
            origin: header_str(headers, "origin").map(str::to_string),
            referer: header_str(headers, "referer").map(str::to_string),
            auth: None,
        }
    }

    /// Final context with the resolved identity attached.
    pub fn with_auth(self, auth: Option<AuthContext>) -> Self {
        Self { auth, ..self }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.auth.as_ref().map(|a| a.user_id.as_str())
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}

pub fn generate_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// First trusted proxy header carrying a well-formed IP wins.
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    for name in TRUSTED_IP_HEADERS {
        let Some(value) = header_str(headers, name) else {
            continue;
        };
        let candidate = if name == "x-forwarded-for" {
            value.split(',').next().unwrap_or("").trim()
        } else {
            value
        };
        if is_valid_ip(candidate) {
            return candidate.to_string();
        }
    }
    UNKNOWN.to_string()
}

pub fn is_valid_ip(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok()
}

/// Best-effort user agent classification. Not authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAgentInfo {
    pub raw: String,
    pub is_bot: bool,
    pub is_mobile: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

const BOT_MARKERS: &[&str] = &[
    "bot", "crawler", "spider", "slurp", "curl", "wget", "python-requests", "headless",
];
const MOBILE_MARKERS: &[&str] = &["mobile", "android", "iphone", "ipad", "ipod", "windows phone"];

// Order matters: Edge and Opera carry "chrome", Chrome carries "safari".
const BROWSERS: &[(&str, &str)] = &[
    ("edg/", "Edge"),
    ("opr/", "Opera"),
    ("opera", "Opera"),
    ("firefox", "Firefox"),
    ("chrome", "Chrome"),
    ("crios", "Chrome"),
    ("safari", "Safari"),
    ("msie", "Internet Explorer"),
    ("trident", "Internet Explorer"),
];

const OPERATING_SYSTEMS: &[(&str, &str)] = &[
    ("windows", "Windows"),
    ("android", "Android"),
    ("iphone", "iOS"),
    ("ipad", "iOS"),
    ("mac os", "macOS"),
    ("macintosh", "macOS"),
    ("cros", "ChromeOS"),
    ("linux", "Linux"),
];

impl UserAgentInfo {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        let find = |table: &[(&str, &str)]| {
            table
                .iter()
                .find(|(needle, _)| lower.contains(needle))
                .map(|(_, name)| name.to_string())
        };
        Self {
            raw: raw.to_string(),
            is_bot: BOT_MARKERS.iter().any(|m| lower.contains(m)),
            is_mobile: MOBILE_MARKERS.iter().any(|m| lower.contains(m)),
            browser: find(BROWSERS),
            os: find(OPERATING_SYSTEMS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_ip_header_priority() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("cf-connecting-ip", "198.51.100.2"),
        ]);
        assert_eq!(extract_client_ip(&h), "198.51.100.2");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(extract_client_ip(&h), "203.0.113.7");
    }

    #[test]
    fn test_invalid_header_falls_through() {
        let h = headers(&[("x-real-ip", "not-an-ip"), ("x-client-ip", "2001:db8::1")]);
        assert_eq!(extract_client_ip(&h), "2001:db8::1");
    }

    #[test]
    fn test_no_headers_unknown() {
        assert_eq!(extract_client_ip(&HeaderMap::new()), UNKNOWN);
        let h = headers(&[("x-forwarded-for", "garbage")]);
        assert_eq!(extract_client_ip(&h), UNKNOWN);
    }

    #[test]
    fn test_user_agent_desktop_chrome() {
        let ua = UserAgentInfo::parse(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
        );
        assert_eq!(ua.browser.as_deref(), Some("Chrome"));
        assert_eq!(ua.os.as_deref(), Some("Windows"));
        assert!(!ua.is_bot);
        assert!(!ua.is_mobile);
    }

    #[test]
    fn test_user_agent_mobile_safari() {
        let ua = UserAgentInfo::parse(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Version/17.0 Mobile/15E148 Safari/604.1",
        );
        assert!(ua.is_mobile);
        assert_eq!(ua.os.as_deref(), Some("iOS"));
        assert_eq!(ua.browser.as_deref(), Some("Safari"));
    }

    #[test]
    fn test_user_agent_bot_and_garbage() {
        assert!(UserAgentInfo::parse("Googlebot/2.1 (+http://www.google.com/bot.html)").is_bot);
        let ua = UserAgentInfo::parse("\u{0}\u{1}???");
        assert!(ua.browser.is_none());
        assert!(ua.os.is_none());
    }

    #[test]
    fn test_context_defaults() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.ip, UNKNOWN);
        assert_eq!(ctx.user_agent.raw, UNKNOWN);
        assert!(ctx.auth.is_none());
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
    }

    #[test]
    fn test_request_ids_unique_and_sortable() {
        let a = generate_request_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
