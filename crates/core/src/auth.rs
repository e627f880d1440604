//! Identity model and the resolver boundary to the external session provider.

use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Moderator,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    /// Position in the role hierarchy, lowest first.
    pub fn rank(self) -> u8 {
        match self {
            Self::User => 0,
            Self::Moderator => 1,
            Self::Admin => 2,
            Self::SuperAdmin => 3,
        }
    }

    /// Hierarchy-aware comparison. The route pipeline does not use this; its
    /// role check is plain membership.
    pub fn at_least(self, other: Role) -> bool {
        self.rank() >= other.rank()
    }

    /// Permissions every holder of the role gets.
    pub fn default_permissions(self) -> &'static [&'static str] {
        match self {
            Self::User => &["profile:read", "profile:write"],
            Self::Moderator => &["profile:read", "profile:write", "content:moderate"],
            Self::Admin => &[
                "profile:read",
                "profile:write",
                "content:moderate",
                "users:read",
                "users:write",
                "jobs:dispatch",
            ],
            Self::SuperAdmin => &[
                "profile:read",
                "profile:write",
                "content:moderate",
                "users:read",
                "users:write",
                "jobs:dispatch",
                "system:admin",
            ],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            "super_admin" => Ok(Self::SuperAdmin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Resolved identity of the caller. Read-only for the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    pub permissions: BTreeSet<String>,
}

impl AuthContext {
    /// Context carrying exactly the role's default permissions.
    pub fn for_role(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            role,
            permissions: role
                .default_permissions()
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// All-of check: every listed permission must be held.
    pub fn has_all_permissions<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|p| self.has_permission(p.as_ref()))
    }

    /// Permissions from `required` the caller lacks.
    pub fn missing_permissions<S: AsRef<str>>(&self, required: &[S]) -> Vec<String> {
        required
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| !self.has_permission(p))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Source of caller identity.
///
/// `Ok(None)` means "no session" and is not an error. `Err` is reserved for
/// infrastructure failures of the identity provider.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<AuthContext>, AuthError>;
}

/// Resolver for deployments without an identity provider.
pub struct NoAuthResolver;

#[async_trait]
impl AuthResolver for NoAuthResolver {
    async fn resolve(&self, _headers: &HeaderMap) -> Result<Option<AuthContext>, AuthError> {
        Ok(None)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    pub exp: usize,
    pub iat: usize,
}

/// Resolves HS256 bearer tokens issued by the session provider.
pub struct JwtAuthResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

#[async_trait]
impl AuthResolver for JwtAuthResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<AuthContext>, AuthError> {
        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };

        let data = match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data,
            Err(e) => {
                // A bad or expired token is an anonymous caller, not a failure
                tracing::debug!(kind = ?e.kind(), "Rejected bearer token");
                return Ok(None);
            }
        };

        let claims = data.claims;
        let mut ctx = AuthContext::for_role(claims.sub, claims.role);
        ctx.email = claims.email;
        ctx.permissions.extend(claims.permissions);
        Ok(Some(ctx))
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Mint a token for a user. Used for local development and tests.
pub fn issue_token(
    user_id: &str,
    email: Option<&str>,
    role: Role,
    permissions: &[String],
    secret: &str,
    ttl_secs: u64,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.map(str::to_string),
        role,
        permissions: permissions.to_vec(),
        iat: now,
        exp: now + ttl_secs as usize,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}
