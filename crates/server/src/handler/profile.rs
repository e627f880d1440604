use crate::AppState;
use crate::pipeline::{HandlerInput, RouteOptions, secure};
use crate::response;
use axum::http::Method;
use axum::response::Response;
use axum::routing::MethodRouter;
use chrono::Utc;
use warden_core::error::ApiError;
use warden_core::profile::{Profile, ProfileUpdate};
use warden_core::rate_limit::RateLimitTier;
use warden_core::validation::{Field, Schema};

/// `GET /v1/profile` reads and `PATCH` edits the caller's own profile.
pub fn routes() -> MethodRouter<AppState> {
    secure(
        RouteOptions::new().require_permissions(["profile:read"]),
        get_profile,
    )
    .and(secure(
        RouteOptions::new()
            .methods([Method::PATCH])
            .rate_limit(RateLimitTier::Heavy)
            .limit_by_method()
            .require_permissions(["profile:write"])
            .body_schema(
                Schema::new()
                    .field("displayName", Field::string().min_len(1).max_len(80))
                    .field("bio", Field::string().max_len(500)),
            ),
        update_profile,
    ))
    .into_method_router()
}

async fn get_profile(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let auth = input.auth()?;
    let profile = state
        .profiles
        .get(&auth.user_id)
        .await?
        .unwrap_or_else(|| Profile::empty(auth.user_id.clone(), auth.email.clone()));
    Ok(response::ok(profile))
}

async fn update_profile(state: AppState, input: HandlerInput) -> Result<Response, ApiError> {
    let auth = input.auth()?;
    let update: ProfileUpdate = input.body_as()?;

    let mut profile = state
        .profiles
        .get(&auth.user_id)
        .await?
        .unwrap_or_else(|| Profile::empty(auth.user_id.clone(), auth.email.clone()));
    if let Some(name) = update.display_name {
        profile.display_name = Some(name.trim().to_string());
    }
    if let Some(bio) = update.bio {
        profile.bio = Some(bio);
    }
    profile.updated_at = Utc::now();

    let saved = state.profiles.upsert(profile).await?;
    tracing::info!(user_id = %auth.user_id, request_id = %input.ctx.request_id, "Profile updated");
    Ok(response::ok(saved))
}
