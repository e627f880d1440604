pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod profile;
pub mod rate_limit;
pub mod sanitize;
pub mod validation;
