//! Jobs shipped with the service.

use super::{Job, JobDefinition, JobHandler, JobRegistry};
use crate::config::JobsConfig;
use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

pub const WELCOME_EMAIL: &str = "email:welcome";
pub const USER_EXPORT: &str = "user:export";
pub const SAMPLE_PROCESS: &str = "sample:process";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WelcomeEmailPayload {
    to: String,
    name: Option<String>,
}

/// Renders the welcome message. Delivery is left to the mail relay that
/// consumes the job result.
pub struct WelcomeEmailJob;

#[async_trait]
impl JobHandler for WelcomeEmailJob {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        let payload: WelcomeEmailPayload =
            serde_json::from_value(job.payload.clone()).context("invalid welcome email payload")?;
        if !payload.to.contains('@') {
            bail!("recipient '{}' is not an email address", payload.to);
        }
        let greeting = match payload.name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("Welcome, {}!", name.trim()),
            _ => "Welcome!".to_string(),
        };
        tracing::info!(job_id = %job.id, "Welcome email rendered");
        Ok(json!({
            "to": payload.to,
            "subject": greeting,
            "template": "welcome",
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserExportPayload {
    user_id: String,
    #[serde(default = "default_export_format")]
    format: String,
}

fn default_export_format() -> String {
    "json".to_string()
}

pub struct UserExportJob;

#[async_trait]
impl JobHandler for UserExportJob {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        let payload: UserExportPayload =
            serde_json::from_value(job.payload.clone()).context("invalid user export payload")?;
        if payload.user_id.is_empty() {
            bail!("userId must not be empty");
        }
        if !matches!(payload.format.as_str(), "json" | "csv") {
            bail!("unsupported export format '{}'", payload.format);
        }
        Ok(json!({
            "userId": payload.user_id,
            "format": payload.format,
            "exportId": uuid::Uuid::new_v4(),
        }))
    }
}

/// Counts the keys of the payload. Used by the sample endpoint.
pub struct SampleProcessJob;

#[async_trait]
impl JobHandler for SampleProcessJob {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        let fields = job.payload.as_object().map_or(0, |o| o.len());
        Ok(json!({ "fields": fields }))
    }
}

impl JobRegistry {
    /// Registry with every built-in job.
    pub fn builtin(config: &JobsConfig) -> Self {
        let attempts = config.default_max_attempts;
        Self::new()
            .register(WELCOME_EMAIL, JobDefinition::new("email", attempts, 10), WelcomeEmailJob)
            .register(USER_EXPORT, JobDefinition::new("exports", attempts, 0), UserExportJob)
            .register(SAMPLE_PROCESS, JobDefinition::new("default", attempts, 0), SampleProcessJob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn job(name: &str, payload: Value) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            name: name.into(),
            queue: "default".into(),
            payload,
            status: JobStatus::Running,
            priority: 0,
            run_at: now,
            locked_at: Some(now),
            locked_by: Some("w".into()),
            attempt: 0,
            max_attempts: 3,
            last_error: None,
            result: None,
            dedup_key: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = JobRegistry::builtin(&JobsConfig::default());
        assert!(registry.contains(WELCOME_EMAIL));
        assert!(registry.contains(USER_EXPORT));
        assert!(registry.contains(SAMPLE_PROCESS));
        assert_eq!(registry.queues(), vec!["default", "email", "exports"]);
    }

    #[tokio::test]
    async fn test_welcome_email() {
        let out = WelcomeEmailJob
            .handle(&job(WELCOME_EMAIL, json!({"to": "a@example.com", "name": "Ada"})))
            .await
            .unwrap();
        assert_eq!(out["subject"], "Welcome, Ada!");

        let err = WelcomeEmailJob
            .handle(&job(WELCOME_EMAIL, json!({"to": "nobody"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an email"));
    }

    #[tokio::test]
    async fn test_user_export_requires_user() {
        assert!(UserExportJob.handle(&job(USER_EXPORT, json!({}))).await.is_err());
        let out = UserExportJob
            .handle(&job(USER_EXPORT, json!({"userId": "u1"})))
            .await
            .unwrap();
        assert_eq!(out["format"], "json");
    }
}
