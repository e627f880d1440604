use super::Job;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Static routing and retry settings of a job name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub queue: String,
    pub max_attempts: u32,
    /// Higher runs first.
    pub priority: i32,
}

impl JobDefinition {
    pub fn new(queue: impl Into<String>, max_attempts: u32, priority: i32) -> Self {
        Self {
            queue: queue.into(),
            max_attempts: max_attempts.max(1),
            priority,
        }
    }
}

/// Business logic of a job. Errors and panics count as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        (self.0)(job.clone()).await
    }
}

struct RegisteredJob {
    definition: JobDefinition,
    handler: Arc<dyn JobHandler>,
}

/// Table of every job name the system accepts. Dispatch of a name missing
/// here is rejected before anything reaches the store.
#[derive(Default)]
pub struct JobRegistry {
    entries: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        definition: JobDefinition,
        handler: impl JobHandler + 'static,
    ) -> Self {
        let name = name.into();
        if self.entries.contains_key(&name) {
            tracing::warn!(job = %name, "Job registered twice, replacing previous definition");
        }
        self.entries.insert(
            name,
            RegisteredJob {
                definition,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn definition(&self, name: &str) -> Option<&JobDefinition> {
        self.entries.get(name).map(|e| &e.definition)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.entries.get(name).map(|e| e.handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names with their definitions, sorted by name.
    pub fn definitions(&self) -> Vec<(String, JobDefinition)> {
        let mut defs: Vec<_> = self
            .entries
            .iter()
            .map(|(name, e)| (name.clone(), e.definition.clone()))
            .collect();
        defs.sort_by(|a, b| a.0.cmp(&b.0));
        defs
    }

    /// Every queue some registered job routes to.
    pub fn queues(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|e| e.definition.queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
