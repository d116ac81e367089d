use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use sqlx::PgPool;

use crate::handlers;

pub type HandlerResult = anyhow::Result<Value>;

/// A job handler: gets a database handle and the opaque payload, never the
/// claim itself, so it cannot observe or mutate queue columns.
pub type Handler = Arc<dyn Fn(PgPool, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Process-lifetime mapping from job type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ping", handlers::ping);
        registry.register("location.upsert", handlers::location_upsert);
        registry
    }

    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(PgPool, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(
            job_type.into(),
            Arc::new(move |db, payload| handler(db, payload).boxed()),
        );
    }

    pub fn get(&self, job_type: &str) -> Option<Handler> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_knows_the_shipped_handlers() {
        let registry = HandlerRegistry::builtin();
        assert!(registry.get("ping").is_some());
        assert!(registry.get("location.upsert").is_some());
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.job_types(), vec!["location.upsert", "ping"]);
    }

    #[test]
    fn register_accepts_closures() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", |_db, payload| async move { Ok(json!(payload)) });
        assert!(registry.get("echo").is_some());
    }
}
