//! Activity registry: name → type-erased handler

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError, ActivityResult};

/// Type-erased activity handler
pub type ActivityHandler =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, ActivityResult> + Send + Sync>;

/// Registry of activity handlers
///
/// Only the dispatcher invokes registered handlers.
///
/// # Example
///
/// ```ignore
/// let mut activities = ActivityRegistry::new();
/// activities.register(SayHello);
/// activities.register_fn("shout", |_ctx, input| async move {
///     let text: String = serde_json::from_value(input)
///         .map_err(|e| ActivityError::invalid_input(e.to_string()))?;
///     Ok(json!(text.to_uppercase()))
/// });
/// ```
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under `A::NAME`
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx, input| {
            let activity = Arc::clone(&activity);
            async move {
                let typed: A::Input = serde_json::from_value(input)
                    .map_err(|e| ActivityError::invalid_input(e.to_string()))?;
                let output = activity.execute(&ctx, typed).await?;
                serde_json::to_value(output)
                    .map_err(|e| ActivityError::execution(format!("unserializable output: {e}")))
            }
            .boxed()
        });

        self.handlers.insert(A::NAME.to_string(), handler);
    }

    /// Register a closure operating on raw JSON
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<ActivityHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ActivityRegistry")
            .field("activities", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityErrorKind;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    struct Double;

    #[async_trait]
    impl Activity for Double {
        const NAME: &'static str = "double";
        type Input = i64;
        type Output = i64;

        async fn execute(&self, _ctx: &ActivityContext, input: i64) -> Result<i64, ActivityError> {
            Ok(input * 2)
        }
    }

    fn ctx(name: &str) -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), 2, name)
    }

    #[tokio::test]
    async fn test_typed_activity() {
        let mut registry = ActivityRegistry::new();
        registry.register(Double);

        let handler = registry.get("double").unwrap();
        assert_eq!(handler(ctx("double"), json!(21)).await, Ok(json!(42)));
    }

    #[tokio::test]
    async fn test_typed_activity_rejects_bad_input() {
        let mut registry = ActivityRegistry::new();
        registry.register(Double);

        let handler = registry.get("double").unwrap();
        let error = handler(ctx("double"), json!("x")).await.unwrap_err();
        assert_eq!(error.kind, ActivityErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_closure_activity() {
        let mut registry = ActivityRegistry::new();
        registry.register_fn("fail", |_ctx, _input| async {
            Err(ActivityError::execution("always"))
        });

        assert!(registry.contains("fail"));
        assert_eq!(registry.len(), 1);
        let error = registry.get("fail").unwrap()(ctx("fail"), json!(null))
            .await
            .unwrap_err();
        assert_eq!(error.message, "always");
    }

    #[test]
    fn test_missing() {
        let registry = ActivityRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }
}
