//! Greeting orchestration
//!
//! Greets a fixed list of cities in parallel and completes with the
//! greetings in city order.

use async_trait::async_trait;
use relay_durable::{
    Activity, ActivityContext, ActivityError, ActivityOutcome, Orchestration, OrchestrationAction,
    OrchestrationContext, OrchestrationError,
};
use serde_json::json;

/// Cities greeted by the demo instance
pub const DEFAULT_CITIES: [&str; 3] = ["Tokyo", "Seattle", "London"];

/// Returns `"Hello {name}!"`
pub struct SayHello;

#[async_trait]
impl Activity for SayHello {
    const NAME: &'static str = "say_hello";
    type Input = String;
    type Output = String;

    async fn execute(&self, ctx: &ActivityContext, name: String) -> Result<String, ActivityError> {
        tracing::info!(
            instance_id = %ctx.instance_id,
            sequence = ctx.sequence,
            %name,
            "saying hello"
        );
        Ok(format!("Hello {name}!"))
    }
}

/// Fans out one `say_hello` per city and collects the results
pub struct HelloCities {
    cities: Vec<String>,
}

impl HelloCities {
    pub fn default_input() -> Vec<String> {
        DEFAULT_CITIES.iter().map(|c| c.to_string()).collect()
    }
}

impl Orchestration for HelloCities {
    const NAME: &'static str = "hello_cities";
    type Input = Vec<String>;
    type Output = Vec<String>;

    fn new(cities: Vec<String>) -> Self {
        Self { cities }
    }

    fn on_start(&mut self, ctx: &OrchestrationContext) -> Vec<OrchestrationAction> {
        if !ctx.is_replaying() {
            tracing::info!(instance_id = %ctx.instance_id(), cities = self.cities.len(), "saying hello");
        }

        if self.cities.is_empty() {
            return vec![OrchestrationAction::complete(json!([]))];
        }

        self.cities
            .iter()
            .map(|city| OrchestrationAction::schedule_activity(SayHello::NAME, json!(city)))
            .collect()
    }

    fn on_activities_resolved(
        &mut self,
        ctx: &OrchestrationContext,
        outcomes: Vec<ActivityOutcome>,
    ) -> Vec<OrchestrationAction> {
        let mut greetings = Vec::with_capacity(outcomes.len());

        for (city, outcome) in self.cities.iter().zip(&outcomes) {
            match outcome {
                ActivityOutcome::Completed(value) => greetings.push(value.clone()),
                ActivityOutcome::Failed(error) => {
                    return vec![OrchestrationAction::fail(OrchestrationError::new(format!(
                        "greeting {city} failed: {error}"
                    )))];
                }
                ActivityOutcome::Abandoned => {}
            }
        }

        if !ctx.is_replaying() {
            tracing::info!(instance_id = %ctx.instance_id(), "all greetings collected");
        }
        vec![OrchestrationAction::complete(json!(greetings))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_say_hello() {
        let ctx = ActivityContext::new(Uuid::now_v7(), 2, SayHello::NAME);
        let greeting = SayHello.execute(&ctx, "Tokyo".to_string()).await.unwrap();
        assert_eq!(greeting, "Hello Tokyo!");
    }

    #[test]
    fn test_default_input() {
        assert_eq!(HelloCities::default_input(), vec!["Tokyo", "Seattle", "London"]);
    }
}
