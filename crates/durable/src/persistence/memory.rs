//! In-memory implementation of EventLogStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::orchestration::{HistoryEvent, OrchestrationError, SequencedEvent};

/// Internal instance state
struct InstanceState {
    name: String,
    status: InstanceStatus,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    error: Option<OrchestrationError>,
    published: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<SequencedEvent>,
}

impl InstanceState {
    fn info(&self, id: Uuid) -> InstanceInfo {
        InstanceInfo {
            id,
            name: self.name.clone(),
            status: self.status,
            input: self.input.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            published: self.published,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn last_sequence(&self) -> u64 {
        self.events.last().map(|e| e.sequence).unwrap_or(0)
    }
}

/// In-memory implementation of EventLogStore
///
/// Provides the same semantics as the PostgreSQL implementation; the write
/// lock makes each append atomic. Data does not survive the process.
///
/// # Example
///
/// ```
/// use relay_durable::InMemoryEventLogStore;
///
/// let store = InMemoryEventLogStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryEventLogStore {
    instances: RwLock<HashMap<Uuid, InstanceState>>,
}

impl InMemoryEventLogStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
    }
}

impl Default for InMemoryEventLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLogStore {
    async fn create_instance(
        &self,
        instance_id: Uuid,
        name: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance_id) {
            return Err(StoreError::AlreadyExists(instance_id));
        }

        let now = Utc::now();
        instances.insert(
            instance_id,
            InstanceState {
                name: name.to_string(),
                status: InstanceStatus::Pending,
                input: input.clone(),
                output: None,
                error: None,
                published: false,
                created_at: now,
                updated_at: now,
                events: vec![SequencedEvent {
                    sequence: 1,
                    event: HistoryEvent::OrchestrationStarted {
                        name: name.to_string(),
                        input,
                    },
                    recorded_at: now,
                }],
            },
        );
        Ok(())
    }

    async fn append(
        &self,
        instance_id: Uuid,
        sequence: u64,
        event: HistoryEvent,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        let next = instance.last_sequence() + 1;
        if sequence != next {
            return Err(StoreError::ConcurrencyConflict {
                instance_id,
                expected: sequence,
                actual: next,
            });
        }
        if instance.status.is_terminal() {
            return Err(StoreError::InstanceTerminal(instance_id));
        }

        let now = Utc::now();
        instance.status = instance.status.after(&event);
        match &event {
            HistoryEvent::OrchestrationCompleted { output } => {
                instance.output = Some(output.clone());
            }
            HistoryEvent::OrchestrationFailed { error } => {
                instance.error = Some(error.clone());
            }
            _ => {}
        }
        instance.updated_at = now;
        instance.events.push(SequencedEvent {
            sequence,
            event,
            recorded_at: now,
        });
        Ok(())
    }

    async fn read_history(&self, instance_id: Uuid) -> Result<Vec<SequencedEvent>, StoreError> {
        let instances = self.instances.read();
        let instance = instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        Ok(instance.events.clone())
    }

    async fn instance_info(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError> {
        let instances = self.instances.read();
        instances
            .get(&instance_id)
            .map(|i| i.info(instance_id))
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn set_running(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        if instance.status == InstanceStatus::Pending {
            instance.status = InstanceStatus::Running;
            instance.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_published(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        instance.published = true;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<InstanceInfo>, StoreError> {
        let instances = self.instances.read();
        let mut matching: Vec<InstanceInfo> = instances
            .iter()
            .map(|(id, state)| state.info(*id))
            .filter(|info| filter.matches(info))
            .collect();
        matching.sort_by_key(|info| info.id);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use serde_json::json;
    use std::sync::Arc;

    fn scheduled(sequence: u64) -> HistoryEvent {
        HistoryEvent::ActivityScheduled {
            name: "say_hello".to_string(),
            input: json!("Tokyo"),
            sequence,
        }
    }

    #[tokio::test]
    async fn test_create_records_started_event() {
        let store = InMemoryEventLogStore::new();
        let id = Uuid::now_v7();
        store.create_instance(id, "greeter", json!(null)).await.unwrap();

        let history = store.read_history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sequence, 1);
        assert!(matches!(
            history[0].event,
            HistoryEvent::OrchestrationStarted { .. }
        ));

        let info = store.instance_info(id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryEventLogStore::new();
        let id = Uuid::now_v7();
        store.create_instance(id, "greeter", json!(null)).await.unwrap();

        let result = store.create_instance(id, "greeter", json!(null)).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_read_unknown_instance() {
        let store = InMemoryEventLogStore::new();
        let result = store.read_history(Uuid::now_v7()).await;
        assert!(matches!(result, Err(StoreError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn test_append_requires_next_sequence() {
        let store = InMemoryEventLogStore::new();
        let id = Uuid::now_v7();
        store.create_instance(id, "greeter", json!(null)).await.unwrap();

        // Gap
        let result = store.append(id, 3, scheduled(3)).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 3,
                actual: 2,
                ..
            })
        ));

        store.append(id, 2, scheduled(2)).await.unwrap();

        // Duplicate
        let result = store.append(id, 2, scheduled(2)).await;
        assert!(result.unwrap_err().is_conflict());

        let sequences: Vec<u64> = store
            .read_history(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_one_wins() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let id = Uuid::now_v7();
        store.create_instance(id, "greeter", json!(null)).await.unwrap();
        store.append(id, 2, scheduled(2)).await.unwrap();
        store.append(id, 3, scheduled(3)).await.unwrap();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .append(
                        id,
                        4,
                        HistoryEvent::ActivityCompleted {
                            sequence: 2,
                            result: json!("Hello Tokyo!"),
                        },
                    )
                    .await
            })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .append(
                        id,
                        4,
                        HistoryEvent::ActivityFailed {
                            sequence: 3,
                            error: ActivityError::execution("boom"),
                        },
                    )
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn test_terminal_event_updates_projection() {
        let store = InMemoryEventLogStore::new();
        let id = Uuid::now_v7();
        store.create_instance(id, "greeter", json!(null)).await.unwrap();
        store
            .append(
                id,
                2,
                HistoryEvent::OrchestrationCompleted {
                    output: json!(["Hello Tokyo!"]),
                },
            )
            .await
            .unwrap();

        let info = store.instance_info(id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Completed);
        assert_eq!(info.output, Some(json!(["Hello Tokyo!"])));
        assert!(!info.published);

        let result = store
            .append(
                id,
                3,
                HistoryEvent::OrchestrationFailed {
                    error: OrchestrationError::new("late"),
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::InstanceTerminal(_))));

        store.mark_published(id).await.unwrap();
        assert!(store.instance_info(id).await.unwrap().published);
    }

    #[tokio::test]
    async fn test_list_instances_filters() {
        let store = InMemoryEventLogStore::new();
        let pending = Uuid::now_v7();
        let done = Uuid::now_v7();
        store.create_instance(pending, "g", json!(null)).await.unwrap();
        store.create_instance(done, "g", json!(null)).await.unwrap();
        store
            .append(
                done,
                2,
                HistoryEvent::OrchestrationCompleted { output: json!([]) },
            )
            .await
            .unwrap();

        let active = store.list_instances(InstanceFilter::active()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, pending);

        let unpublished = store
            .list_instances(InstanceFilter::unpublished())
            .await
            .unwrap();
        assert_eq!(unpublished.len(), 1);
        assert_eq!(unpublished[0].id, done);
    }

    #[tokio::test]
    async fn test_set_running_only_from_pending() {
        let store = InMemoryEventLogStore::new();
        let id = Uuid::now_v7();
        store.create_instance(id, "g", json!(null)).await.unwrap();

        store.set_running(id).await.unwrap();
        assert_eq!(
            store.instance_info(id).await.unwrap().status,
            InstanceStatus::Running
        );

        store
            .append(id, 2, HistoryEvent::OrchestrationCompleted { output: json!([]) })
            .await
            .unwrap();
        store.set_running(id).await.unwrap();
        assert_eq!(
            store.instance_info(id).await.unwrap().status,
            InstanceStatus::Completed
        );
    }
}
