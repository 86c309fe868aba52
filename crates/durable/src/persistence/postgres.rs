//! PostgreSQL implementation of EventLogStore
//!
//! Production persistence using PostgreSQL with:
//! - Gapless per-instance sequences checked under a row lock
//! - Status/output projection updated in the same transaction as the append

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::orchestration::{HistoryEvent, SequencedEvent};

/// PostgreSQL implementation of EventLogStore
///
/// # Example
///
/// ```ignore
/// use relay_durable::PostgresEventLogStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/relay").await?;
/// let store = PostgresEventLogStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventLogStore {
    pool: PgPool,
}

impl PostgresEventLogStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and build a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn instance_from_row(row: &PgRow) -> Result<InstanceInfo, StoreError> {
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");
    let published_at: Option<DateTime<Utc>> = row.get("published_at");

    Ok(InstanceInfo {
        id: row.get("id"),
        name: row.get("orchestration_name"),
        status: status.parse()?,
        input: row.get("input"),
        output: row.get("output"),
        error: error_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        published: published_at.is_some(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const INSTANCE_COLUMNS: &str = "id, orchestration_name, status, input, output, error, \
                                published_at, created_at, updated_at";

#[async_trait]
impl EventLogStore for PostgresEventLogStore {
    #[instrument(skip(self, input))]
    async fn create_instance(
        &self,
        instance_id: Uuid,
        name: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let started = HistoryEvent::OrchestrationStarted {
            name: name.to_string(),
            input: input.clone(),
        };
        let event_data = to_json(&started)?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_instances (id, orchestration_name, status, input)
            VALUES ($1, $2, 'pending', $3)
            "#,
        )
        .bind(instance_id)
        .bind(name)
        .bind(&input)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Err(StoreError::AlreadyExists(instance_id));
                }
            }
            error!("Failed to create instance: {}", e);
            return Err(db_error(e));
        }

        sqlx::query(
            r#"
            INSERT INTO durable_history (instance_id, sequence, event_type, event_data)
            VALUES ($1, 1, $2, $3)
            "#,
        )
        .bind(instance_id)
        .bind(started.event_type())
        .bind(&event_data)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(%instance_id, orchestration = %name, "created instance");
        Ok(())
    }

    #[instrument(skip(self, event), fields(event_type = event.event_type()))]
    async fn append(
        &self,
        instance_id: Uuid,
        sequence: u64,
        event: HistoryEvent,
    ) -> Result<(), StoreError> {
        let event_data = to_json(&event)?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // The instance row lock serializes appends for one instance
        let row = sqlx::query(
            r#"
            SELECT status FROM durable_instances WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;
        let status: InstanceStatus = row.get::<String, _>("status").parse()?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence), 0) AS last_seq
            FROM durable_history
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let next = row.get::<i64, _>("last_seq") as u64 + 1;

        if sequence != next {
            return Err(StoreError::ConcurrencyConflict {
                instance_id,
                expected: sequence,
                actual: next,
            });
        }
        if status.is_terminal() {
            return Err(StoreError::InstanceTerminal(instance_id));
        }

        sqlx::query(
            r#"
            INSERT INTO durable_history (instance_id, sequence, event_type, event_data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(instance_id)
        .bind(sequence as i64)
        .bind(event.event_type())
        .bind(&event_data)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let (output, error_json) = match &event {
            HistoryEvent::OrchestrationCompleted { output } => (Some(output.clone()), None),
            HistoryEvent::OrchestrationFailed { error } => (None, Some(to_json(error)?)),
            _ => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE durable_instances
            SET status = $2,
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.after(&event).to_string())
        .bind(&output)
        .bind(&error_json)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(%instance_id, sequence, "appended event");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_history(&self, instance_id: Uuid) -> Result<Vec<SequencedEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_data, recorded_at
            FROM durable_history
            WHERE instance_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read history: {}", e);
            db_error(e)
        })?;

        if rows.is_empty() {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.get("event_data");
                Ok(SequencedEvent {
                    sequence: row.get::<i64, _>("sequence") as u64,
                    event: serde_json::from_value(data)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn instance_info(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM durable_instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn set_running(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_instances
            SET status = 'running', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            // Either already past pending or missing; only the latter is an error
            self.instance_info(instance_id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_published(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_instances
            SET published_at = COALESCE(published_at, NOW()), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<InstanceInfo>, StoreError> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM durable_instances
            WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
              AND (NOT $2 OR published_at IS NULL)
            ORDER BY id
            "#
        ))
        .bind(&statuses)
        .bind(filter.unpublished_only)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(instance_from_row).collect()
    }
}
