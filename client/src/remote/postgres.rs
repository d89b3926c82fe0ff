//! PostgreSQL remote store.
//!
//! Every entity lives in one `entities` table keyed by
//! `(entity_type, entity_id)`. A trigger publishes the key of each changed row
//! on the `rollcall_changes` channel; subscribers listen there and fetch the
//! row.

use super::{
    change_matches, is_conflict, ChangeCallback, ChangeSubscription, RemoteResult, RemoteRow,
    RemoteStore, RemoteWrite,
};
use crate::error::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_engine::{EntityType, Filter, IndexKey, MutationOp, MutationRecord, Query};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Channel the change trigger notifies on.
const CHANGE_CHANNEL: &str = "rollcall_changes";

/// A row of the `entities` table.
#[derive(Debug)]
struct StoredEntity {
    entity_type: String,
    entity_id: String,
    payload: serde_json::Value,
    mutation_id: Option<String>,
    deleted: bool,
    server_ts: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StoredEntity {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            payload: row.try_get("payload")?,
            mutation_id: row.try_get("mutation_id")?,
            deleted: row.try_get("deleted")?,
            server_ts: row.try_get("server_ts")?,
        })
    }
}

impl StoredEntity {
    fn into_remote(self) -> RemoteResult<RemoteRow> {
        let entity_type = self
            .entity_type
            .parse::<EntityType>()
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(RemoteRow {
            entity_type,
            entity_id: self.entity_id,
            payload: self.payload,
            mutation_id: self.mutation_id,
            deleted: self.deleted,
            server_ts: self.server_ts,
        })
    }
}

/// Body of a `rollcall_changes` notification.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeNotice {
    entity_type: String,
    entity_id: String,
}

/// A [`RemoteStore`] backed by PostgreSQL through sqlx.
#[derive(Debug, Clone)]
pub struct PgRemoteStore {
    pool: PgPool,
}

impl PgRemoteStore {
    /// Create a store without connecting.
    ///
    /// Connections are opened on first use, so a kiosk can start while the
    /// database is unreachable and catch up later.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> RemoteResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn upsert(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        let deleted = write.operation == MutationOp::Delete;
        let payload = if deleted {
            serde_json::json!({})
        } else {
            write.payload.clone()
        };

        // `prev` reads the statement snapshot, so it sees the row as it was
        // before this write.
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT server_ts, mutation_id
                FROM entities
                WHERE entity_type = $1 AND entity_id = $2
            ),
            written AS (
                INSERT INTO entities (entity_type, entity_id, payload, mutation_id, deleted)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                    payload = CASE WHEN EXCLUDED.deleted THEN entities.payload ELSE EXCLUDED.payload END,
                    mutation_id = EXCLUDED.mutation_id,
                    deleted = EXCLUDED.deleted,
                    server_ts = clock_timestamp()
                RETURNING server_ts
            )
            SELECT written.server_ts AS server_ts,
                   prev.server_ts AS prev_ts,
                   prev.mutation_id AS prev_mutation_id
            FROM written LEFT JOIN prev ON TRUE
            "#,
        )
        .bind(write.entity_type.as_str())
        .bind(&write.entity_id)
        .bind(&payload)
        .bind(&write.id)
        .bind(deleted)
        .fetch_one(&self.pool)
        .await?;

        let server_ts: DateTime<Utc> = row.try_get("server_ts")?;
        let prev_ts: Option<DateTime<Utc>> = row.try_get("prev_ts")?;
        let prev_mutation_id: Option<String> = row.try_get("prev_mutation_id")?;

        let conflicted = is_conflict(
            prev_ts.map(|ts| (prev_mutation_id.as_deref(), ts)),
            write,
        );
        Ok(RemoteWrite {
            server_ts,
            conflicted,
        })
    }
}

/// Fold equality filters into a JSONB containment document so Postgres can
/// use the GIN index. Range filters are applied afterwards.
fn containment(query: &Query) -> serde_json::Value {
    let mut doc = serde_json::Map::new();
    for filter in query.filters() {
        if let Filter::Eq { field, value } = filter {
            let value = match value {
                IndexKey::Bool(b) => serde_json::Value::from(*b),
                IndexKey::Int(n) => serde_json::Value::from(*n),
                IndexKey::Str(s) => serde_json::Value::from(s.as_str()),
            };
            doc.insert(field.clone(), value);
        }
    }
    serde_json::Value::Object(doc)
}

async fn fetch_one(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
) -> RemoteResult<Option<RemoteRow>> {
    let stored: Option<StoredEntity> = sqlx::query_as(
        r#"
        SELECT entity_type, entity_id, payload, mutation_id, deleted, server_ts
        FROM entities
        WHERE entity_type = $1 AND entity_id = $2
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;
    stored.map(StoredEntity::into_remote).transpose()
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn create(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.upsert(write).await
    }

    async fn update(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.upsert(write).await
    }

    async fn delete(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.upsert(write).await
    }

    async fn query(&self, entity_type: EntityType, query: &Query) -> RemoteResult<Vec<RemoteRow>> {
        let stored: Vec<StoredEntity> = sqlx::query_as(
            r#"
            SELECT entity_type, entity_id, payload, mutation_id, deleted, server_ts
            FROM entities
            WHERE entity_type = $1 AND NOT deleted AND payload @> $2
            ORDER BY entity_id
            "#,
        )
        .bind(entity_type.as_str())
        .bind(containment(query))
        .fetch_all(&self.pool)
        .await?;

        let limit = query.max_results().unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        for row in stored {
            if rows.len() >= limit {
                break;
            }
            if query.matches(&row.payload) {
                rows.push(row.into_remote()?);
            }
        }
        Ok(rows)
    }

    async fn probe(&self) -> RemoteResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn subscribe_to_changes(
        &self,
        entity_type: Option<EntityType>,
        filter: Query,
        callback: ChangeCallback,
    ) -> RemoteResult<ChangeSubscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        let pool = self.pool.clone();
        let task = tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        // PgListener reconnects on the next recv; changes
                        // made meanwhile are picked up by the next query.
                        tracing::warn!(error = %e, "change feed interrupted");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let notice: ChangeNotice = match serde_json::from_str(notification.payload()) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable change notice");
                        continue;
                    }
                };

                match fetch_one(&pool, &notice.entity_type, &notice.entity_id).await {
                    Ok(Some(row)) if change_matches(&row, entity_type, &filter) => callback(row),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(
                        error = %e,
                        entity_type = %notice.entity_type,
                        entity_id = %notice.entity_id,
                        "failed to fetch changed row"
                    ),
                }
            }
        });

        Ok(ChangeSubscription::new(move || task.abort()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn containment_collects_equality_filters() {
        let query = Query::all()
            .eq("studentId", "S1")
            .eq("points", 3i64)
            .since("date", "2024-07-01");
        assert_eq!(containment(&query), json!({"studentId": "S1", "points": 3}));
        assert_eq!(containment(&Query::all()), json!({}));
    }

    #[test]
    fn change_notice_format() {
        let notice: ChangeNotice =
            serde_json::from_str(r#"{"entityType":"attendance","entityId":"S1:2024-07-15"}"#)
                .unwrap();
        assert_eq!(notice.entity_type, "attendance");
        assert_eq!(notice.entity_id, "S1:2024-07-15");
    }

    #[test]
    fn stored_entity_with_unknown_type_fails_to_decode() {
        let stored = StoredEntity {
            entity_type: "pets".into(),
            entity_id: "P1".into(),
            payload: json!({}),
            mutation_id: None,
            deleted: false,
            server_ts: Utc::now(),
        };
        assert!(matches!(stored.into_remote(), Err(RemoteError::Decode(_))));
    }

    #[tokio::test]
    async fn lazy_pool_does_not_connect() {
        let store =
            PgRemoteStore::connect_lazy("postgres://nobody@127.0.0.1:1/none", Duration::from_millis(50))
                .unwrap();
        let err = store.probe().await.unwrap_err();
        assert!(err.is_connectivity(), "{err:?}");
    }
}
