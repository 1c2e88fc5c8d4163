//! Postgres-backed snapshot history (append-only `entity_snapshots` table).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fcap_core::{Entity, FieldMap, Snapshot};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::snapshot::{next_snapshot_time, SnapshotStore, StoreError};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entity_snapshots (
    id UUID PRIMARY KEY,
    entity_id TEXT NOT NULL,
    taken_at TIMESTAMPTZ NOT NULL,
    fields JSONB NOT NULL,
    last_checked JSONB NOT NULL DEFAULT '{}'::jsonb,
    content_hash TEXT NOT NULL
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS entity_snapshots_entity_taken_idx \
    ON entity_snapshots (entity_id, taken_at DESC)";

const SELECT_COLUMNS: &str = "SELECT id, entity_id, taken_at, fields, last_checked, content_hash \
    FROM entity_snapshots";

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the snapshot table and its lookup index if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        info!("entity_snapshots schema ready");
        Ok(())
    }

    fn decode(row: &PgRow) -> Result<Snapshot, StoreError> {
        let Json(fields): Json<FieldMap> = row.try_get("fields")?;
        let Json(last_checked): Json<BTreeMap<String, DateTime<Utc>>> = row.try_get("last_checked")?;
        Ok(Snapshot {
            id: row.try_get::<Uuid, _>("id")?,
            entity_id: row.try_get("entity_id")?,
            taken_at: row.try_get("taken_at")?,
            fields,
            last_checked,
            content_hash: row.try_get("content_hash")?,
        })
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get_latest(&self, entity_id: &str) -> Result<Snapshot, StoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE entity_id = $1 ORDER BY taken_at DESC LIMIT 1"
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::decode(&row),
            None => Err(StoreError::NotFound {
                entity_id: entity_id.to_string(),
            }),
        }
    }

    async fn put(&self, entity: &Entity) -> Result<Snapshot, StoreError> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT max(taken_at) FROM entity_snapshots WHERE entity_id = $1")
                .bind(&entity.id)
                .fetch_one(&self.pool)
                .await?;
        let snapshot = Snapshot::capture(entity, next_snapshot_time(latest));

        sqlx::query(
            "INSERT INTO entity_snapshots (id, entity_id, taken_at, fields, last_checked, content_hash) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(snapshot.id)
        .bind(&snapshot.entity_id)
        .bind(snapshot.taken_at)
        .bind(Json(snapshot.fields.clone()))
        .bind(Json(snapshot.last_checked.clone()))
        .bind(&snapshot.content_hash)
        .execute(&self.pool)
        .await?;
        Ok(snapshot)
    }

    async fn history_page(
        &self,
        entity_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE entity_id = $1 AND ($2::timestamptz IS NULL OR taken_at < $2) \
             ORDER BY taken_at DESC LIMIT $3"
        ))
        .bind(entity_id)
        .bind(before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }
}
