//! Append-only snapshot history per entity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fcap_core::{Entity, EntityId, Snapshot};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no snapshot recorded for entity `{entity_id}`")]
    NotFound { entity_id: EntityId },
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt snapshot store entry {location}: {reason}")]
    Corrupt { location: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Persists the last-known state of each entity and its full history.
///
/// `put` never overwrites or deletes earlier snapshots. Writers for the same
/// entity are expected to be serialized by the caller; when they are not, the
/// later write becomes the latest snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Highest-timestamp snapshot, or `StoreError::NotFound` if the entity was
    /// never observed.
    async fn get_latest(&self, entity_id: &str) -> Result<Snapshot, StoreError>;

    /// Appends a new snapshot of `entity` stamped with the current time.
    async fn put(&self, entity: &Entity) -> Result<Snapshot, StoreError>;

    /// Up to `limit` snapshots strictly older than `before`, newest first.
    async fn history_page(
        &self,
        entity_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Like `get_latest`, with "never observed" mapped to `None`.
    async fn find_latest(&self, entity_id: &str) -> Result<Option<Snapshot>, StoreError> {
        match self.get_latest(entity_id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Timestamp for a new snapshot: now at microsecond precision, bumped past
/// `latest` so snapshots of one entity stay strictly ordered.
pub fn next_snapshot_time(latest: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
    match latest {
        Some(latest) if latest >= now => latest + Duration::microseconds(1),
        _ => now,
    }
}

/// Lazy, restartable walk over an entity's history, newest first.
pub struct HistoryPager<'a> {
    store: &'a dyn SnapshotStore,
    entity_id: String,
    page_size: usize,
    cursor: Option<DateTime<Utc>>,
    exhausted: bool,
}

impl<'a> HistoryPager<'a> {
    pub fn new(store: &'a dyn SnapshotStore, entity_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            store,
            entity_id: entity_id.into(),
            page_size: page_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    /// Resumes a walk from a cursor returned by an earlier pager.
    pub fn starting_before(mut self, cursor: DateTime<Utc>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// `taken_at` of the oldest snapshot yielded so far.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Snapshot>>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .store
            .history_page(&self.entity_id, self.page_size, self.cursor)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(oldest) => {
                self.cursor = Some(oldest.taken_at);
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Drains the remaining pages.
    pub async fn collect_all(mut self) -> Result<Vec<Snapshot>, StoreError> {
        let mut out = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    // Each history is kept oldest first.
    histories: RwLock<HashMap<EntityId, Vec<Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, entity_id: &str) -> usize {
        self.histories
            .read()
            .await
            .get(entity_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get_latest(&self, entity_id: &str) -> Result<Snapshot, StoreError> {
        self.histories
            .read()
            .await
            .get(entity_id)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| StoreError::NotFound {
                entity_id: entity_id.to_string(),
            })
    }

    async fn put(&self, entity: &Entity) -> Result<Snapshot, StoreError> {
        let mut histories = self.histories.write().await;
        let history = histories.entry(entity.id.clone()).or_default();
        let taken_at = next_snapshot_time(history.last().map(|s| s.taken_at));
        let snapshot = Snapshot::capture(entity, taken_at);
        history.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn history_page(
        &self,
        entity_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let histories = self.histories.read().await;
        let Some(history) = histories.get(entity_id) else {
            return Ok(Vec::new());
        };
        Ok(history
            .iter()
            .rev()
            .filter(|s| before.map_or(true, |cursor| s.taken_at < cursor))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcap_core::FieldValue;

    fn entity_with_funding(amount: f64) -> Entity {
        let mut entity = Entity::new("acme");
        entity
            .fields
            .insert("total_funding".into(), FieldValue::Number(amount));
        entity
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let store = InMemorySnapshotStore::new();
        let err = store.get_latest("ghost").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.find_latest("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn puts_append_and_latest_wins() {
        let store = InMemorySnapshotStore::new();
        let first = store.put(&entity_with_funding(1.0)).await.unwrap();
        let second = store.put(&entity_with_funding(2.0)).await.unwrap();

        assert!(second.taken_at > first.taken_at);
        assert_eq!(store.len("acme").await, 2);
        let latest = store.get_latest("acme").await.unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.fields["total_funding"], FieldValue::Number(2.0));
    }

    #[tokio::test]
    async fn pager_walks_newest_first_and_resumes_from_cursor() {
        let store = InMemorySnapshotStore::new();
        for amount in 0..5 {
            store.put(&entity_with_funding(amount as f64)).await.unwrap();
        }

        let mut pager = HistoryPager::new(&store, "acme", 2);
        let first_page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].fields["total_funding"], FieldValue::Number(4.0));
        assert_eq!(first_page[1].fields["total_funding"], FieldValue::Number(3.0));

        let cursor = pager.cursor().unwrap();
        let rest = HistoryPager::new(&store, "acme", 2)
            .starting_before(cursor)
            .collect_all()
            .await
            .unwrap();
        let amounts: Vec<_> = rest
            .iter()
            .map(|s| s.fields["total_funding"].clone())
            .collect();
        assert_eq!(
            amounts,
            vec![
                FieldValue::Number(2.0),
                FieldValue::Number(1.0),
                FieldValue::Number(0.0)
            ]
        );
    }

    #[test]
    fn snapshot_time_is_bumped_past_a_future_latest() {
        let future = Utc::now() + Duration::seconds(60);
        assert_eq!(next_snapshot_time(Some(future)), future + Duration::microseconds(1));
    }
}
