//! Filesystem snapshot store: one directory per entity, one immutable JSON
//! file per snapshot.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fcap_core::{Entity, Snapshot};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::snapshot::{next_snapshot_time, SnapshotStore, StoreError};

#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entity ids are arbitrary strings, so directories are keyed by their hash.
    pub fn entity_dir(&self, entity_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(entity_id.as_bytes());
        self.root.join(hex::encode(hasher.finalize()))
    }

    pub fn snapshot_file_name(snapshot: &Snapshot) -> String {
        format!("{:020}_{}.json", snapshot.taken_at.timestamp_micros(), snapshot.id)
    }

    /// Snapshot files of an entity, oldest first, keyed by their timestamp.
    async fn list_entries(&self, entity_id: &str) -> Result<Vec<(i64, PathBuf)>, StoreError> {
        let dir = self.entity_dir(entity_id);
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let Some(stamp) = name.split('_').next().and_then(|s| s.parse::<i64>().ok()) else {
                return Err(StoreError::Corrupt {
                    location: entry.path().display().to_string(),
                    reason: "file name has no timestamp prefix".to_string(),
                });
            };
            entries.push((stamp, entry.path()));
        }
        entries.sort();
        Ok(entries)
    }

    async fn read_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_atomically(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let final_path = dir.join(file_name);
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(final_path)
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn get_latest(&self, entity_id: &str) -> Result<Snapshot, StoreError> {
        let entries = self.list_entries(entity_id).await?;
        match entries.last() {
            Some((_, path)) => Self::read_snapshot(path).await,
            None => Err(StoreError::NotFound {
                entity_id: entity_id.to_string(),
            }),
        }
    }

    async fn put(&self, entity: &Entity) -> Result<Snapshot, StoreError> {
        let dir = self.entity_dir(&entity.id);
        fs::create_dir_all(&dir).await?;

        let latest = self
            .list_entries(&entity.id)
            .await?
            .last()
            .and_then(|(micros, _)| DateTime::<Utc>::from_timestamp_micros(*micros));
        let snapshot = Snapshot::capture(entity, next_snapshot_time(latest));
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = Self::write_atomically(&dir, &Self::snapshot_file_name(&snapshot), &bytes).await?;
        debug!(entity_id = %entity.id, path = %path.display(), "snapshot written");
        Ok(snapshot)
    }

    async fn history_page(
        &self,
        entity_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let cutoff = before.map(|ts| ts.timestamp_micros());
        let entries = self.list_entries(entity_id).await?;
        let mut page = Vec::new();
        for (_, path) in entries
            .iter()
            .rev()
            .filter(|(micros, _)| cutoff.map_or(true, |c| *micros < c))
            .take(limit)
        {
            page.push(Self::read_snapshot(path).await?);
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::HistoryPager;
    use fcap_core::FieldValue;
    use tempfile::tempdir;

    fn entity(stage: &str) -> Entity {
        let mut entity = Entity::new("acme/robotics");
        entity
            .fields
            .insert("funding_stage".into(), FieldValue::Enum(stage.into()));
        entity
    }

    #[tokio::test]
    async fn snapshots_survive_reopen_and_stay_ordered() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        store.put(&entity("Seed")).await.expect("first put");
        store.put(&entity("Series A")).await.expect("second put");

        let reopened = FsSnapshotStore::new(dir.path());
        let latest = reopened.get_latest("acme/robotics").await.expect("latest");
        assert_eq!(latest.fields["funding_stage"], FieldValue::Enum("Series A".into()));

        let history = HistoryPager::new(&reopened, "acme/robotics", 1)
            .collect_all()
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
        assert!(history[0].taken_at > history[1].taken_at);
    }

    #[tokio::test]
    async fn puts_never_overwrite_earlier_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        for _ in 0..3 {
            store.put(&entity("Seed")).await.expect("put");
        }
        let files = std::fs::read_dir(store.entity_dir("acme/robotics"))
            .expect("entity dir")
            .count();
        assert_eq!(files, 3);
    }

    #[tokio::test]
    async fn missing_entity_reports_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        assert!(store.get_latest("nobody").await.unwrap_err().is_not_found());
        assert!(store.history_page("nobody", 10, None).await.unwrap().is_empty());
    }
}
