//! Propagates a non-empty patch to the authoritative store, then the query
//! store, then the cache, stopping at the first hard failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fcap_core::{FieldMap, FieldValue, Patch};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{sink} responded with HTTP {status}: {body}")]
    Http {
        sink: &'static str,
        status: u16,
        body: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// One append-only history record handed to the query store next to the
/// full state.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub entity_id: String,
    pub observed_at: DateTime<Utc>,
    pub changes: Patch,
}

impl HistoryEntry {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "entity_id": self.entity_id,
            "observed_at": self.observed_at,
            "changes": self.changes.to_json(),
        })
    }
}

/// System of record. Receives only changed fields; `None` clears a field.
#[async_trait]
pub trait AuthoritativeSink: Send + Sync {
    async fn apply_partial(
        &self,
        entity_id: &str,
        partial: &BTreeMap<String, Option<FieldValue>>,
    ) -> Result<(), SinkError>;
}

/// Read-optimized replica. Receives the full merged state.
#[async_trait]
pub trait QuerySink: Send + Sync {
    async fn upsert(&self, entity_id: &str, state: &FieldMap, history: &HistoryEntry) -> Result<(), SinkError>;
}

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, entity_id: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Pending,
    Fetched,
    Diffed,
    NoOp,
    AuthoritativeUpdated,
    QueryUpdated,
    Invalidated,
    AuthoritativeSinkFailed,
    QuerySinkFailed,
}

#[derive(Debug)]
pub enum UpdateOutcome {
    NoOp,
    Updated {
        invalidated: bool,
        invalidation_error: Option<String>,
    },
    AuthoritativeSinkFailed(SinkError),
    QuerySinkFailed(SinkError),
}

impl UpdateOutcome {
    /// Furthest state reached.
    pub fn stage(&self) -> PipelineStage {
        match self {
            UpdateOutcome::NoOp => PipelineStage::NoOp,
            UpdateOutcome::Updated { invalidated: true, .. } => PipelineStage::Invalidated,
            UpdateOutcome::Updated { invalidated: false, .. } => PipelineStage::QueryUpdated,
            UpdateOutcome::AuthoritativeSinkFailed(_) => PipelineStage::AuthoritativeSinkFailed,
            UpdateOutcome::QuerySinkFailed(_) => PipelineStage::QuerySinkFailed,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::AuthoritativeSinkFailed(_) | UpdateOutcome::QuerySinkFailed(_)
        )
    }
}

#[derive(Clone)]
pub struct Updater {
    authoritative: Arc<dyn AuthoritativeSink>,
    query: Arc<dyn QuerySink>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl Updater {
    pub fn new(
        authoritative: Arc<dyn AuthoritativeSink>,
        query: Arc<dyn QuerySink>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            authoritative,
            query,
            invalidator,
        }
    }

    pub async fn apply(&self, entity_id: &str, state: &FieldMap, patch: &Patch) -> UpdateOutcome {
        if patch.is_empty() {
            debug!(entity_id, "empty patch; no sink contacted");
            return UpdateOutcome::NoOp;
        }

        if let Err(err) = self.authoritative.apply_partial(entity_id, &patch.partial_update()).await {
            warn!(entity_id, error = %err, "authoritative sink update failed");
            return UpdateOutcome::AuthoritativeSinkFailed(err);
        }

        let history = HistoryEntry {
            entity_id: entity_id.to_string(),
            observed_at: Utc::now(),
            changes: patch.clone(),
        };
        if let Err(err) = self.query.upsert(entity_id, state, &history).await {
            warn!(entity_id, error = %err, "query sink upsert failed; authoritative store is ahead");
            return UpdateOutcome::QuerySinkFailed(err);
        }

        match self.invalidator.invalidate(entity_id).await {
            Ok(()) => {
                info!(entity_id, changed = patch.len(), "entity updated");
                UpdateOutcome::Updated {
                    invalidated: true,
                    invalidation_error: None,
                }
            }
            Err(err) => {
                warn!(entity_id, error = %err, "cache invalidation failed");
                UpdateOutcome::Updated {
                    invalidated: false,
                    invalidation_error: Some(err.to_string()),
                }
            }
        }
    }
}
