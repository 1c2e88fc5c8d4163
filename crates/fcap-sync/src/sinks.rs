//! Concrete sinks: HTTP endpoints for deployed stores, JSON files for local
//! runs and tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fcap_core::{fields_to_json, FieldMap, FieldValue};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::updater::{AuthoritativeSink, CacheInvalidator, HistoryEntry, QuerySink, SinkError};

const MAX_ERROR_BODY: usize = 512;

pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, SinkError> {
    Ok(Client::builder().user_agent(user_agent).timeout(timeout).build()?)
}

fn with_token(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn check_response(sink: &'static str, response: Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        body.truncate(cut);
    }
    Err(SinkError::Http {
        sink,
        status: status.as_u16(),
        body,
    })
}

fn partial_to_json(partial: &BTreeMap<String, Option<FieldValue>>) -> JsonValue {
    JsonValue::Object(
        partial
            .iter()
            .map(|(field, value)| {
                (
                    field.clone(),
                    value.as_ref().map(FieldValue::to_json).unwrap_or(JsonValue::Null),
                )
            })
            .collect(),
    )
}

/// Airtable-style table endpoint: `PATCH <table_url>` with
/// `{"records": [{"id", "fields"}]}`. Null fields are cleared.
#[derive(Debug, Clone)]
pub struct HttpAuthoritativeSink {
    client: Client,
    table_url: Url,
    token: Option<String>,
}

impl HttpAuthoritativeSink {
    pub fn new(client: Client, table_url: Url, token: Option<String>) -> Self {
        Self {
            client,
            table_url,
            token,
        }
    }
}

#[async_trait]
impl AuthoritativeSink for HttpAuthoritativeSink {
    async fn apply_partial(
        &self,
        entity_id: &str,
        partial: &BTreeMap<String, Option<FieldValue>>,
    ) -> Result<(), SinkError> {
        let body = json!({
            "records": [{ "id": entity_id, "fields": partial_to_json(partial) }],
        });
        let request = self.client.patch(self.table_url.clone()).json(&body);
        let response = with_token(request, self.token.as_deref()).send().await?;
        check_response("authoritative sink", response).await
    }
}

/// `PUT <base>/entities/<id>` with the full state and the new history entry.
#[derive(Debug, Clone)]
pub struct HttpQuerySink {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpQuerySink {
    pub fn new(client: Client, base_url: Url, token: Option<String>) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }

    pub fn entity_url(&self, entity_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("entities").push(entity_id);
        }
        url
    }
}

#[async_trait]
impl QuerySink for HttpQuerySink {
    async fn upsert(&self, entity_id: &str, state: &FieldMap, history: &HistoryEntry) -> Result<(), SinkError> {
        let body = json!({
            "entity_id": entity_id,
            "state": fields_to_json(state),
            "history_entry": history.to_json(),
        });
        let request = self.client.put(self.entity_url(entity_id)).json(&body);
        let response = with_token(request, self.token.as_deref()).send().await?;
        check_response("query sink", response).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpCacheInvalidator {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpCacheInvalidator {
    pub fn new(client: Client, endpoint: Url, token: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            token,
        }
    }
}

#[async_trait]
impl CacheInvalidator for HttpCacheInvalidator {
    async fn invalidate(&self, entity_id: &str) -> Result<(), SinkError> {
        let request = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "entity_ids": [entity_id] }));
        let response = with_token(request, self.token.as_deref()).send().await?;
        check_response("cache invalidation", response).await
    }
}

/// Default key prefix of the cached API responses.
pub const DEFAULT_CACHE_PREFIX: &str = "cache:";

const SCAN_BATCH: usize = 500;

/// Drops every Redis key that starts with `<prefix><entity_id>`.
#[derive(Debug, Clone)]
pub struct RedisCacheInvalidator {
    client: redis::Client,
    prefix: String,
}

impl RedisCacheInvalidator {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, SinkError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
        })
    }

    /// `SCAN MATCH` pattern for one entity; glob characters in the prefix
    /// and id match literally.
    pub fn key_pattern(&self, entity_id: &str) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + entity_id.len() + 1);
        for c in self.prefix.chars().chain(entity_id.chars()) {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

#[async_trait]
impl CacheInvalidator for RedisCacheInvalidator {
    async fn invalidate(&self, entity_id: &str) -> Result<(), SinkError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pattern = self.key_pattern(entity_id);

        let mut keys: Vec<String> = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            debug!(entity_id, %pattern, "no cached keys to invalidate");
            return Ok(());
        }
        let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        debug!(entity_id, deleted, "cache keys invalidated");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, entity_id: &str) -> Result<(), SinkError> {
        debug!(entity_id, "no cache configured; skipping invalidation");
        Ok(())
    }
}

/// SHA-256 of the id: portable on every filesystem and distinct per id,
/// including ids that differ only in case or punctuation.
fn file_stem(entity_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hex::encode(hasher.finalize())
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;
    let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, path).await?;
    Ok(())
}

async fn read_object(path: &Path) -> Result<Map<String, JsonValue>, SinkError> {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<JsonValue>(&bytes)? {
            JsonValue::Object(map) => Ok(map),
            _ => Err(SinkError::Rejected(format!("{} is not a JSON object", path.display()))),
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
        Err(err) => Err(err.into()),
    }
}

/// Local system of record: `<root>/authoritative/<sha256(entity)>.json`,
/// patched in place field by field.
#[derive(Debug, Clone)]
pub struct FsAuthoritativeSink {
    root: PathBuf,
}

impl FsAuthoritativeSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn record_path(&self, entity_id: &str) -> PathBuf {
        self.root
            .join("authoritative")
            .join(format!("{}.json", file_stem(entity_id)))
    }

    pub async fn read_record(&self, entity_id: &str) -> Result<Map<String, JsonValue>, SinkError> {
        read_object(&self.record_path(entity_id)).await
    }
}

#[async_trait]
impl AuthoritativeSink for FsAuthoritativeSink {
    async fn apply_partial(
        &self,
        entity_id: &str,
        partial: &BTreeMap<String, Option<FieldValue>>,
    ) -> Result<(), SinkError> {
        let path = self.record_path(entity_id);
        let mut record = read_object(&path).await?;
        for (field, value) in partial {
            match value {
                Some(value) => {
                    record.insert(field.clone(), value.to_json());
                }
                None => {
                    record.remove(field);
                }
            }
        }
        let bytes = serde_json::to_vec_pretty(&JsonValue::Object(record))?;
        write_atomically(&path, &bytes).await
    }
}

/// Local read replica: `<root>/query/<sha256(entity)>.json` holds the full
/// state and `<sha256(entity)>.history.jsonl` one line per applied patch.
#[derive(Debug, Clone)]
pub struct FsQuerySink {
    root: PathBuf,
}

impl FsQuerySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_path(&self, entity_id: &str) -> PathBuf {
        self.root.join("query").join(format!("{}.json", file_stem(entity_id)))
    }

    pub fn history_path(&self, entity_id: &str) -> PathBuf {
        self.root
            .join("query")
            .join(format!("{}.history.jsonl", file_stem(entity_id)))
    }
}

#[async_trait]
impl QuerySink for FsQuerySink {
    async fn upsert(&self, entity_id: &str, state: &FieldMap, history: &HistoryEntry) -> Result<(), SinkError> {
        let document = json!({ "entity_id": entity_id, "state": fields_to_json(state) });
        write_atomically(&self.state_path(entity_id), &serde_json::to_vec_pretty(&document)?).await?;

        let mut line = serde_json::to_vec(&history.to_json())?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(entity_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fcap_core::Patch;

    #[tokio::test]
    async fn fs_authoritative_sink_applies_partial_updates() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAuthoritativeSink::new(dir.path());

        let mut first = BTreeMap::new();
        first.insert("name".to_string(), Some(FieldValue::String("Acme".into())));
        first.insert("website".to_string(), Some(FieldValue::String("https://acme.example".into())));
        sink.apply_partial("Acme Robotics", &first).await.unwrap();

        let mut second = BTreeMap::new();
        second.insert("total_funding".to_string(), Some(FieldValue::Number(2_300_000.0)));
        second.insert("website".to_string(), None);
        sink.apply_partial("Acme Robotics", &second).await.unwrap();

        let record = sink.read_record("Acme Robotics").await.unwrap();
        assert_eq!(record["name"], json!("Acme"));
        assert_eq!(record["total_funding"], json!(2300000));
        assert!(!record.contains_key("website"));
        assert!(sink.record_path("Acme Robotics").starts_with(dir.path().join("authoritative")));
    }

    #[tokio::test]
    async fn ids_differing_in_case_or_punctuation_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let authoritative = FsAuthoritativeSink::new(dir.path());
        let query = FsQuerySink::new(dir.path());
        let ids = ["Acme Robotics", "acme_robotics", "ACME-robotics", "acme robotics"];

        let paths: std::collections::HashSet<_> = ids.iter().map(|id| authoritative.record_path(id)).collect();
        assert_eq!(paths.len(), ids.len());
        let paths: std::collections::HashSet<_> = ids.iter().map(|id| query.history_path(id)).collect();
        assert_eq!(paths.len(), ids.len());

        let mut name = BTreeMap::new();
        name.insert("name".to_string(), Some(FieldValue::String("Acme Robotics Inc".into())));
        authoritative.apply_partial("Acme Robotics", &name).await.unwrap();
        let mut funding = BTreeMap::new();
        funding.insert("total_funding".to_string(), Some(FieldValue::Number(5.0)));
        authoritative.apply_partial("acme_robotics", &funding).await.unwrap();

        let first = authoritative.read_record("Acme Robotics").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first["name"], json!("Acme Robotics Inc"));
        let second = authoritative.read_record("acme_robotics").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second["total_funding"], json!(5));
    }

    #[tokio::test]
    async fn fs_query_sink_keeps_full_state_and_appends_history() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsQuerySink::new(dir.path());
        let mut state = FieldMap::new();
        state.insert("name".into(), FieldValue::String("Acme".into()));

        for stage in ["Seed", "Series A"] {
            let mut changes = Patch::new();
            changes.record("funding_stage", None, Some(FieldValue::Enum(stage.into())));
            let entry = HistoryEntry {
                entity_id: "acme".into(),
                observed_at: Utc::now(),
                changes,
            };
            sink.upsert("acme", &state, &entry).await.unwrap();
        }

        let history = tokio::fs::read_to_string(sink.history_path("acme")).await.unwrap();
        assert_eq!(history.lines().count(), 2);
        let state_doc: JsonValue =
            serde_json::from_slice(&tokio::fs::read(sink.state_path("acme")).await.unwrap()).unwrap();
        assert_eq!(state_doc["state"]["name"], json!("Acme"));
    }

    #[test]
    fn redis_pattern_matches_entity_keys_literally() {
        let invalidator = RedisCacheInvalidator::new("redis://127.0.0.1:6379/0", DEFAULT_CACHE_PREFIX).unwrap();
        assert_eq!(invalidator.key_pattern("acme-robotics"), "cache:acme-robotics*");
        assert_eq!(invalidator.key_pattern("a*b?[c]"), r"cache:a\*b\?\[c\]*");

        assert!(matches!(
            RedisCacheInvalidator::new("not a url", DEFAULT_CACHE_PREFIX),
            Err(SinkError::Cache(_))
        ));
    }

    #[test]
    fn query_url_appends_entity_segment() {
        let sink = HttpQuerySink::new(
            Client::new(),
            Url::parse("https://search.example/api/").unwrap(),
            None,
        );
        assert_eq!(
            sink.entity_url("acme robotics").as_str(),
            "https://search.example/api/entities/acme%20robotics"
        );
    }
}
