//! Source adapter contract plus fixture-first and HTTP JSON implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fcap_core::{coerce_value, FieldMap, NormalizedRecord, Schema, SchemaViolation};
use fcap_storage::{classify_reqwest_error, classify_status, RetryClassify, RetryDisposition};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "fcap-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source rejected the request: {0}")]
    Fatal(String),
    #[error("entity `{entity_id}` is unknown to the source")]
    NotFound { entity_id: String },
    #[error("transient source failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },
    #[error("record violates the schema: {0}")]
    Schema(#[from] SchemaViolation),
}

impl SourceError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => SourceError::Transient {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            },
            RetryDisposition::NonRetryable => SourceError::Fatal(err.to_string()),
        }
    }

    fn from_status(status: StatusCode, entity_id: &str, url: &Url) -> Self {
        if status == StatusCode::NOT_FOUND {
            return SourceError::NotFound {
                entity_id: entity_id.to_string(),
            };
        }
        match classify_status(status) {
            RetryDisposition::Retryable => SourceError::Transient {
                status: Some(status.as_u16()),
                message: format!("http {status} for {url}"),
            },
            RetryDisposition::NonRetryable => SourceError::Fatal(format!("http {status} for {url}")),
        }
    }
}

impl RetryClassify for SourceError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            SourceError::Transient { .. } => RetryDisposition::Retryable,
            SourceError::Fatal(_) | SourceError::NotFound { .. } | SourceError::Schema(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Produces one normalized record for one entity from one source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, entity_id: &str) -> Result<NormalizedRecord, SourceError>;
}

/// Validates every record an adapter produces before it leaves the adapter
/// boundary: identity must match the request and fields must fit the schema.
pub struct SchemaGuard<A> {
    inner: A,
    schema: Arc<Schema>,
}

impl<A: SourceAdapter> SchemaGuard<A> {
    pub fn new(inner: A, schema: Arc<Schema>) -> Self {
        Self { inner, schema }
    }
}

#[async_trait]
impl<A: SourceAdapter> SourceAdapter for SchemaGuard<A> {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    async fn fetch(&self, entity_id: &str) -> Result<NormalizedRecord, SourceError> {
        let record = self.inner.fetch(entity_id).await?;
        if record.source_id != self.inner.source_id() || record.entity_id != entity_id {
            return Err(SourceError::Fatal(format!(
                "adapter {} returned record for {}/{} when asked for {}",
                self.inner.source_id(),
                record.source_id,
                record.entity_id,
                entity_id
            )));
        }
        self.schema.validate(&record.fields)?;
        Ok(record)
    }
}

/// How a source is reached, as declared in `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    Fixture {
        root: PathBuf,
    },
    HttpJson {
        base_url: String,
        #[serde(default)]
        token_env: Option<String>,
        #[serde(default)]
        root_pointer: Option<String>,
        #[serde(default)]
        fields: Vec<FieldMapping>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub pointer: String,
    #[serde(default)]
    pub transform: Option<FieldTransform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    /// `"11-50 employees"` -> 50, `"10,000+"` -> 10000.
    EmployeeCount,
    /// `"San Francisco, CA"` -> `"San Francisco"`.
    FirstSegment,
    /// Round type of the most recently announced funding round.
    LatestRoundType,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Builds the adapter for a configured source, wrapped in a [`SchemaGuard`].
pub fn build_adapter(
    source_id: &str,
    spec: &AdapterSpec,
    schema: Arc<Schema>,
    workspace_root: &Path,
    http: &HttpSettings,
) -> Result<Arc<dyn SourceAdapter>> {
    match spec {
        AdapterSpec::Fixture { root } => {
            let root = if root.is_absolute() {
                root.clone()
            } else {
                workspace_root.join(root)
            };
            let adapter = FixtureSourceAdapter::new(source_id, root, schema.clone());
            Ok(Arc::new(SchemaGuard::new(adapter, schema)))
        }
        AdapterSpec::HttpJson {
            base_url,
            token_env,
            root_pointer,
            fields,
        } => {
            let token = match token_env {
                Some(var) => Some(
                    std::env::var(var)
                        .with_context(|| format!("reading token for source {source_id} from ${var}"))?,
                ),
                None => None,
            };
            let adapter = HttpJsonSourceAdapter::new(source_id, base_url, token, schema.clone(), http)?
                .with_root_pointer(root_pointer.clone())
                .with_mappings(fields.clone());
            Ok(Arc::new(SchemaGuard::new(adapter, schema)))
        }
    }
}

/// Reads captured source payloads from `<root>/<source_id>/<entity>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSourceAdapter {
    source_id: String,
    root: PathBuf,
    schema: Arc<Schema>,
}

impl FixtureSourceAdapter {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>, schema: Arc<Schema>) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
            schema,
        }
    }

    pub fn fixture_path(&self, entity_id: &str) -> PathBuf {
        self.root
            .join(&self.source_id)
            .join(format!("{}.json", fixture_file_stem(entity_id)))
    }
}

fn fixture_file_stem(entity_id: &str) -> String {
    entity_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for FixtureSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, entity_id: &str) -> Result<NormalizedRecord, SourceError> {
        let path = self.fixture_path(entity_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound {
                    entity_id: entity_id.to_string(),
                })
            }
            Err(err) => {
                return Err(SourceError::Transient {
                    status: None,
                    message: format!("reading {}: {err}", path.display()),
                })
            }
        };
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| SourceError::Fatal(format!("parsing {}: {e}", path.display())))?;
        let fields = self.schema.coerce_json(&value)?;
        Ok(NormalizedRecord {
            entity_id: entity_id.to_string(),
            source_id: self.source_id.clone(),
            fetched_at: Utc::now(),
            fields,
        })
    }
}

/// Fetches `GET {base_url}/{entity_id}` and maps the JSON body onto the schema.
#[derive(Debug, Clone)]
pub struct HttpJsonSourceAdapter {
    source_id: String,
    base_url: Url,
    bearer_token: Option<String>,
    client: reqwest::Client,
    schema: Arc<Schema>,
    root_pointer: Option<String>,
    mappings: Vec<FieldMapping>,
}

impl HttpJsonSourceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        base_url: &str,
        bearer_token: Option<String>,
        schema: Arc<Schema>,
        http: &HttpSettings,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parsing base url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("base url {base_url} cannot carry path segments");
        }
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(http.timeout);
        if let Some(user_agent) = &http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            source_id: source_id.into(),
            base_url,
            bearer_token,
            client: builder.build().context("building reqwest client")?,
            schema,
            root_pointer: None,
            mappings: Vec::new(),
        })
    }

    pub fn with_root_pointer(mut self, pointer: Option<String>) -> Self {
        self.root_pointer = pointer;
        self
    }

    pub fn with_mappings(mut self, mappings: Vec<FieldMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn entity_url(&self, entity_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(entity_id);
        }
        url
    }

    /// Maps a response body onto the schema. Without mappings the (rooted)
    /// body must already use schema field names.
    pub fn extract_fields(&self, body: &JsonValue) -> Result<FieldMap, SourceError> {
        let root = match &self.root_pointer {
            Some(pointer) => body.pointer(pointer).ok_or_else(|| {
                SourceError::Fatal(format!("response has no value at {pointer}"))
            })?,
            None => body,
        };
        if self.mappings.is_empty() {
            return Ok(self.schema.coerce_json(root)?);
        }

        let mut fields = FieldMap::new();
        for mapping in &self.mappings {
            let Some(raw) = root.pointer(&mapping.pointer) else {
                continue;
            };
            let raw = match mapping.transform {
                Some(transform) => apply_transform(transform, raw),
                None => raw.clone(),
            };
            let kind = self.schema.kind_of(&mapping.field).ok_or_else(|| {
                SchemaViolation::UnknownField {
                    field: mapping.field.clone(),
                }
            })?;
            if let Some(value) = coerce_value(&mapping.field, kind, &raw)? {
                fields.insert(mapping.field.clone(), value);
            }
        }
        Ok(fields)
    }
}

#[async_trait]
impl SourceAdapter for HttpJsonSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, entity_id: &str) -> Result<NormalizedRecord, SourceError> {
        let url = self.entity_url(entity_id);
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(SourceError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status, entity_id, &url));
        }
        let body: JsonValue = response.json().await.map_err(SourceError::from_reqwest)?;
        debug!(source_id = %self.source_id, entity_id, %url, "source payload received");

        Ok(NormalizedRecord {
            entity_id: entity_id.to_string(),
            source_id: self.source_id.clone(),
            fetched_at: Utc::now(),
            fields: self.extract_fields(&body)?,
        })
    }
}

fn apply_transform(transform: FieldTransform, raw: &JsonValue) -> JsonValue {
    match transform {
        FieldTransform::EmployeeCount => match raw {
            JsonValue::Number(_) => raw.clone(),
            JsonValue::String(text) => parse_employee_count(text)
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        },
        FieldTransform::FirstSegment => raw
            .as_str()
            .and_then(|text| text.split(',').next())
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| JsonValue::String(segment.to_string()))
            .unwrap_or(JsonValue::Null),
        FieldTransform::LatestRoundType => latest_round_type(raw)
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

/// Upper bound of a headcount range as published by professional networks.
pub fn parse_employee_count(text: &str) -> Option<u64> {
    let lower = text.to_ascii_lowercase();
    let cleaned = lower
        .replace("employees", "")
        .replace("employee", "")
        .replace(',', "");
    let cleaned = cleaned.trim();

    if let Some((_, upper)) = cleaned.split_once('-') {
        if let Ok(value) = upper.trim().parse::<u64>() {
            return Some(value);
        }
    }
    if let Some(floor) = cleaned.strip_suffix('+') {
        return floor.trim().parse::<u64>().ok();
    }
    cleaned.parse::<u64>().ok()
}

fn latest_round_type(raw: &JsonValue) -> Option<String> {
    raw.as_array()?
        .iter()
        .filter_map(|round| {
            let announced = round.get("announced_date").and_then(JsonValue::as_str)?;
            let round_type = round.get("round_type").and_then(JsonValue::as_str)?;
            Some((announced, round_type))
        })
        .max_by(|a, b| a.0.cmp(b.0))
        .map(|(_, round_type)| round_type.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcap_core::FieldValue;
    use serde_json::json;
    use tempfile::tempdir;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::company())
    }

    struct MislabeledAdapter;

    #[async_trait]
    impl SourceAdapter for MislabeledAdapter {
        fn source_id(&self) -> &str {
            "crunchbase"
        }

        async fn fetch(&self, entity_id: &str) -> Result<NormalizedRecord, SourceError> {
            let mut fields = FieldMap::new();
            fields.insert("total_funding".into(), FieldValue::String("a lot".into()));
            Ok(NormalizedRecord {
                entity_id: entity_id.to_string(),
                source_id: "crunchbase".into(),
                fetched_at: Utc::now(),
                fields,
            })
        }
    }

    #[test]
    fn employee_ranges_take_the_upper_bound() {
        assert_eq!(parse_employee_count("11-50 employees"), Some(50));
        assert_eq!(parse_employee_count("1,001-5,000 employees"), Some(5000));
        assert_eq!(parse_employee_count("10,000+ employees"), Some(10000));
        assert_eq!(parse_employee_count("42"), Some(42));
        assert_eq!(parse_employee_count("self-employed"), None);
    }

    #[tokio::test]
    async fn fixture_adapter_reads_and_coerces_payloads() {
        let dir = tempdir().expect("tempdir");
        let source_dir = dir.path().join("crunchbase");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(
            source_dir.join("acme-robotics.json"),
            r#"{"name": "Acme Robotics", "total_funding": 2300000, "funding_stage": "Series A"}"#,
        )
        .unwrap();

        let adapter = build_adapter(
            "crunchbase",
            &AdapterSpec::Fixture {
                root: dir.path().to_path_buf(),
            },
            schema(),
            Path::new("."),
            &HttpSettings::default(),
        )
        .expect("adapter");

        let record = adapter.fetch("acme-robotics").await.expect("record");
        assert_eq!(record.source_id, "crunchbase");
        assert_eq!(record.fields["total_funding"], FieldValue::Number(2_300_000.0));

        let missing = adapter.fetch("ghost").await.unwrap_err();
        assert!(matches!(missing, SourceError::NotFound { .. }));
        assert_eq!(missing.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn schema_guard_rejects_mistyped_records() {
        let guarded = SchemaGuard::new(MislabeledAdapter, schema());
        let err = guarded.fetch("acme").await.unwrap_err();
        assert!(matches!(err, SourceError::Schema(_)));
    }

    #[test]
    fn http_adapter_maps_fields_through_pointers_and_transforms() {
        let adapter = HttpJsonSourceAdapter::new(
            "linkedin",
            "https://api.example.test/companies/",
            None,
            schema(),
            &HttpSettings::default(),
        )
        .expect("adapter")
        .with_root_pointer(Some("/data".into()))
        .with_mappings(vec![
            FieldMapping {
                field: "employee_count".into(),
                pointer: "/company_size".into(),
                transform: Some(FieldTransform::EmployeeCount),
            },
            FieldMapping {
                field: "location_city".into(),
                pointer: "/headquarters".into(),
                transform: Some(FieldTransform::FirstSegment),
            },
            FieldMapping {
                field: "funding_stage".into(),
                pointer: "/funding_rounds".into(),
                transform: Some(FieldTransform::LatestRoundType),
            },
            FieldMapping {
                field: "industry".into(),
                pointer: "/industry".into(),
                transform: None,
            },
        ]);

        let body = json!({
            "data": {
                "company_size": "51-200 employees",
                "headquarters": "San Francisco, CA",
                "industry": null,
                "funding_rounds": [
                    {"announced_date": "2023-01-10", "round_type": "Seed"},
                    {"announced_date": "2024-06-01", "round_type": "Series A"}
                ]
            }
        });
        let fields = adapter.extract_fields(&body).expect("fields");
        assert_eq!(fields["employee_count"], FieldValue::Number(200.0));
        assert_eq!(fields["location_city"], FieldValue::String("San Francisco".into()));
        assert_eq!(fields["funding_stage"], FieldValue::Enum("Series A".into()));
        assert!(!fields.contains_key("industry"));

        assert_eq!(
            adapter.entity_url("acme robotics").as_str(),
            "https://api.example.test/companies/acme%20robotics"
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = SourceError::Transient {
            status: Some(503),
            message: "unavailable".into(),
        };
        assert_eq!(transient.disposition(), RetryDisposition::Retryable);
        assert_eq!(
            SourceError::Fatal("bad credentials".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }
}
