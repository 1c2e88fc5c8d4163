//! Sync pipeline: configuration, source registry, and assembly of the
//! orchestrator from the environment.

pub mod orchestrator;
pub mod report;
pub mod sinks;
pub mod updater;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fcap_adapters::{build_adapter, AdapterSpec, HttpSettings, SourceAdapter};
use fcap_core::{EntityId, Schema};
use fcap_storage::{
    BackoffPolicy, BackoffPolicyConfig, FsSnapshotStore, PgSnapshotStore, RateLimitedClient, RateLimiter,
    SnapshotStore, TokenBucketConfig,
};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::info;

pub use orchestrator::{
    CycleOptions, ErrorKind, Orchestrator, RunResult, RunStatus, SourceFailure, StepFailure,
    DEFAULT_WORKER_CONCURRENCY,
};
pub use report::{
    publish, summary_markdown, Alert, AlertKind, AlertPolicy, CycleObserver, CycleReport, CycleStats,
    FailureDetail, ReportWriter, TracingObserver,
};
pub use sinks::{
    build_http_client, FsAuthoritativeSink, FsQuerySink, HttpAuthoritativeSink, HttpCacheInvalidator,
    HttpQuerySink, NoopInvalidator, RedisCacheInvalidator, DEFAULT_CACHE_PREFIX,
};
pub use updater::{
    AuthoritativeSink, CacheInvalidator, HistoryEntry, PipelineStage, QuerySink, SinkError, UpdateOutcome,
    Updater,
};

pub const CRATE_NAME: &str = "fcap-sync";

/// One request per day, roughly.
pub const MIN_REQUESTS_PER_SECOND: f64 = 1e-5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source `{0}` is declared more than once")]
    DuplicateSource(String),
    #[error("source `{source_id}` needs a request rate of at least {min} per second", min = MIN_REQUESTS_PER_SECOND)]
    InvalidRate { source_id: String },
    #[error("no enabled sources are configured")]
    NoEnabledSources,
    #[error("{var} is not a valid URL: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    /// Merge priority follows list order: later sources win per field.
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit: Option<TokenBucketConfig>,
    #[serde(default)]
    pub retry: Option<BackoffPolicyConfig>,
    pub adapter: AdapterSpec,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
            if let Some(rate) = &source.rate_limit {
                if !(rate.requests_per_second.is_finite()
                    && rate.requests_per_second >= MIN_REQUESTS_PER_SECOND)
                {
                    return Err(ConfigError::InvalidRate {
                        source_id: source.source_id.clone(),
                    });
                }
            }
        }
        if self.enabled().next().is_none() {
            return Err(ConfigError::NoEnabledSources);
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Rate limiter and retry policies for every enabled source.
    pub fn client(&self, acquire_timeout: Option<Duration>) -> RateLimitedClient {
        let mut limiter = RateLimiter::new(None);
        for source in self.enabled() {
            if let Some(rate) = source.rate_limit {
                limiter = limiter.with_source(source.source_id.clone(), rate);
            }
        }
        let mut client = RateLimitedClient::new(limiter).with_acquire_timeout(acquire_timeout);
        for source in self.enabled() {
            if let Some(retry) = source.retry {
                client = client.with_policy(source.source_id.clone(), BackoffPolicy::from(retry));
            }
        }
        client
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityList {
    pub entities: Vec<EntityId>,
}

#[derive(Debug, Clone)]
pub struct SinkEndpoints {
    pub authoritative_url: Option<String>,
    pub query_url: Option<String>,
    pub invalidation_url: Option<String>,
    /// Used for invalidation when no invalidation URL is set.
    pub redis_url: Option<String>,
    pub cache_prefix: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Postgres snapshot store when set, filesystem store otherwise.
    pub database_url: Option<String>,
    pub snapshot_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub sink_dir: PathBuf,
    pub worker_concurrency: usize,
    pub cycle_deadline: Option<Duration>,
    pub acquire_timeout: Option<Duration>,
    pub alert_policy: AlertPolicy,
    pub sinks: SinkEndpoints,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub schedule_cron: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_opt(name).and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = env_opt("FCAP_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let defaults = AlertPolicy::default();
        Self {
            database_url: env_opt("DATABASE_URL"),
            snapshot_dir: env_opt("FCAP_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("snapshots")),
            reports_dir: env_opt("FCAP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            sink_dir: env_opt("FCAP_SINK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("sinks")),
            worker_concurrency: env_parse("FCAP_WORKER_CONCURRENCY")
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
                .max(1),
            cycle_deadline: env_parse("FCAP_CYCLE_DEADLINE_SECS").map(Duration::from_secs),
            acquire_timeout: env_parse("FCAP_ACQUIRE_TIMEOUT_MS").map(Duration::from_millis),
            alert_policy: AlertPolicy {
                max_source_failed_ratio: env_parse("FCAP_MAX_SOURCE_FAILED_RATIO")
                    .unwrap_or(defaults.max_source_failed_ratio),
                max_error_rate: env_parse("FCAP_MAX_ERROR_RATE").unwrap_or(defaults.max_error_rate),
            },
            sinks: SinkEndpoints {
                authoritative_url: env_opt("FCAP_AUTHORITATIVE_URL"),
                query_url: env_opt("FCAP_QUERY_URL"),
                invalidation_url: env_opt("FCAP_INVALIDATION_URL"),
                redis_url: env_opt("FCAP_REDIS_URL"),
                cache_prefix: env_opt("FCAP_CACHE_PREFIX").unwrap_or_else(|| DEFAULT_CACHE_PREFIX.to_string()),
                token: env_opt("FCAP_SINK_TOKEN"),
            },
            user_agent: env_opt("FCAP_USER_AGENT").unwrap_or_else(|| "fcap-bot/0.1".to_string()),
            http_timeout_secs: env_parse("FCAP_HTTP_TIMEOUT_SECS").unwrap_or(20),
            schedule_cron: env_opt("FCAP_SCHEDULE_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            workspace_root,
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn default_options(&self) -> CycleOptions {
        match self.cycle_deadline {
            Some(deadline) => CycleOptions::with_timeout(deadline),
            None => CycleOptions::default(),
        }
    }
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    SourceRegistry::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
}

pub async fn load_entity_list(workspace_root: &Path) -> Result<Vec<EntityId>> {
    let path = workspace_root.join("entities.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let list: EntityList =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(list.entities)
}

pub async fn build_snapshot_store(config: &SyncConfig) -> Result<Arc<dyn SnapshotStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgSnapshotStore::connect(url)
                .await
                .context("connecting to snapshot database")?;
            store.ensure_schema().await.context("preparing snapshot schema")?;
            Ok(Arc::new(store))
        }
        None => {
            info!(dir = %config.snapshot_dir.display(), "using filesystem snapshot store");
            Ok(Arc::new(FsSnapshotStore::new(config.snapshot_dir.clone())))
        }
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        var,
        reason: err.to_string(),
    })
}

/// HTTP sinks for every configured URL, local JSON files for the rest.
pub fn build_updater(config: &SyncConfig) -> Result<Updater> {
    let client = build_http_client(&config.user_agent, Duration::from_secs(config.http_timeout_secs))
        .context("building sink HTTP client")?;
    let endpoints = &config.sinks;

    let authoritative: Arc<dyn AuthoritativeSink> = match &endpoints.authoritative_url {
        Some(raw) => Arc::new(HttpAuthoritativeSink::new(
            client.clone(),
            parse_url("FCAP_AUTHORITATIVE_URL", raw)?,
            endpoints.token.clone(),
        )),
        None => Arc::new(FsAuthoritativeSink::new(config.sink_dir.clone())),
    };
    let query: Arc<dyn QuerySink> = match &endpoints.query_url {
        Some(raw) => Arc::new(HttpQuerySink::new(
            client.clone(),
            parse_url("FCAP_QUERY_URL", raw)?,
            endpoints.token.clone(),
        )),
        None => Arc::new(FsQuerySink::new(config.sink_dir.clone())),
    };
    let invalidator: Arc<dyn CacheInvalidator> = match (&endpoints.invalidation_url, &endpoints.redis_url) {
        (Some(raw), _) => Arc::new(HttpCacheInvalidator::new(
            client,
            parse_url("FCAP_INVALIDATION_URL", raw)?,
            endpoints.token.clone(),
        )),
        (None, Some(redis_url)) => Arc::new(
            RedisCacheInvalidator::new(redis_url, endpoints.cache_prefix.clone())
                .context("opening FCAP_REDIS_URL")?,
        ),
        (None, None) => Arc::new(NoopInvalidator),
    };
    Ok(Updater::new(authoritative, query, invalidator))
}

pub fn build_sources(
    registry: &SourceRegistry,
    schema: Arc<Schema>,
    config: &SyncConfig,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let http = config.http_settings();
    registry
        .enabled()
        .map(|source| {
            build_adapter(
                &source.source_id,
                &source.adapter,
                schema.clone(),
                &config.workspace_root,
                &http,
            )
            .with_context(|| format!("building adapter for {}", source.source_id))
        })
        .collect()
}

/// Orchestrator plus the observers and alert thresholds applied after each
/// cycle.
pub struct SyncPipeline {
    config: SyncConfig,
    orchestrator: Orchestrator,
    observers: Vec<Arc<dyn CycleObserver>>,
}

impl SyncPipeline {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = load_source_registry(&config.workspace_root).await?;
        let schema = Arc::new(Schema::company());
        let sources = build_sources(&registry, schema, &config)?;
        let client = registry.client(config.acquire_timeout);
        let snapshots = build_snapshot_store(&config).await?;
        let updater = build_updater(&config)?;

        info!(sources = sources.len(), workers = config.worker_concurrency, "sync pipeline ready");
        let orchestrator = Orchestrator::new(sources, client, snapshots, updater)
            .with_worker_concurrency(config.worker_concurrency);
        let observers: Vec<Arc<dyn CycleObserver>> = vec![
            Arc::new(TracingObserver),
            Arc::new(ReportWriter::new(config.reports_dir.clone())),
        ];
        Ok(Self {
            config,
            orchestrator,
            observers,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs one cycle over `entity_ids`, or over `entities.yaml` when `None`.
    pub async fn run_once(
        &self,
        entity_ids: Option<Vec<EntityId>>,
        options: CycleOptions,
    ) -> Result<(CycleReport, Vec<Alert>)> {
        let entity_ids = match entity_ids {
            Some(ids) => ids,
            None => load_entity_list(&self.config.workspace_root).await?,
        };
        let report = self.orchestrator.run_cycle(&entity_ids, options).await;
        let alerts = publish(&report, &self.config.alert_policy, &self.observers).await;
        Ok((report, alerts))
    }
}

pub async fn run_sync_once_from_env() -> Result<(CycleReport, Vec<Alert>)> {
    let config = SyncConfig::from_env();
    let options = config.default_options();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once(None, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: crunchbase
    display_name: Crunchbase
    rate_limit: { requests_per_second: 2.0, burst: 2 }
    retry: { max_attempts: 3, base_delay_ms: 100 }
    adapter: { kind: fixture, root: fixtures }
  - source_id: linkedin
    adapter:
      kind: http_json
      base_url: https://linkedin.example/companies/
      root_pointer: /data
      fields:
        - { field: employee_count, pointer: /staffCountRange, transform: employee_count }
  - source_id: legacy
    enabled: false
    adapter: { kind: fixture, root: fixtures }
"#;

    #[test]
    fn registry_parses_and_keeps_declaration_order() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["crunchbase", "linkedin"]);

        let client = registry.client(None);
        assert_eq!(client.policy_for("crunchbase").max_attempts, 3);
        assert_eq!(client.policy_for("linkedin"), BackoffPolicy::default());
    }

    #[test]
    fn duplicate_sources_are_rejected() {
        let yaml = r#"
sources:
  - source_id: crunchbase
    adapter: { kind: fixture, root: a }
  - source_id: crunchbase
    adapter: { kind: fixture, root: b }
"#;
        let err = SourceRegistry::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::DuplicateSource(id)) if id == "crunchbase"
        ));
    }

    #[test]
    fn zero_rate_is_rejected() {
        let yaml = r#"
sources:
  - source_id: crunchbase
    rate_limit: { requests_per_second: 0 }
    adapter: { kind: fixture, root: a }
"#;
        assert!(SourceRegistry::from_yaml(yaml).is_err());

        let tiny = yaml.replace("requests_per_second: 0", "requests_per_second: 1.0e-30");
        let err = SourceRegistry::from_yaml(&tiny).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidRate { source_id }) if source_id == "crunchbase"
        ));
    }

    #[test]
    fn missing_sink_urls_fall_back_to_local_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::from_env();
        config.sink_dir = dir.path().to_path_buf();
        config.sinks = SinkEndpoints {
            authoritative_url: None,
            query_url: None,
            invalidation_url: None,
            redis_url: None,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            token: None,
        };
        assert!(build_updater(&config).is_ok());

        config.sinks.redis_url = Some("redis://127.0.0.1:6379/0".to_string());
        assert!(build_updater(&config).is_ok());
        config.sinks.redis_url = Some("not a url".to_string());
        assert!(build_updater(&config).is_err());
        config.sinks.redis_url = None;

        config.sinks.query_url = Some("not a url".to_string());
        assert!(build_updater(&config).is_err());
    }
}
