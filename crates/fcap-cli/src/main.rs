use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fcap_core::{diff, fields_to_json};
use fcap_storage::{HistoryPager, PgSnapshotStore, SnapshotStore};
use fcap_sync::{build_snapshot_store, CycleOptions, CycleReport, SyncConfig, SyncPipeline};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fcap")]
#[command(about = "FounderCap company change tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle.
    Sync {
        /// Entity to sync; repeatable. Defaults to entities.yaml.
        #[arg(long = "entity")]
        entities: Vec<String>,
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Resend every field instead of only the changed ones.
        #[arg(long)]
        force: bool,
    },
    /// Show snapshot history for one entity, newest first.
    History {
        entity: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only snapshots taken strictly before this RFC 3339 time.
        #[arg(long)]
        before: Option<DateTime<Utc>>,
        /// Walk the whole history instead of one page.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Create the Postgres snapshot schema.
    Migrate,
    /// Trigger sync cycles on FCAP_SCHEDULE_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        entities: Vec::new(),
        deadline_secs: None,
        force: false,
    }) {
        Commands::Sync {
            entities,
            deadline_secs,
            force,
        } => {
            let deadline = deadline_secs.map(Duration::from_secs).or(config.cycle_deadline);
            let pipeline = SyncPipeline::from_config(config).await?;
            let options = match deadline {
                Some(deadline) => CycleOptions::with_timeout(deadline),
                None => CycleOptions::default(),
            }
            .force_full_sync(force);
            let entities = (!entities.is_empty()).then_some(entities);
            let (report, alerts) = pipeline.run_once(entities, options).await?;
            print_summary(&report);
            if !alerts.is_empty() {
                println!("alerts raised: {}", alerts.len());
            }
        }
        Commands::History {
            entity,
            limit,
            before,
            all,
            json,
        } => {
            let store = build_snapshot_store(&config).await?;
            print_history(store.as_ref(), &entity, limit, before, all, json).await?;
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set; the filesystem snapshot store needs no migration");
            };
            let store = PgSnapshotStore::connect(url)
                .await
                .context("connecting to snapshot database")?;
            store.ensure_schema().await.context("creating snapshot schema")?;
            println!("migrations applied");
        }
        Commands::Schedule => run_scheduler(config).await?,
    }

    Ok(())
}

fn print_summary(report: &CycleReport) {
    let stats = &report.stats;
    println!(
        "sync complete: run_id={} entities={} updated={} unchanged={} source_failed={} sink_failed={} cancelled={}",
        report.run_id,
        stats.total,
        stats.updated,
        stats.unchanged,
        stats.source_failed,
        stats.sink_failed,
        stats.cancelled
    );
}

async fn print_history(
    store: &dyn SnapshotStore,
    entity: &str,
    limit: usize,
    before: Option<DateTime<Utc>>,
    all: bool,
    json: bool,
) -> Result<()> {
    let mut pager = HistoryPager::new(store, entity, limit.max(1));
    if let Some(before) = before {
        pager = pager.starting_before(before);
    }
    let snapshots = if all {
        pager.collect_all().await?
    } else {
        pager.next_page().await?.unwrap_or_default()
    };
    if snapshots.is_empty() {
        println!("no snapshots for {entity}");
        return Ok(());
    }

    if json {
        let rendered: Vec<_> = snapshots
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "taken_at": s.taken_at,
                    "content_hash": s.content_hash,
                    "fields": fields_to_json(&s.fields),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(());
    }

    for (index, snapshot) in snapshots.iter().enumerate() {
        let older = snapshots.get(index + 1).map(|s| &s.fields);
        let changes = match older {
            Some(older) => {
                let patch = diff(Some(older), &snapshot.fields);
                if patch.is_empty() {
                    "unchanged".to_string()
                } else {
                    patch.fields().collect::<Vec<_>>().join(", ")
                }
            }
            None => "-".to_string(),
        };
        println!(
            "{}  {}  {:>3} fields  {}",
            snapshot.taken_at.to_rfc3339(),
            &snapshot.content_hash[..12.min(snapshot.content_hash.len())],
            snapshot.fields.len(),
            changes
        );
    }
    Ok(())
}

async fn run_scheduler(config: SyncConfig) -> Result<()> {
    let cron = config.schedule_cron.clone();
    let deadline = config.cycle_deadline;
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
    let running = Arc::new(Mutex::new(()));

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _scheduler| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous cycle still running; skipping this trigger");
                return;
            };
            // Deadlines are relative to the trigger, not to process start.
            let options = match deadline {
                Some(deadline) => CycleOptions::with_timeout(deadline),
                None => CycleOptions::default(),
            };
            match pipeline.run_once(None, options).await {
                Ok((report, _alerts)) => print_summary(&report),
                Err(err) => warn!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    scheduler.add(job).await.context("adding scheduler job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    let mut scheduler = scheduler;
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
