//! Harvest pipeline orchestration.
//!
//! Coordinates the full sync flow:
//!
//! ```text
//! ConnectionLoader ──events──▶ RecordStore ──stored──▶ extract ──▶ SearchIndex
//!   (Scheduler)                 (dedup)                             (pending writes)
//! ```
//!
//! Loading and consuming run concurrently on the same task. Incremental
//! sync uses the start time of the last completed harvest as the `since`
//! watermark; `--full` ignores it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{GraphApi, HttpGraphApi};
use crate::archive::Archive;
use crate::config::{ApiConfig, Config};
use crate::kv::{
    KeyValueStore, ACCESS_TOKEN_KEY, HARVEST_FINISHED_KEY, HARVEST_STARTED_KEY,
    INDEXING_MILLIS_KEY,
};
use crate::loader::{ConnectionLoader, HarvestError, LoadEvent, LoadRequest, LoadSummary};
use crate::models::Subject;
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::search::{flush, IndexState, PendingWrite};

/// Environment variable consulted for the access token.
pub const ACCESS_TOKEN_ENV: &str = "HARVEST_ACCESS_TOKEN";

/// Counts of one harvest run.
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    pub load: LoadSummary,
    pub stored: usize,
    pub duplicates: usize,
    /// Items without an id.
    pub skipped: usize,
    pub indexed: usize,
    pub index_failures: usize,
    pub since: Option<i64>,
    pub loading: Duration,
    pub indexing: Duration,
}

#[derive(Default)]
struct Consumed {
    stored: usize,
    duplicates: usize,
    skipped: usize,
    pending: Vec<PendingWrite>,
}

pub struct Harvester {
    archive: Archive,
    api: Arc<dyn GraphApi>,
    settings: SchedulerSettings,
    loader: ConnectionLoader,
}

impl Harvester {
    pub fn new(archive: Archive, api: Arc<dyn GraphApi>, settings: SchedulerSettings) -> Self {
        let loader = ConnectionLoader::new(Scheduler::new(api.clone(), settings));
        Self {
            archive,
            api,
            settings,
            loader,
        }
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.loader.scheduler()
    }

    /// Stop loading. Calls already in flight still complete; their records
    /// are absorbed by deduplication.
    pub fn cancel(&self) {
        self.loader.scheduler().stop();
    }

    /// Run one harvest cycle: load everything new, store and index it.
    pub async fn harvest(
        &mut self,
        full: bool,
        reporter: &dyn ProgressReporter,
    ) -> Result<HarvestReport> {
        let mut indexing = Duration::ZERO;
        match self.archive.ensure_index(reporter).await {
            Ok(Some(built)) => indexing += built,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "search index unavailable, records will not be indexed"),
        }

        let since = if full {
            None
        } else {
            read_millis(self.archive.kv.as_ref(), HARVEST_STARTED_KEY)
                .await?
                .map(|ms| ms / 1000)
        };
        let started_at = Utc::now().timestamp_millis();
        let loading_started = Instant::now();

        let harvest = &self.archive.harvest;
        let request = LoadRequest {
            root: Subject::new(&harvest.root_subject, &harvest.root_name),
            relations: harvest.relations.iter().map(|s| s.relation.clone()).collect(),
            connection_relations: harvest
                .connection_relations
                .iter()
                .map(|s| s.relation.clone())
                .collect(),
            connections_relation: harvest.connections_relation.clone(),
            since,
            known_connections: self.archive.store.connections(),
        };
        info!(
            root = %request.root.id,
            relations = request.relations.len(),
            known_connections = request.known_connections.len(),
            since = ?since,
            "harvest started"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = self.loader.scheduler().clone();
        let load = self.loader.load_all(request, tx);
        let consume = consume_events(&mut self.archive, &scheduler, rx, reporter);
        let (loaded, consumed) = tokio::join!(load, consume);
        let loading = loading_started.elapsed();

        let consumed = consumed?;
        let flush_started = Instant::now();
        let (indexed, failures) = flush(consumed.pending).await;
        indexing += flush_started.elapsed();
        for (key, error) in &failures {
            warn!(key = %key, error = %error, "index write failed");
        }

        let load = match loaded {
            Ok(summary) => summary,
            Err(HarvestError::Cancelled) => {
                info!(stored = consumed.stored, "harvest cancelled, watermark unchanged");
                return Err(HarvestError::Cancelled.into());
            }
            Err(e) => return Err(e.into()),
        };

        let kv = self.archive.kv.as_ref();
        kv.set(HARVEST_STARTED_KEY, &started_at.to_string()).await?;
        kv.set(
            HARVEST_FINISHED_KEY,
            &Utc::now().timestamp_millis().to_string(),
        )
        .await?;
        kv.set(INDEXING_MILLIS_KEY, &indexing.as_millis().to_string())
            .await?;

        Ok(HarvestReport {
            load,
            stored: consumed.stored,
            duplicates: consumed.duplicates,
            skipped: consumed.skipped,
            indexed,
            index_failures: failures.len(),
            since,
            loading,
            indexing,
        })
    }

    /// Fetch the full data of a stored stub.
    pub async fn fetch(&mut self, storage_key: &str) -> Result<crate::models::Record> {
        let scheduler = self.loader.scheduler().clone();
        Ok(self.archive.store.promote(storage_key, &scheduler).await?)
    }

    /// Clear the archive and start over with a fresh scheduler.
    pub async fn reset(&mut self) -> Result<()> {
        self.cancel();
        self.archive.reset().await?;
        self.loader = ConnectionLoader::new(Scheduler::new(self.api.clone(), self.settings));
        Ok(())
    }

    pub fn into_archive(self) -> Archive {
        self.archive
    }
}

/// Route loader events into the store and index until the loader is done.
async fn consume_events(
    archive: &mut Archive,
    scheduler: &Scheduler,
    mut events: mpsc::UnboundedReceiver<LoadEvent>,
    reporter: &dyn ProgressReporter,
) -> Result<Consumed> {
    let mut consumed = Consumed::default();
    let mut failure: Option<anyhow::Error> = None;

    while let Some(event) = events.recv().await {
        match event {
            LoadEvent::SubjectStarted {
                subject,
                position,
                total,
            } => reporter.report(ProgressEvent::SubjectStarted {
                subject: subject.name,
                position,
                total,
            }),
            LoadEvent::Records {
                subject,
                relation,
                items,
            } => {
                if failure.is_some() {
                    continue;
                }
                let batch = match archive.store.ingest_all(&items, &subject, &relation).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        scheduler.stop();
                        failure = Some(anyhow::Error::new(e).context("Failed to store records"));
                        continue;
                    }
                };
                if batch.skipped > 0 {
                    debug!(relation = %relation, skipped = batch.skipped, "items without id skipped");
                }
                consumed.skipped += batch.skipped;
                consumed.duplicates += batch.duplicates;
                consumed.stored += batch.stored.len();

                if archive.index.state() != IndexState::Ready {
                    continue;
                }
                for record in &batch.stored {
                    let entry = archive.store.index_entry(record);
                    match archive.index.index(entry.text, entry.key) {
                        Ok(pending) => consumed.pending.push(pending),
                        Err(e) => debug!(error = %e, "record not indexed"),
                    }
                }
            }
            LoadEvent::CallFailed { .. } => {}
            LoadEvent::Progress { subject, fraction } => {
                reporter.report(ProgressEvent::Loading {
                    subject: subject.name,
                    fraction,
                })
            }
            LoadEvent::SubjectDone { subject } => reporter.report(ProgressEvent::SubjectDone {
                subject: subject.name,
            }),
            LoadEvent::AllDone(summary) => {
                debug!(records = summary.records, "loader finished");
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(consumed),
    }
}

async fn read_millis(kv: &dyn KeyValueStore, key: &str) -> Result<Option<i64>> {
    match kv.get(key).await? {
        Some(value) => Ok(Some(
            value
                .parse()
                .with_context(|| format!("Corrupt value for {}: {}", key, value))?,
        )),
        None => Ok(None),
    }
}

/// Pick the access token: configuration, then environment, then the one
/// stored with `harvest token`.
pub async fn resolve_access_token(
    api: &ApiConfig,
    env: Option<String>,
    kv: &dyn KeyValueStore,
) -> Result<String> {
    if let Some(token) = api.access_token.as_ref().filter(|t| !t.is_empty()) {
        return Ok(token.clone());
    }
    if let Some(token) = env.filter(|t| !t.is_empty()) {
        return Ok(token);
    }
    match kv.get(ACCESS_TOKEN_KEY).await? {
        Some(token) if !token.is_empty() => Ok(token),
        _ => bail!(
            "No access token. Set api.access_token, {} or run `harvest token <TOKEN>`",
            ACCESS_TOKEN_ENV
        ),
    }
}

/// Open the archive with an HTTP client for the configured API.
pub async fn open_harvester(config: &Config) -> Result<Harvester> {
    let archive = Archive::open(config).await?;
    let token = resolve_access_token(
        &config.api,
        std::env::var(ACCESS_TOKEN_ENV).ok(),
        archive.kv.as_ref(),
    )
    .await?;
    let api = Arc::new(HttpGraphApi::new(&config.api, token)?);
    Ok(Harvester::new(
        archive,
        api,
        SchedulerSettings::from_config(&config.api),
    ))
}

/// Look up the root subject with a single direct call; fails if the token
/// is not accepted.
pub async fn verify_token(api: &dyn GraphApi, root: &str) -> Result<Subject> {
    let page = api
        .get(root)
        .await
        .with_context(|| format!("Access token rejected for '{}'", root))?;
    let id = page
        .body
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or(root)
        .to_string();
    let name = page
        .body
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(&id)
        .to_string();
    Ok(Subject::new(id, name))
}

pub async fn store_access_token(config: &Config, token: &str, verify: bool) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        bail!("Access token must not be empty");
    }

    if verify {
        let api = HttpGraphApi::new(&config.api, token.to_string())?;
        let subject = verify_token(&api, &config.harvest.root_subject).await?;
        println!("token accepted for {} ({})", subject.name, subject.id);
    }

    let archive = Archive::open(config).await?;
    archive.kv.set(ACCESS_TOKEN_KEY, token).await?;
    archive.close().await;
    println!("access token stored");
    Ok(())
}

pub async fn run_sync(config: &Config, full: bool, progress: ProgressMode) -> Result<()> {
    let mut harvester = open_harvester(config).await?;
    let reporter = progress.reporter();

    // Ctrl-C stops dispatch; the run then ends as cancelled.
    let scheduler = harvester.scheduler().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            scheduler.stop();
        }
    });

    let result = harvester.harvest(full, reporter.as_ref()).await;
    interrupt.abort();
    let report = result?;

    println!("sync {}", config.harvest.root_subject);
    match report.since {
        Some(since) => println!("  since: {}", since),
        None => println!("  since: (full)"),
    }
    println!("  subjects: {}", report.load.subjects);
    println!(
        "  calls: {} ({} failed)",
        report.load.calls, report.load.failed_calls
    );
    println!("  records fetched: {}", report.load.records);
    println!("  stored: {}", report.stored);
    println!("  duplicates: {}", report.duplicates);
    if report.skipped > 0 {
        println!("  skipped (no id): {}", report.skipped);
    }
    println!("  indexed: {}", report.indexed);
    if report.index_failures > 0 {
        println!("  index failures: {}", report.index_failures);
    }
    println!("  loading: {:.1}s", report.loading.as_secs_f64());
    println!("  indexing: {:.1}s", report.indexing.as_secs_f64());
    println!("ok");

    harvester.into_archive().close().await;
    Ok(())
}
