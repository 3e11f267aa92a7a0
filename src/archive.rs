//! The local harvest archive: key-value storage, the record store loaded
//! from it, and the search index over those records.
//!
//! Everything here works without network access. [`crate::ingest`] adds the
//! remote side on top.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::{Config, HarvestConfig};
use crate::db;
use crate::kv::{KeyValueStore, SqliteKv};
use crate::migrate;
use crate::models::Record;
use crate::progress::{ProgressMode, ProgressReporter};
use crate::search::{IndexError, IndexState, SearchIndex};
use crate::store::RecordStore;

pub struct Archive {
    pool: SqlitePool,
    pub kv: Arc<dyn KeyValueStore>,
    pub store: RecordStore,
    pub index: SearchIndex,
    pub harvest: HarvestConfig,
}

impl Archive {
    /// Open (and migrate) the database and load known records. The search
    /// index starts `Uninitialized`; its storage is opened by
    /// [`Archive::ensure_index`].
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;

        let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteKv::new(pool.clone()));
        let store = RecordStore::load(kv.clone(), &config.harvest)
            .await
            .context("Failed to load stored records")?;
        let index = SearchIndex::new(pool.clone(), config.index.tokenizer.clone());
        debug!(records = store.len(), "archive opened");

        Ok(Self {
            pool,
            kv,
            store,
            index,
            harvest: config.harvest.clone(),
        })
    }

    /// Make the index `Ready`, building it from the known records if
    /// needed. Returns how long a build took.
    pub async fn ensure_index(
        &self,
        reporter: &dyn ProgressReporter,
    ) -> Result<Option<Duration>, IndexError> {
        match self.index.state() {
            IndexState::Ready => Ok(None),
            IndexState::Building => {
                let mut updates = self.index.subscribe();
                if updates
                    .wait_for(|s| *s != IndexState::Building)
                    .await
                    .is_err()
                {
                    return Err(IndexError::NotReady(IndexState::Building));
                }
                match self.index.state() {
                    IndexState::Ready => Ok(None),
                    other => Err(IndexError::NotReady(other)),
                }
            }
            IndexState::Uninitialized => {
                let started = Instant::now();
                self.index
                    .start(&self.store.index_entries(), reporter)
                    .await?;
                Ok(Some(started.elapsed()))
            }
        }
    }

    /// Records matching `term`, in index order. Keys without a record are
    /// skipped.
    pub async fn search(&self, term: &str) -> Result<Vec<&Record>, IndexError> {
        let keys = self.index.search(term).await?;
        Ok(self.store.resolve(&keys))
    }

    /// Forget every record, the stored token and timestamps, and the index.
    pub async fn reset(&mut self) -> Result<()> {
        self.store.reset().await?;
        self.index.reset().await?;
        info!("archive reset");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub async fn run_search(config: &Config, term: &str, progress: ProgressMode) -> Result<()> {
    let archive = Archive::open(config).await?;
    let reporter = progress.reporter();
    archive.ensure_index(reporter.as_ref()).await?;

    let results = archive.search(term).await?;
    if results.is_empty() {
        println!("No results.");
    } else {
        for (i, record) in results.iter().enumerate() {
            println!(
                "{}. [{}] {} / {}",
                i + 1,
                record.relation_type,
                record.subject_name,
                record.preview.as_deref().unwrap_or("(no preview)")
            );
            println!("    key: {}", record.storage_key);
        }
    }

    archive.close().await;
    Ok(())
}

pub async fn run_reset(config: &Config) -> Result<()> {
    let mut archive = Archive::open(config).await?;
    let records = archive.store.len();
    archive.reset().await?;
    println!("reset");
    println!("  records removed: {}", records);
    println!("ok");
    archive.close().await;
    Ok(())
}
