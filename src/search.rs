//! Incremental full-text index over harvested records.
//!
//! Backed by an SQLite FTS5 table (`record_fts`) whose tokenizer acts as the
//! analyzer (lower-casing and diacritic folding by default). The index has
//! an explicit lifecycle:
//!
//! ```text
//!   Uninitialized ──start()──▶ Building ──▶ Ready
//!         ▲                        │          │
//!         └──── (open failure) ────┘          │
//!         └──────────────── reset() ──────────┘
//! ```
//!
//! [`SearchIndex::start`] rebuilds the table from the entries it is given,
//! so after a reset only currently known records come back.
//! [`SearchIndex::index`] and [`SearchIndex::search`] are refused with
//! [`IndexError::NotReady`] outside `Ready`.

use std::collections::HashSet;

use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::migrate;
use crate::progress::{ProgressEvent, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Uninitialized,
    Building,
    Ready,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index is not ready (currently {0:?})")]
    NotReady(IndexState),
    #[error("search index cannot start while {0:?}")]
    InvalidState(IndexState),
    #[error("failed to open search storage: {0}")]
    Open(#[source] sqlx::Error),
    #[error("failed to write to search index: {0}")]
    Write(#[source] sqlx::Error),
    #[error("search query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("index write was aborted before it committed")]
    Aborted,
}

/// Key and text of one indexed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: String,
    pub text: String,
}

/// Handle to an incremental write.
pub struct PendingWrite {
    key: String,
    handle: JoinHandle<Result<(), IndexError>>,
}

impl PendingWrite {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait until the write is committed.
    pub async fn committed(self) -> Result<(), IndexError> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Aborted),
        }
    }
}

pub struct SearchIndex {
    pool: SqlitePool,
    tokenizer: String,
    state: watch::Sender<IndexState>,
}

impl SearchIndex {
    pub fn new(pool: SqlitePool, tokenizer: impl Into<String>) -> Self {
        let (state, _) = watch::channel(IndexState::Uninitialized);
        Self {
            pool,
            tokenizer: tokenizer.into(),
            state,
        }
    }

    pub fn state(&self) -> IndexState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexState> {
        self.state.subscribe()
    }

    /// Build the index from `entries` and become `Ready`.
    ///
    /// Reports one [`ProgressEvent::Indexing`] per entry. On failure the
    /// index returns to `Uninitialized`.
    pub async fn start(
        &self,
        entries: &[IndexEntry],
        reporter: &dyn ProgressReporter,
    ) -> Result<(), IndexError> {
        let mut current = IndexState::Uninitialized;
        let claimed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == IndexState::Uninitialized {
                *state = IndexState::Building;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(IndexError::InvalidState(current));
        }

        info!(entries = entries.len(), "building search index");
        match self.build(entries, reporter).await {
            Ok(()) => {
                self.state.send_replace(IndexState::Ready);
                reporter.report(ProgressEvent::IndexReady {
                    entries: entries.len() as u64,
                });
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(IndexState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        entries: &[IndexEntry],
        reporter: &dyn ProgressReporter,
    ) -> Result<(), IndexError> {
        migrate::create_index_table(&self.pool, &self.tokenizer)
            .await
            .map_err(IndexError::Open)?;

        let mut tx = self.pool.begin().await.map_err(IndexError::Open)?;
        sqlx::query("DELETE FROM record_fts")
            .execute(&mut *tx)
            .await
            .map_err(IndexError::Write)?;

        let total = entries.len() as u64;
        for (i, entry) in entries.iter().enumerate() {
            sqlx::query("INSERT INTO record_fts (key, text) VALUES (?, ?)")
                .bind(&entry.key)
                .bind(&entry.text)
                .execute(&mut *tx)
                .await
                .map_err(IndexError::Write)?;
            reporter.report(ProgressEvent::Indexing {
                n: i as u64 + 1,
                total,
            });
        }

        tx.commit().await.map_err(IndexError::Write)?;
        Ok(())
    }

    /// Queue an incremental write of `text` under `key`.
    pub fn index(&self, text: String, key: String) -> Result<PendingWrite, IndexError> {
        let state = self.state();
        if state != IndexState::Ready {
            return Err(IndexError::NotReady(state));
        }

        let pool = self.pool.clone();
        let write_key = key.clone();
        let handle = tokio::spawn(async move {
            sqlx::query("INSERT INTO record_fts (key, text) VALUES (?, ?)")
                .bind(&write_key)
                .bind(&text)
                .execute(&pool)
                .await
                .map_err(IndexError::Write)?;
            debug!(key = %write_key, "indexed record");
            Ok(())
        });

        Ok(PendingWrite { key, handle })
    }

    /// Keys whose text contains every term of `term`, deduplicated, in
    /// index order.
    pub async fn search(&self, term: &str) -> Result<Vec<String>, IndexError> {
        let state = self.state();
        if state != IndexState::Ready {
            return Err(IndexError::NotReady(state));
        }

        let Some(expression) = match_expression(term) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query("SELECT key FROM record_fts WHERE record_fts MATCH ? ORDER BY rowid")
            .bind(&expression)
            .fetch_all(&self.pool)
            .await
            .map_err(IndexError::Query)?;

        let mut seen = HashSet::new();
        let keys = rows
            .iter()
            .map(|row| row.get::<String, _>("key"))
            .filter(|key| seen.insert(key.clone()))
            .collect();
        Ok(keys)
    }

    /// Drop every entry and return to `Uninitialized`. The table is
    /// recreated by the next [`SearchIndex::start`].
    pub async fn reset(&self) -> Result<(), IndexError> {
        sqlx::query("DROP TABLE IF EXISTS record_fts")
            .execute(&self.pool)
            .await
            .map_err(IndexError::Write)?;
        self.state.send_replace(IndexState::Uninitialized);
        info!("search index reset");
        Ok(())
    }
}

/// Wait for a batch of incremental writes, returning how many committed
/// and the failures.
pub async fn flush(pending: Vec<PendingWrite>) -> (usize, Vec<(String, IndexError)>) {
    let mut committed = 0;
    let mut failures = Vec::new();
    for write in pending {
        let key = write.key.clone();
        match write.committed().await {
            Ok(()) => committed += 1,
            Err(e) => failures.push((key, e)),
        }
    }
    (committed, failures)
}

/// Quote every word of the user's term so FTS5 operators in it are taken
/// literally; words are implicitly ANDed.
fn match_expression(term: &str) -> Option<String> {
    let words: Vec<String> = term
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::progress::NoProgress;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TOKENIZER: &str = "unicode61 remove_diacritics 2";

    async fn open_index() -> (TempDir, SearchIndex) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        (tmp, SearchIndex::new(pool, TOKENIZER))
    }

    fn entry(key: &str, text: &str) -> IndexEntry {
        IndexEntry {
            key: key.to_string(),
            text: text.to_string(),
        }
    }

    #[derive(Default)]
    struct CountingProgress(Mutex<Vec<ProgressEvent>>);

    impl ProgressReporter for CountingProgress {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn match_expression_quotes_words() {
        assert_eq!(match_expression("Ann OR x*").unwrap(), "\"Ann\" \"OR\" \"x\"");
        assert_eq!(match_expression("  -- "), None);
    }

    #[tokio::test]
    async fn search_before_ready_is_refused() {
        let (_tmp, index) = open_index().await;
        assert!(matches!(
            index.search("Ann").await,
            Err(IndexError::NotReady(IndexState::Uninitialized))
        ));
        assert!(matches!(
            index.index("Ann".into(), "me:1".into()),
            Err(IndexError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn start_builds_and_reports_each_item() {
        let (_tmp, index) = open_index().await;
        let progress = CountingProgress::default();
        index
            .start(
                &[entry("me:1", "Ann likes tea"), entry("me:2", "Bob")],
                &progress,
            )
            .await
            .unwrap();

        assert_eq!(index.state(), IndexState::Ready);
        let events = progress.0.lock().unwrap();
        let indexing = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Indexing { .. }))
            .count();
        assert_eq!(indexing, 2);
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::IndexReady { entries: 2 })
        ));
        drop(events);

        assert_eq!(index.search("ann").await.unwrap(), vec!["me:1"]);
        assert!(index.search("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let (_tmp, index) = open_index().await;
        index.start(&[], &NoProgress).await.unwrap();
        assert!(matches!(
            index.start(&[], &NoProgress).await,
            Err(IndexError::InvalidState(IndexState::Ready))
        ));
    }

    #[tokio::test]
    async fn incremental_writes_become_searchable() {
        let (_tmp, index) = open_index().await;
        index.start(&[], &NoProgress).await.unwrap();

        let pending = vec![
            index.index("José in Zürich".into(), "me:1".into()).unwrap(),
            index.index("Zurich again".into(), "me:2".into()).unwrap(),
        ];
        let (committed, failures) = flush(pending).await;
        assert_eq!(committed, 2);
        assert!(failures.is_empty());

        let mut keys = index.search("zurich").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["me:1", "me:2"]);
        assert_eq!(index.search("jose").await.unwrap(), vec!["me:1"]);
    }

    #[tokio::test]
    async fn duplicate_postings_are_collapsed() {
        let (_tmp, index) = open_index().await;
        index
            .start(&[entry("me:1", "Ann"), entry("me:1", "Ann again")], &NoProgress)
            .await
            .unwrap();
        assert_eq!(index.search("Ann").await.unwrap(), vec!["me:1"]);
    }

    #[tokio::test]
    async fn reset_then_start_rebuilds_from_given_entries_only() {
        let (_tmp, index) = open_index().await;
        index
            .start(&[entry("me:1", "Ann"), entry("me:2", "Ann")], &NoProgress)
            .await
            .unwrap();

        index.reset().await.unwrap();
        assert_eq!(index.state(), IndexState::Uninitialized);
        assert!(index.search("Ann").await.is_err());

        index.start(&[entry("me:2", "Ann")], &NoProgress).await.unwrap();
        assert_eq!(index.search("Ann").await.unwrap(), vec!["me:2"]);
    }

    #[tokio::test]
    async fn open_failure_returns_to_uninitialized() {
        let (_tmp, index) = open_index().await;
        let broken = SearchIndex::new(index.pool.clone(), "no_such_tokenizer");
        assert!(matches!(
            broken.start(&[], &NoProgress).await,
            Err(IndexError::Open(_))
        ));
        assert_eq!(broken.state(), IndexState::Uninitialized);
        // nothing was created, so there is nothing to drop
        broken.reset().await.unwrap();
    }
}
