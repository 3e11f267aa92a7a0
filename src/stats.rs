//! Archive status overview.
//!
//! Record counts per relation and when the last harvest ran. Used by
//! `harvest status` to confirm that syncs are picking things up.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::archive::Archive;
use crate::config::Config;
use crate::kv::{
    KeyValueStore, ACCESS_TOKEN_KEY, HARVEST_FINISHED_KEY, HARVEST_STARTED_KEY,
    INDEXING_MILLIS_KEY,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestStatus {
    pub records: usize,
    pub stubs: usize,
    pub connections: usize,
    pub by_relation: BTreeMap<String, usize>,
    pub token_stored: bool,
    /// Unix milliseconds.
    pub last_started: Option<i64>,
    pub last_finished: Option<i64>,
    pub indexing_millis: Option<i64>,
}

impl HarvestStatus {
    /// Loading time of the last harvest.
    pub fn loading_millis(&self) -> Option<i64> {
        match (self.last_started, self.last_finished) {
            (Some(started), Some(finished)) if finished >= started => Some(finished - started),
            _ => None,
        }
    }
}

pub async fn harvest_status(archive: &Archive) -> Result<HarvestStatus> {
    let kv = archive.kv.as_ref();
    Ok(HarvestStatus {
        records: archive.store.len(),
        stubs: archive
            .store
            .records()
            .iter()
            .filter(|r| r.state.is_stub())
            .count(),
        connections: archive.store.connections().len(),
        by_relation: archive.store.relation_counts(),
        token_stored: kv.get(ACCESS_TOKEN_KEY).await?.is_some(),
        last_started: millis(kv, HARVEST_STARTED_KEY).await?,
        last_finished: millis(kv, HARVEST_FINISHED_KEY).await?,
        indexing_millis: millis(kv, INDEXING_MILLIS_KEY).await?,
    })
}

// Unparseable values are reported as missing.
async fn millis(kv: &dyn KeyValueStore, key: &str) -> Result<Option<i64>> {
    Ok(kv.get(key).await?.and_then(|v| v.parse().ok()))
}

/// Run the status command: load the archive and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let archive = Archive::open(config).await?;
    let status = harvest_status(&archive).await?;
    archive.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Graph Harvest — Status");
    println!("======================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!(
        "  Token:        {}",
        if status.token_stored { "stored" } else { "not stored" }
    );
    println!();
    println!("  Records:      {}", status.records);
    println!("  Connections:  {}", status.connections);
    println!(
        "  Last updated: {}",
        match status.last_finished {
            Some(ms) => format_ts_relative(ms / 1000),
            None => "never".to_string(),
        }
    );
    if let Some(ms) = status.loading_millis() {
        println!("  Loading took: {}", format_duration(ms));
    }
    if let Some(ms) = status.indexing_millis {
        println!("  Indexing took: {}", format_duration(ms));
    }

    if !status.by_relation.is_empty() {
        println!();
        println!("  By relation:");
        println!("  {:<24} {:>8}", "RELATION", "RECORDS");
        println!("  {}", "-".repeat(33));
        for (relation, count) in &status.by_relation {
            println!("  {:<24} {:>8}", relation, count);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{} ms", ms)
    } else if ms < 60_000 {
        format!("{:.1} s", ms as f64 / 1000.0)
    } else {
        format!("{} min {} s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Subject;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn durations_are_readable() {
        assert_eq!(format_duration(250), "250 ms");
        assert_eq!(format_duration(2500), "2.5 s");
        assert_eq!(format_duration(125_000), "2 min 5 s");
    }

    #[tokio::test]
    async fn fresh_archive_was_never_harvested() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(&Config::with_db_path(tmp.path().join("h.sqlite")))
            .await
            .unwrap();
        let status = harvest_status(&archive).await.unwrap();
        assert_eq!(status, HarvestStatus::default());
        assert_eq!(status.loading_millis(), None);
    }

    #[tokio::test]
    async fn status_counts_relations_and_timings() {
        let tmp = TempDir::new().unwrap();
        let mut archive = Archive::open(&Config::with_db_path(tmp.path().join("h.sqlite")))
            .await
            .unwrap();
        let me = Subject::new("me", "me");
        for (id, relation) in [("1", "friends"), ("2", "likes"), ("3", "likes")] {
            archive
                .store
                .ingest(&json!({"id": id, "name": "x"}), &me, relation)
                .await
                .unwrap();
        }
        archive.kv.set(HARVEST_STARTED_KEY, "1000").await.unwrap();
        archive.kv.set(HARVEST_FINISHED_KEY, "4500").await.unwrap();

        let status = harvest_status(&archive).await.unwrap();
        assert_eq!(status.records, 3);
        assert_eq!(status.stubs, 0);
        assert_eq!(status.connections, 1);
        assert_eq!(status.by_relation.get("likes"), Some(&2));
        assert_eq!(status.loading_millis(), Some(3500));
    }
}
