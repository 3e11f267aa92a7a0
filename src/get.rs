//! Record retrieval by storage key.
//!
//! Shows what the archive knows about one record. Records loaded from
//! storage are stubs; `--fetch` promotes the stub by re-fetching the
//! record's details through the scheduler.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;

use crate::archive::Archive;
use crate::config::Config;
use crate::ingest::open_harvester;
use crate::models::{Record, RecordState};

#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    pub key: String,
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub relation_type: String,
    pub preview: Option<String>,
    /// `stub`, `full` or `error`.
    pub state: &'static str,
    pub error: Option<String>,
    pub data: Value,
}

impl From<&Record> for RecordResponse {
    fn from(record: &Record) -> Self {
        let state = match record.state {
            RecordState::Stub(_) => "stub",
            RecordState::Full(_) => "full",
            RecordState::FullWithError(..) => "error",
        };
        Self {
            key: record.storage_key.clone(),
            id: record.remote_id.clone(),
            subject_id: record.subject_id.clone(),
            subject_name: record.subject_name.clone(),
            relation_type: record.relation_type.clone(),
            preview: record.preview.clone(),
            state,
            error: record.state.error().map(str::to_string),
            data: Value::Object(record.state.data().clone()),
        }
    }
}

pub async fn get_record(config: &Config, key: &str, fetch: bool) -> Result<RecordResponse> {
    if fetch {
        let mut harvester = open_harvester(config).await?;
        if harvester.archive().store.get(key).is_none() {
            harvester.into_archive().close().await;
            bail!("record not found: {}", key);
        }
        let record = harvester.fetch(key).await?;
        harvester.into_archive().close().await;
        return Ok(RecordResponse::from(&record));
    }

    let archive = Archive::open(config).await?;
    let response = archive.store.get(key).map(RecordResponse::from);
    archive.close().await;
    match response {
        Some(response) => Ok(response),
        None => bail!("record not found: {}", key),
    }
}

pub async fn run_get(config: &Config, key: &str, fetch: bool) -> Result<()> {
    let record = get_record(config, key, fetch).await?;

    println!("--- Record ---");
    println!("key:          {}", record.key);
    println!("id:           {}", record.id);
    println!("subject:      {} ({})", record.subject_name, record.subject_id);
    println!("relation:     {}", record.relation_type);
    println!(
        "preview:      {}",
        record.preview.as_deref().unwrap_or("(none)")
    );
    println!("state:        {}", record.state);
    if let Some(ref error) = record.error {
        println!("error:        {}", error);
    }
    println!();

    println!("--- Data ---");
    println!("{}", serde_json::to_string_pretty(&record.data)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn response_reports_state_and_error() {
        let mut data = Map::new();
        data.insert("id".into(), json!("1"));
        let record = Record {
            storage_key: "me:1".into(),
            remote_id: "1".into(),
            subject_id: "me".into(),
            subject_name: "me".into(),
            relation_type: "posts".into(),
            preview: Some("Hi".into()),
            state: RecordState::FullWithError(data, "gone".into()),
        };
        let response = RecordResponse::from(&record);
        assert_eq!(response.state, "error");
        assert_eq!(response.error.as_deref(), Some("gone"));
        assert_eq!(response.data, json!({"id": "1"}));
    }
}
