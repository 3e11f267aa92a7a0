//! Record store and deduplicator.
//!
//! Holds the in-memory set of harvested records and mirrors a minimal
//! projection of each one into the [`KeyValueStore`]:
//!
//! | Key | Value |
//! |-----|-------|
//! | `record_ids.<n>` | JSON array of up to 500 storage keys, in ingest order |
//! | `<subject_id>:<remote_id>` | JSON [`RecordStub`] |
//!
//! A storage key is stored (and handed on for indexing) at most once, so
//! re-running a harvest or receiving late outcomes after a stop never
//! duplicates work. The id list is split into segments so that storing a
//! batch only rewrites the segments it touched. Stubs loaded from storage can be promoted back to full
//! records by re-fetching them through the [`Scheduler`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::CallError;
use crate::config::HarvestConfig;
use crate::extract::indexable_text;
use crate::kv::{KeyValueStore, RECORD_IDS_KEY};
use crate::models::{Record, RecordState, RecordStub, Subject};
use crate::scheduler::Scheduler;
use crate::search::IndexEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record has no id")]
    MissingId,
    #[error("unknown record: {0}")]
    UnknownRecord(String),
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("key-value storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Storage keys per `record_ids.<n>` segment.
const ID_SEGMENT_LEN: usize = 500;

fn id_segment_key(segment: usize) -> String {
    format!("{}.{}", RECORD_IDS_KEY, segment)
}

/// Result of [`RecordStore::ingest`].
#[derive(Debug, Clone)]
pub struct Ingested {
    /// `false` if the storage key was already known; nothing was written.
    pub stored: bool,
    pub record: Record,
}

/// Result of [`RecordStore::ingest_all`].
#[derive(Debug, Clone, Default)]
pub struct IngestedBatch {
    /// Newly stored records, in item order.
    pub stored: Vec<Record>,
    pub duplicates: usize,
    /// Items without an id.
    pub skipped: usize,
}

pub struct RecordStore {
    kv: Arc<dyn KeyValueStore>,
    harvest: HarvestConfig,
    records: Vec<Record>,
    positions: HashMap<String, usize>,
}

impl RecordStore {
    /// An empty store. Use [`RecordStore::load`] to pick up a previous harvest.
    pub fn new(kv: Arc<dyn KeyValueStore>, config: &HarvestConfig) -> Self {
        Self {
            kv,
            harvest: config.clone(),
            records: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Rebuild the record set from persisted stubs. Ids without a stub are
    /// skipped.
    pub async fn load(
        kv: Arc<dyn KeyValueStore>,
        config: &HarvestConfig,
    ) -> Result<Self, StoreError> {
        let mut store = Self::new(kv, config);

        let mut ids: Vec<String> = Vec::new();
        for segment in 0.. {
            let Some(json) = store.kv.get(&id_segment_key(segment)).await? else {
                break;
            };
            ids.extend(serde_json::from_str::<Vec<String>>(&json)?);
        }

        for id in ids {
            let Some(json) = store.kv.get(&id).await? else {
                warn!(key = %id, "record id without stored stub, skipping");
                continue;
            };
            let stub: RecordStub = match serde_json::from_str(&json) {
                Ok(stub) => stub,
                Err(e) => {
                    warn!(key = %id, error = %e, "unreadable stub, skipping");
                    continue;
                }
            };
            store.insert(stub.into_record());
        }

        debug!(records = store.records.len(), "record store loaded");
        Ok(store)
    }

    fn insert(&mut self, record: Record) {
        if self.positions.contains_key(&record.storage_key) {
            return;
        }
        self.positions
            .insert(record.storage_key.clone(), self.records.len());
        self.records.push(record);
    }

    /// Store `raw` as a record of `relation` for `subject`, unless its
    /// storage key is already known.
    pub async fn ingest(
        &mut self,
        raw: &Value,
        subject: &Subject,
        relation: &str,
    ) -> Result<Ingested, StoreError> {
        let remote_id = remote_id(raw).ok_or(StoreError::MissingId)?;
        let storage_key = Record::storage_key_for(&subject.id, &remote_id);

        if let Some(&pos) = self.positions.get(&storage_key) {
            return Ok(Ingested {
                stored: false,
                record: self.records[pos].clone(),
            });
        }

        let first_new = self.records.len();
        let record = self
            .store_stub(raw, subject, relation, remote_id, storage_key)
            .await?;
        self.commit_ids(first_new).await?;

        Ok(Ingested {
            stored: true,
            record,
        })
    }

    /// Store every item of one page. Items without an id are counted and
    /// skipped; the id list is written once, before returning.
    pub async fn ingest_all(
        &mut self,
        items: &[Value],
        subject: &Subject,
        relation: &str,
    ) -> Result<IngestedBatch, StoreError> {
        let first_new = self.records.len();
        let mut batch = IngestedBatch::default();

        for raw in items {
            let Some(remote_id) = remote_id(raw) else {
                batch.skipped += 1;
                continue;
            };
            let storage_key = Record::storage_key_for(&subject.id, &remote_id);
            if self.positions.contains_key(&storage_key) {
                batch.duplicates += 1;
                continue;
            }
            match self
                .store_stub(raw, subject, relation, remote_id, storage_key)
                .await
            {
                Ok(record) => batch.stored.push(record),
                Err(e) => {
                    self.truncate(first_new);
                    return Err(e);
                }
            }
        }

        self.commit_ids(first_new).await?;
        Ok(batch)
    }

    /// Persist the stub of a new record and keep the full record in memory.
    async fn store_stub(
        &mut self,
        raw: &Value,
        subject: &Subject,
        relation: &str,
        remote_id: String,
        storage_key: String,
    ) -> Result<Record, StoreError> {
        let data: Map<String, Value> = raw.as_object().cloned().unwrap_or_default();
        let preview = preview_text(raw, &self.harvest.preview_path(relation));

        let stub = RecordStub {
            id: remote_id.clone(),
            subject_id: subject.id.clone(),
            subject_name: subject.name.clone(),
            relation_type: relation.to_string(),
            preview: preview.clone(),
            storage_key: storage_key.clone(),
            picture: data
                .get("picture")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: if relation == self.harvest.connections_relation {
                data.get("name").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            },
            stub: true,
        };
        self.kv
            .set(&storage_key, &serde_json::to_string(&stub)?)
            .await?;

        let record = Record {
            storage_key,
            remote_id,
            subject_id: subject.id.clone(),
            subject_name: subject.name.clone(),
            relation_type: relation.to_string(),
            preview,
            state: RecordState::Full(data),
        };
        self.insert(record.clone());
        Ok(record)
    }

    /// Write the id segments holding records from `first_new` on. On
    /// failure those records are forgotten again.
    async fn commit_ids(&mut self, first_new: usize) -> Result<(), StoreError> {
        let result = self.write_id_segments(first_new).await;
        if result.is_err() {
            self.truncate(first_new);
        }
        result
    }

    async fn write_id_segments(&self, first_new: usize) -> Result<(), StoreError> {
        let len = self.records.len();
        if first_new >= len {
            return Ok(());
        }
        for segment in first_new / ID_SEGMENT_LEN..=(len - 1) / ID_SEGMENT_LEN {
            let start = segment * ID_SEGMENT_LEN;
            let end = (start + ID_SEGMENT_LEN).min(len);
            let ids: Vec<&str> = self.records[start..end]
                .iter()
                .map(|r| r.storage_key.as_str())
                .collect();
            self.kv
                .set(&id_segment_key(segment), &serde_json::to_string(&ids)?)
                .await?;
        }
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        for record in self.records.drain(len..) {
            self.positions.remove(&record.storage_key);
        }
    }

    /// Fetch the full data of a stub record. Failures are attached to the
    /// record instead of being returned.
    pub async fn promote(
        &mut self,
        storage_key: &str,
        scheduler: &Scheduler,
    ) -> Result<Record, StoreError> {
        let pos = *self
            .positions
            .get(storage_key)
            .ok_or_else(|| StoreError::UnknownRecord(storage_key.to_string()))?;

        if !self.records[pos].state.is_stub() {
            return Ok(self.records[pos].clone());
        }

        let remote_id = self.records[pos].remote_id.clone();
        let result = scheduler.call(remote_id).await;

        let record = &mut self.records[pos];
        let mut data = record.state.data().clone();
        record.state = match result {
            Ok(page) => {
                if let Value::Object(full) = page.body {
                    data.extend(full);
                }
                RecordState::Full(data)
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "could not load record details");
                let message = match e {
                    CallError::Remote { message, .. } => message,
                    other => other.to_string(),
                };
                RecordState::FullWithError(data, message)
            }
        };

        Ok(record.clone())
    }

    pub fn get(&self, storage_key: &str) -> Option<&Record> {
        self.positions
            .get(storage_key)
            .map(|&pos| &self.records[pos])
    }

    /// Records for `keys`, skipping keys no longer present.
    pub fn resolve(&self, keys: &[String]) -> Vec<&Record> {
        keys.iter().filter_map(|key| self.get(key)).collect()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Connection subjects, in the order they were first stored.
    pub fn connections(&self) -> Vec<Subject> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| r.relation_type == self.harvest.connections_relation)
            .filter(|r| seen.insert(r.remote_id.clone()))
            .map(|r| Subject::new(&r.remote_id, r.name().unwrap_or(&r.remote_id)))
            .collect()
    }

    /// Indexable text of a record.
    pub fn index_entry(&self, record: &Record) -> IndexEntry {
        IndexEntry {
            key: record.storage_key.clone(),
            text: indexable_text(&record.document(), &self.harvest.indexable_keys),
        }
    }

    /// Index entries for every known record.
    pub fn index_entries(&self) -> Vec<IndexEntry> {
        self.records.iter().map(|r| self.index_entry(r)).collect()
    }

    /// Record count per relation type.
    pub fn relation_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.relation_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Forget every record and clear the key-value store.
    pub async fn reset(&mut self) -> Result<(), StoreError> {
        self.kv.clear_all().await?;
        self.records.clear();
        self.positions.clear();
        Ok(())
    }
}

fn remote_id(raw: &Value) -> Option<String> {
    match raw.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Follow a dotted path through `value`. A missing segment yields `None`;
/// a sequence along the way is replaced by its first element. An object at
/// the end is shown by its `name`.
pub fn preview_text(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
        if let Value::Array(items) = current {
            current = items.first()?;
        }
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
