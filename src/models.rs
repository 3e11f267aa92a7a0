//! Core data models used throughout the harvester.
//!
//! These types represent the subjects, pages and records that flow through
//! the scheduling, storage and indexing pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A harvested entity whose relations are fetched: the root account or one
/// of its connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

impl Subject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One successfully parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Full JSON body as returned by the API.
    pub body: Value,
    /// Relative path of the next page, if the listing continues.
    pub next: Option<String>,
}

impl Page {
    /// Items of a listing page (`data` array), or the body itself for a
    /// single-object response.
    pub fn items(&self) -> Vec<Value> {
        match self.body.get("data") {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => Vec::new(),
            None => vec![self.body.clone()],
        }
    }
}

/// Whether a record's full data is in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
    /// Only the persisted projection is known.
    Stub(Map<String, Value>),
    Full(Map<String, Value>),
    /// A stub whose detail fetch failed; the record stays visible.
    FullWithError(Map<String, Value>, String),
}

impl RecordState {
    pub fn is_stub(&self) -> bool {
        matches!(self, RecordState::Stub(_))
    }

    pub fn data(&self) -> &Map<String, Value> {
        match self {
            RecordState::Stub(data) | RecordState::Full(data) => data,
            RecordState::FullWithError(data, _) => data,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RecordState::FullWithError(_, error) => Some(error),
            _ => None,
        }
    }
}

/// A harvested record plus the meta fields the harvester attaches to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// `"{subject_id}:{remote_id}"`, unique among stored records.
    pub storage_key: String,
    pub remote_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub relation_type: String,
    pub preview: Option<String>,
    pub state: RecordState,
}

impl Record {
    pub fn storage_key_for(subject_id: &str, remote_id: &str) -> String {
        format!("{}:{}", subject_id, remote_id)
    }

    /// The record as one JSON object: remote fields in their original order
    /// followed by the meta fields. This is what the text extractor walks.
    pub fn document(&self) -> Value {
        let mut doc = self.state.data().clone();
        doc.insert("subject_id".into(), Value::String(self.subject_id.clone()));
        doc.insert(
            "subject_name".into(),
            Value::String(self.subject_name.clone()),
        );
        doc.insert(
            "relation_type".into(),
            Value::String(self.relation_type.clone()),
        );
        doc.insert(
            "preview".into(),
            self.preview.clone().map(Value::String).unwrap_or(Value::Null),
        );
        doc.insert(
            "storage_key".into(),
            Value::String(self.storage_key.clone()),
        );
        if let Some(error) = self.state.error() {
            doc.insert("error".into(), Value::String(error.to_string()));
        }
        Value::Object(doc)
    }

    /// Display name of the record, used when it becomes a subject.
    pub fn name(&self) -> Option<&str> {
        self.state.data().get("name").and_then(Value::as_str)
    }
}

/// Minimal persisted projection of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordStub {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub relation_type: String,
    pub preview: Option<String>,
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stub: bool,
}

impl RecordStub {
    pub fn into_record(self) -> Record {
        let mut data = Map::new();
        data.insert("id".into(), Value::String(self.id.clone()));
        if let Some(name) = self.name {
            data.insert("name".into(), Value::String(name));
        }
        if let Some(picture) = self.picture {
            data.insert("picture".into(), Value::String(picture));
        }
        Record {
            storage_key: self.storage_key,
            remote_id: self.id,
            subject_id: self.subject_id,
            subject_name: self.subject_name,
            relation_type: self.relation_type,
            preview: self.preview,
            state: RecordState::Stub(data),
        }
    }
}
