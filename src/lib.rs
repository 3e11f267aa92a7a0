//! # Graph Harvest
//!
//! Archives a social graph account: the account's own relations (likes,
//! posts, friends, ...) and the relations of each of its connections, under
//! the rate and batch limits of the remote API, then makes everything
//! searchable offline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌─────────────┐   ┌─────────────┐
//! │ ConnectionLoader │──▶│  Scheduler  │──▶│  Graph API  │
//! │ subject by subj. │   │ batch+rate  │   │ batch POST  │
//! └────────┬─────────┘   └─────────────┘   └─────────────┘
//!          │ records
//!          ▼
//! ┌──────────────────┐   ┌─────────────┐   ┌─────────────┐
//! │   RecordStore    │──▶│   extract   │──▶│ SearchIndex │
//! │ dedup + stubs    │   │ whitelisted │   │   (FTS5)    │
//! └────────┬─────────┘   └─────────────┘   └──────┬──────┘
//!          ▼                                      │
//!       SQLite kv ◀────────── search keys ◀───────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init
//! harvest token "$TOKEN"
//! harvest sync
//! harvest search "ann"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`api`] | Remote graph API client |
//! | [`scheduler`] | Rate-limited batching request scheduler |
//! | [`loader`] | Subject-by-subject harvesting |
//! | [`store`] | Record deduplication and stub persistence |
//! | [`extract`] | Indexable text extraction |
//! | [`search`] | Incremental full-text index |
//! | [`kv`] | Key-value storage |
//! | [`archive`] | Local records and index |
//! | [`ingest`] | Harvest pipeline |
//! | [`get`] | Record retrieval |
//! | [`stats`] | Archive status |
//! | [`progress`] | Progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod api;
pub mod archive;
pub mod config;
pub mod db;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod kv;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod scheduler;
pub mod search;
pub mod stats;
pub mod store;
