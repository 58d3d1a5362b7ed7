//! # refsync
//!
//! Incremental synchronization of a reference-management library into a
//! linked-data item store.
//!
//! Each run asks the source API which records changed since the last
//! version cursor, maps them onto the store's vocabularies, and upserts
//! documents, people, tag concepts and tagging annotations without
//! creating duplicates on repeated runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Source API  │──▶│   Mapper    │──▶│   Upserter   │──▶│  Store   │
//! │ versions,   │   │ priority    │   │ dedup keys,  │   │ SQLite / │
//! │ items, tags │   │ tables      │   │ import links │   │ memory   │
//! └─────────────┘   └─────────────┘   └──────┬───────┘   └──────────┘
//!                                            │
//!                              ┌─────────────┴─────────────┐
//!                              ▼                           ▼
//!                       ┌────────────┐              ┌─────────────┐
//!                       │  Taxonomy  │─────────────▶│ Annotations │
//!                       └────────────┘              └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! refsync init
//! refsync container create "My library"
//! refsync import --library-type user --library-id 12345 --container 1
//! refsync runs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Source API errors |
//! | [`models`] | Source wire types, target drafts and records, run bookkeeping |
//! | [`vocab`] | Built-in vocabulary catalogue |
//! | [`schema`] | Per-run cache of live classes and properties |
//! | [`mapping`] | Priority mapping tables |
//! | [`source`] | Source API client and transport |
//! | [`mapper`] | Source record to draft mapping |
//! | [`upsert`] | Dedup/upsert engine |
//! | [`actors`] | Account and person actors |
//! | [`taxonomy`] | Compound tag labels to concept chains |
//! | [`annotate`] | Tag ledger and tagging annotations |
//! | [`ingest`] | Import run state machine |
//! | [`progress`] | Progress reporting on stderr |
//! | [`store`] | Store traits and backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod actors;
pub mod annotate;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod mapper;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod schema;
pub mod source;
pub mod store;
pub mod taxonomy;
pub mod upsert;
pub mod vocab;
