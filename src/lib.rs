//! # nookdb - Embedded Document Store Core
//!
//! nookdb is the storage and query core of an embedded, schemaless document
//! database built on SQLite, designed to sit under a replication-capable
//! data layer. It provides:
//!
//! - **Sequenced key-stores**: opaque documents indexed by key and by a
//!   file-wide monotonic sequence number
//! - **Live/tombstone federation**: deletions move records into a twin
//!   store, so replication can enumerate them without special cases
//! - **Single-writer transactions**: per-file serialization with scoped
//!   commit/abort semantics
//! - **A paged query enumerator**: snapshot-stable results in one-shot
//!   (streaming) or buffered (seekable, refreshable) form
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Database                                │
//! │        (handle cache, lifecycle, raw-document stores)           │
//! └───────────────┬──────────────────────────────┬──────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────────┐  ┌───────────────────────────────┐
//! │        SplitKeyStore          │  │      Query / Enumerator       │
//! │   live ──────────── dead      │  │  (compiled SQL, paged rows,   │
//! │   (one shared sequence space) │  │   snapshot per enumerator)    │
//! └───────────────┬───────────────┘  └───────────────┬───────────────┘
//!                 │                                  │
//!                 ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SQLite (WAL)                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One side at a time**: a key lives in a split store's live side or
//!    its dead side, never both, between transactions
//! 2. **File-wide sequences**: every write gets the next sequence from the
//!    file's shared allocator; sequences never repeat or go backward
//! 3. **One writer per file**: transactions on the same path serialize,
//!    even across database handles and threads
//! 4. **Snapshot-stable queries**: an enumerator's rows come from the
//!    snapshot it was created against, whatever commits meanwhile
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`types`]: sequences, flags, records, enumeration options
//! - [`schema`]: SQLite DDL and file bootstrap
//! - [`keystore`]: the physical key-store primitive and record cursors
//! - [`split`]: the live/tombstone federation
//! - [`transaction`]: per-file write serialization and observers
//! - [`database`]: the façade tying the above together
//! - [`codec`]: the value codec and row recordings
//! - [`query`]: selector compilation artifacts
//! - [`enumerator`]: the paged query enumerator
//! - [`checkpoints`]: replication checkpoint storage

pub mod checkpoints;
pub mod codec;
pub mod database;
pub mod enumerator;
pub mod error;
pub mod keystore;
pub mod query;
pub mod schema;
pub mod split;
pub mod transaction;
pub mod types;

pub use database::{Database, RawDocument};
pub use enumerator::{EnumState, QueryEnumerator, QueryOptions};
pub use error::{Error, Result};
pub use keystore::{KeyStore, RecordCursor, RecordEnumerator, SequenceAllocator};
pub use query::{CompiledSelector, FullTextTerm, Query, QueryCompiler};
pub use split::SplitKeyStore;
pub use transaction::{PreTransactionObserver, Transaction, TransactionState};
pub use types::{ContentOption, DocumentFlags, EnumerateOptions, Record, Sequence, SortOption};
