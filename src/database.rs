//! # Database Façade
//!
//! A `Database` owns one read-write connection to a file, a cache of open
//! key-store handles, and a reference to the file's process-wide `File`
//! state (writer slot + observers). It is deliberately a single-thread
//! object: open one `Database` per thread, on the same path if you like -
//! the shared `File` serializes their writers.
//!
//! Document stores come in two shapes:
//!
//! - [`key_store`](Database::key_store): a bare physical store.
//! - [`split_store`](Database::split_store): the live/tombstone federation
//!   most callers want, backed by `kv_<name>` and `kv_del_<name>`.
//!
//! Raw-document stores (`raw_get`/`raw_put`) are the minimal interface the
//! checkpoint layer consumes: opaque id to `{meta, body}`, not sequenced,
//! not enumerable.
//!
//! ## Rust Pattern: Single-Threaded by Construction
//!
//! `Database` holds its connection and handle cache in `Rc` and `RefCell`,
//! so the compiler itself keeps it off other threads - there is no `unsafe
//! impl`, and no lock around the handle cache, because `!Send + !Sync` makes
//! both unnecessary. Cross-thread coordination happens only at the `File`
//! level, which is `Arc`-shared and mutex-guarded precisely because it's the
//! one piece multiple handles must agree on.
//!
//! ## Why a Per-Path Flyweight?
//!
//! Embedding a back-pointer from transactions to databases to files would
//! create reference cycles. Instead the process keeps one `File` per path in
//! a global map; every `Database` holds an `Arc` into it, and transactions
//! borrow the `Database`. Ownership flows one way, and two handles on the
//! same path converge on the same writer slot without knowing about each
//! other.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Weak};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::codec::{self, SharedKeys};
use crate::error::{Error, Result};
use crate::keystore::{KeyStore, SequenceAllocator};
use crate::schema::{self, FileInfo};
use crate::split::SplitKeyStore;
use crate::transaction::{File, PreTransactionObserver, Transaction};
use crate::types::Sequence;

// =============================================================================
// Raw Documents
// =============================================================================

/// A raw document: opaque id mapped to metadata and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
}

// =============================================================================
// Database
// =============================================================================

/// Handle to a database file. See the module docs for the threading model.
pub struct Database {
    path: PathBuf,
    conn: Rc<Connection>,
    file: Arc<File>,
    allocator: Rc<SequenceAllocator>,
    stores: RefCell<HashMap<String, Rc<KeyStore>>>,
    splits: RefCell<HashMap<String, Rc<SplitKeyStore>>>,
    doc_keys: RefCell<SharedKeys>,
}

impl Database {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Rc::new(schema::open(&path)?);
        let file = File::for_path(&path);
        let allocator = Rc::new(SequenceAllocator::new(Rc::clone(&conn)));
        let doc_keys = SharedKeys::load(&conn)?;
        info!(path = %path.display(), "opened database");
        Ok(Self {
            path,
            conn,
            file,
            allocator,
            stores: RefCell::new(HashMap::new()),
            splits: RefCell::new(HashMap::new()),
            doc_keys: RefCell::new(doc_keys),
        })
    }

    /// The database file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub(crate) fn writer_conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn shared_conn(&self) -> Rc<Connection> {
        Rc::clone(&self.conn)
    }

    /// The last sequence allocated in this file.
    pub fn last_sequence(&self) -> Result<Sequence> {
        self.allocator.last()
    }

    /// The file's stable public UUID.
    pub fn public_uuid(&self) -> Result<[u8; 16]> {
        Ok(schema::uuids(&self.conn)?.0)
    }

    /// The file's private UUID, used to derive checkpoint ids.
    pub fn private_uuid(&self) -> Result<[u8; 16]> {
        Ok(schema::uuids(&self.conn)?.1)
    }

    // -------------------------------------------------------------------------
    // Key-Store Handles
    // -------------------------------------------------------------------------

    /// Opens (or returns the cached handle for) a physical key-store.
    pub fn key_store(&self, name: &str) -> Result<Rc<KeyStore>> {
        if !schema::valid_store_name(name) {
            return Err(Error::InvalidParameter(format!("invalid store name '{name}'")));
        }
        if let Some(store) = self.stores.borrow().get(name) {
            return Ok(Rc::clone(store));
        }
        let store = Rc::new(KeyStore::open(
            Rc::clone(&self.conn),
            name,
            schema::store_table(name),
            Rc::clone(&self.allocator),
        )?);
        self.stores
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&store));
        Ok(store)
    }

    /// Opens (or returns the cached handle for) a live/tombstone split store.
    pub fn split_store(&self, name: &str) -> Result<Rc<SplitKeyStore>> {
        if let Some(store) = self.splits.borrow().get(name) {
            return Ok(Rc::clone(store));
        }
        let live = self.key_store(name)?;
        let dead_name = format!("del_{name}");
        if !schema::valid_store_name(&dead_name) {
            return Err(Error::InvalidParameter(format!("invalid store name '{name}'")));
        }
        let dead = Rc::new(KeyStore::open(
            Rc::clone(&self.conn),
            &dead_name,
            schema::dead_store_table(name),
            Rc::clone(&self.allocator),
        )?);
        let store = Rc::new(SplitKeyStore::new(live, dead));
        self.splits
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&store));
        Ok(store)
    }

    /// Drops a key-store's cached handle. The on-disk data stays.
    pub fn close_key_store(&self, name: &str) {
        self.stores.borrow_mut().remove(name);
        self.splits.borrow_mut().remove(name);
    }

    /// Drops the handle and deletes the store's data (both sides, if a split
    /// store was opened under this name).
    pub fn delete_key_store(&self, name: &str) -> Result<()> {
        if !schema::valid_store_name(name) {
            return Err(Error::InvalidParameter(format!("invalid store name '{name}'")));
        }
        self.close_key_store(name);
        schema::drop_table(&self.conn, &schema::store_table(name))?;
        schema::drop_table(&self.conn, &schema::dead_store_table(name))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------

    /// Encodes a JSON document into the file's value format, interning any
    /// new dictionary keys and persisting them inside the caller's
    /// transaction (keys must commit with the documents that use them).
    pub fn encode_document(&self, json: &[u8], t: &Transaction) -> Result<Vec<u8>> {
        let parsed: serde_json::Value = serde_json::from_slice(json)
            .map_err(|e| Error::InvalidParameter(format!("invalid document JSON: {e}")))?;
        let mut keys = self.doc_keys.borrow_mut();
        let before = keys.len();
        let value = codec::value_from_json(&parsed, &mut keys);
        if keys.len() > before {
            t.check(keys.persist_from(&self.conn, before))?;
        }
        Ok(codec::encode_value_to_vec(&value))
    }

    /// A snapshot of the file's document shared-keys dictionary.
    pub fn document_keys(&self) -> SharedKeys {
        self.doc_keys.borrow().clone()
    }

    /// Re-reads the dictionary from disk. Called after a rollback, which may
    /// have discarded keys the in-memory copy already interned; the cache
    /// may lag the file but must never lead it.
    pub(crate) fn reload_document_keys(&self) {
        match SharedKeys::load(&self.conn) {
            Ok(keys) => *self.doc_keys.borrow_mut() = keys,
            Err(e) => warn!("failed to reload shared keys after rollback: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // Raw Documents
    // -------------------------------------------------------------------------

    /// Reads a raw document. A missing store or key is `None`, not an error.
    pub fn raw_get(&self, store: &str, key: &[u8]) -> Result<Option<RawDocument>> {
        if !schema::valid_store_name(store) {
            return Err(Error::InvalidParameter(format!("invalid store name '{store}'")));
        }
        let table = schema::raw_table(store);
        if !schema::table_exists(&self.conn, &table)? {
            return Ok(None);
        }
        let doc = self
            .conn
            .query_row(
                &format!("SELECT meta, body FROM \"{table}\" WHERE key = ?"),
                [key],
                |row| {
                    Ok(RawDocument {
                        key: key.to_vec(),
                        meta: row.get(0)?,
                        body: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(doc)
    }

    /// Upserts a raw document within the caller's transaction.
    pub fn raw_put(
        &self,
        store: &str,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
        t: &Transaction,
    ) -> Result<()> {
        if !schema::valid_store_name(store) {
            return Err(Error::InvalidParameter(format!("invalid store name '{store}'")));
        }
        let table = schema::raw_table(store);
        t.check((|| {
            schema::create_raw_store(&self.conn, &table)?;
            self.conn.execute(
                &format!(
                    "INSERT INTO \"{table}\" (key, meta, body) VALUES (?, ?, ?)
                     ON CONFLICT(key) DO UPDATE SET meta = excluded.meta, body = excluded.body"
                ),
                rusqlite::params![key, meta, body],
            )?;
            Ok(())
        })())
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Registers a pre-transaction observer on this database's file.
    /// Returns a token for [`remove_pre_transaction_observer`](Self::remove_pre_transaction_observer).
    pub fn add_pre_transaction_observer(
        &self,
        observer: Weak<dyn PreTransactionObserver>,
    ) -> Result<u64> {
        self.file.add_observer(observer)
    }

    /// Removes a previously registered observer.
    pub fn remove_pre_transaction_observer(&self, token: u64) {
        self.file.remove_observer(token);
    }

    // -------------------------------------------------------------------------
    // File Lifecycle
    // -------------------------------------------------------------------------

    /// File-level statistics.
    pub fn file_info(&self) -> Result<FileInfo> {
        let size_on_disk = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let mut doc_count = 0u64;
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'kv\\_%' ESCAPE '\\'",
        )?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        for table in tables {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| row.get(0))?;
            doc_count += n as u64;
        }
        Ok(FileInfo {
            path: self.path.clone(),
            size_on_disk,
            doc_count,
            last_sequence: schema::last_sequence(&self.conn)?,
        })
    }

    /// Compacts the file: checkpoints the WAL and vacuums. Must not be
    /// called with a transaction open on this handle.
    pub fn compact(&self) -> Result<()> {
        debug!(path = %self.path.display(), "compacting");
        // wal_checkpoint reports (busy, wal pages, checkpointed) as a row.
        let _stats: (i64, i64, i64) =
            self.conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// Deletes the database's files from disk, blocking writers while doing
    /// so, and optionally reopens a fresh database at the same path.
    ///
    /// Consumes the handle: key-store handles obtained from it keep the old
    /// (unlinked) file alive until they drop, but see none of the new data.
    pub fn delete_database(self, and_reopen: bool) -> Result<Option<Database>> {
        // A no-op writer slot: excludes writers without an engine transaction,
        // since the file is about to disappear.
        self.file.notify_pre_transaction();
        self.file.acquire();
        info!(path = %self.path.display(), "deleting database");

        let Database {
            path,
            conn,
            file,
            allocator,
            stores,
            splits,
            doc_keys,
        } = self;
        // Close every handle this Database owns before unlinking.
        drop(stores);
        drop(splits);
        drop(doc_keys);
        drop(allocator);
        drop(conn);

        let result = (|| {
            Self::remove_files(&path)?;
            if and_reopen {
                Ok(Some(Self::open(&path)?))
            } else {
                Ok(None)
            }
        })();
        file.release();
        result
    }

    /// Deletes a database's files (main, WAL, SHM) without opening it.
    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        Self::remove_files(path.as_ref())
    }

    fn remove_files(path: &Path) -> Result<()> {
        let mut sidecar_wal = path.as_os_str().to_os_string();
        sidecar_wal.push("-wal");
        let mut sidecar_shm = path.as_os_str().to_os_string();
        sidecar_shm.push("-shm");
        for p in [path.to_path_buf(), sidecar_wal.into(), sidecar_shm.into()] {
            match std::fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
