//! # SQLite Schema
//!
//! DDL and bootstrap for a database file. A file holds:
//!
//! - `file_state`: a single row carrying the schema version, the file's
//!   public/private UUID pair, and the shared `last_sequence` counter that
//!   every key-store in the file allocates from.
//! - `shared_keys`: the persisted dictionary of short ids for document
//!   dictionary keys (see `codec::SharedKeys`).
//! - One `kv_<name>` table per physical key-store, plus a unique sequence
//!   index. An expiration index is added lazily when a store enables
//!   expiration tracking.
//! - One `raw_<name>` table per raw-document store (checkpoints).
//!
//! ## Why These Pragmas?
//!
//! - `journal_mode = WAL`: readers never block the writer and vice versa,
//!   and a reader's open transaction pins a stable snapshot - which is what
//!   lets query enumerators page lazily while commits land underneath them.
//! - `synchronous = NORMAL`: in WAL mode this fsyncs on checkpoint rather
//!   than on every commit; a crash can lose the tail of the log but never
//!   corrupts the file, which is the durability contract this layer offers.
//! - `foreign_keys = OFF`: the schema has no cross-table references the
//!   engine could enforce; sequence/key integrity is this crate's job.
//!
//! ## Why One Table per Key-Store?
//!
//! A `name` column on a single records table would work, but per-store
//! tables keep every scan and count naturally scoped, let a store be dropped
//! with one `DROP TABLE`, and give the live/dead split (see `split.rs`) two
//! tables whose contents never need a filter to tell apart.

use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use crate::error::{Error, Result};

/// Current schema version. Opening a file with a different version fails;
/// there is no migration support yet.
const SCHEMA_VERSION: i64 = 1;

// =============================================================================
// DDL
// =============================================================================

/// The single-row bookkeeping table. `id` is constrained to 1 so an
/// accidental second row is a constraint violation, not silent corruption.
const CREATE_FILE_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS file_state (
    id             INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    public_uuid    BLOB NOT NULL,
    private_uuid   BLOB NOT NULL,
    last_sequence  INTEGER NOT NULL DEFAULT 0
)
"#;

/// The persisted shared-key dictionary. Ids are assigned densely from 0 in
/// insertion order, so the table's natural order reproduces the in-memory
/// dictionary exactly.
const CREATE_SHARED_KEYS: &str = r#"
CREATE TABLE IF NOT EXISTS shared_keys (
    id  INTEGER PRIMARY KEY,
    key TEXT NOT NULL UNIQUE
)
"#;

// =============================================================================
// Connections
// =============================================================================

/// Opens (or creates) a read-write connection with the crate's pragmas
/// applied and the bookkeeping tables bootstrapped.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    initialize(&conn)?;
    Ok(conn)
}

/// Opens a read-only connection to an existing file. Used by query
/// enumerators so reads don't contend with the writer connection.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    // journal_mode reports the resulting mode as a row.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = OFF;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_FILE_STATE)?;
    conn.execute_batch(CREATE_SHARED_KEYS)?;

    let existing: Option<i64> = conn
        .query_row("SELECT schema_version FROM file_state WHERE id = 1", [], |row| {
            row.get(0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(v) => Err(Error::Corrupt(format!(
            "schema version {v} found, expected {SCHEMA_VERSION}"
        ))),
        None => {
            let mut rng = rand::thread_rng();
            let mut public = [0u8; 16];
            let mut private = [0u8; 16];
            rng.fill_bytes(&mut public);
            rng.fill_bytes(&mut private);
            conn.execute(
                "INSERT INTO file_state (id, schema_version, public_uuid, private_uuid, last_sequence)
                 VALUES (1, ?, ?, ?, 0)",
                rusqlite::params![SCHEMA_VERSION, public.as_slice(), private.as_slice()],
            )?;
            Ok(())
        }
    }
}

// =============================================================================
// Key-Store Tables
// =============================================================================

/// Returns true if `name` is acceptable as a key-store name.
///
/// Names become part of a table identifier, so the grammar is deliberately
/// narrow: a letter followed by letters, digits, or underscores.
pub fn valid_store_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The backing table name for a physical key-store.
pub fn store_table(name: &str) -> String {
    format!("kv_{name}")
}

/// The backing table name for the tombstone twin of a store.
pub fn dead_store_table(name: &str) -> String {
    format!("kv_del_{name}")
}

/// The backing table name for a raw-document store.
pub fn raw_table(name: &str) -> String {
    format!("raw_{name}")
}

/// Creates the table and sequence index for a physical key-store.
pub fn create_store(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            key        BLOB PRIMARY KEY NOT NULL,
            sequence   INTEGER NOT NULL,
            version    BLOB NOT NULL,
            body       BLOB NOT NULL,
            flags      INTEGER NOT NULL DEFAULT 0,
            expiration INTEGER NOT NULL DEFAULT 0
        );
         CREATE UNIQUE INDEX IF NOT EXISTS \"{table}_seq\" ON \"{table}\" (sequence);"
    ))?;
    Ok(())
}

/// Adds the partial expiration index used by `next_expiration` scans.
/// Idempotent; called when a store (or a query against it) enables
/// expiration tracking.
pub fn create_expiration_index(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS \"{table}_exp\" ON \"{table}\" (expiration)
         WHERE expiration > 0;"
    ))?;
    Ok(())
}

/// Creates the table for a raw-document store.
pub fn create_raw_store(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            key  BLOB PRIMARY KEY NOT NULL,
            meta BLOB NOT NULL,
            body BLOB NOT NULL
        );"
    ))?;
    Ok(())
}

/// Drops a table if it exists.
pub fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    Ok(())
}

/// Returns true if a table (or virtual table) with this exact name exists.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// =============================================================================
// File State Accessors
// =============================================================================

/// Reads the file's shared last-allocated sequence.
pub fn last_sequence(conn: &Connection) -> Result<u64> {
    let seq: i64 = conn.query_row("SELECT last_sequence FROM file_state WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(seq as u64)
}

/// Reads the file's UUID pair (public, private).
pub fn uuids(conn: &Connection) -> Result<([u8; 16], [u8; 16])> {
    let (public, private): (Vec<u8>, Vec<u8>) = conn.query_row(
        "SELECT public_uuid, private_uuid FROM file_state WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let public: [u8; 16] = public
        .try_into()
        .map_err(|_| Error::Corrupt("public UUID is not 16 bytes".into()))?;
    let private: [u8; 16] = private
        .try_into()
        .map_err(|_| Error::Corrupt("private UUID is not 16 bytes".into()))?;
    Ok((public, private))
}

// =============================================================================
// File Info
// =============================================================================

/// A snapshot of file-level statistics.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path of the main database file.
    pub path: std::path::PathBuf,
    /// Size of the main database file in bytes.
    pub size_on_disk: u64,
    /// Total record count across all key-store tables, tombstones included.
    pub doc_count: u64,
    /// Last sequence allocated in the file.
    pub last_sequence: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = open(&dir.path().join("t.db")).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_bootstrap_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let c1 = open(&path).unwrap();
        let (pub1, priv1) = uuids(&c1).unwrap();
        drop(c1);
        let c2 = open(&path).unwrap();
        let (pub2, priv2) = uuids(&c2).unwrap();
        assert_eq!(pub1, pub2, "UUIDs must survive reopen");
        assert_eq!(priv1, priv2);
        assert_ne!(pub1, priv1, "public and private UUIDs must differ");
    }

    #[test]
    fn test_store_name_validation() {
        assert!(valid_store_name("docs"));
        assert!(valid_store_name("del_docs"));
        assert!(valid_store_name("a1_b2"));
        assert!(!valid_store_name(""));
        assert!(!valid_store_name("1docs"));
        assert!(!valid_store_name("docs;drop"));
        assert!(!valid_store_name("docs\""));
    }

    #[test]
    fn test_create_and_detect_tables() {
        let (_dir, conn) = temp_db();
        assert!(!table_exists(&conn, "kv_docs").unwrap());
        create_store(&conn, "kv_docs").unwrap();
        assert!(table_exists(&conn, "kv_docs").unwrap());
        drop_table(&conn, "kv_docs").unwrap();
        assert!(!table_exists(&conn, "kv_docs").unwrap());
    }

    #[test]
    fn test_last_sequence_starts_at_zero() {
        let (_dir, conn) = temp_db();
        assert_eq!(last_sequence(&conn).unwrap(), 0);
    }
}
