//! # Physical Key-Store
//!
//! A named collection of [`Record`]s backed by one SQLite table. This is the
//! storage primitive: get/set/del by key with optional CAS-on-sequence,
//! counts, expiration tracking, and key- or sequence-ordered enumeration.
//!
//! A physical store does not interpret the deleted flag - routing tombstones
//! to a separate table is the split store's job (see `split.rs`). What it
//! *does* own is sequence assignment: every successful write is stamped from
//! a [`SequenceAllocator`], and two stores can be made to draw from the same
//! allocator via [`KeyStore::share_sequences_with`], which is how a live
//! store and its tombstone twin keep one sequence space.
//!
//! ## Write Semantics
//!
//! [`KeyStore::set`] folds three write shapes into one method, selected by
//! the `replacing` argument:
//!
//! | `replacing` | Meaning | On conflict |
//! |-------------|---------|-------------|
//! | `None` | Unconditional upsert | - |
//! | `Some(0)` | Insert only if absent | Returns sequence 0 |
//! | `Some(s > 0)` | Update only if stored sequence == s | Returns sequence 0 |
//!
//! Returning the sentinel instead of an error keeps optimistic-concurrency
//! conflicts on the ordinary return path - they're an expected outcome, and
//! the caller (usually the split store) decides what happens next.
//!
//! ## Rust Pattern: Transactions as Proof
//!
//! Write methods take a `&Transaction` parameter they barely touch. It does
//! two jobs: the borrow checker won't let a caller write without having
//! entered a transaction scope (the type *is* the proof), and routing the
//! result through [`Transaction::check`] flips the scope to abort if the
//! engine fails mid-write.
//!
//! ## Concurrency
//!
//! A `KeyStore` is owned by its `Database` and lives on that database's
//! thread; the `&Transaction` it demands is what serializes writers across
//! threads and handles.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::schema;
use crate::transaction::Transaction;
use crate::types::{ContentOption, DocumentFlags, EnumerateOptions, Record, Sequence, SortOption};

// =============================================================================
// Sequence Allocator
// =============================================================================

/// Hands out strictly increasing sequences, persisting the high-water mark
/// in the file's `file_state` row.
///
/// Allocation happens inside the caller's write transaction, so an aborted
/// transaction rolls the counter back along with the records it stamped.
#[derive(Debug)]
pub struct SequenceAllocator {
    conn: Rc<Connection>,
}

impl SequenceAllocator {
    pub(crate) fn new(conn: Rc<Connection>) -> Self {
        Self { conn }
    }

    /// Allocates the next sequence.
    pub fn allocate(&self) -> Result<Sequence> {
        let seq: i64 = self.conn.query_row(
            "UPDATE file_state SET last_sequence = last_sequence + 1 WHERE id = 1
             RETURNING last_sequence",
            [],
            |row| row.get(0),
        )?;
        Ok(Sequence::from_raw(seq as u64))
    }

    /// The last sequence allocated (0 if none yet).
    pub fn last(&self) -> Result<Sequence> {
        Ok(Sequence::from_raw(schema::last_sequence(&self.conn)?))
    }
}

// =============================================================================
// Key-Store
// =============================================================================

/// A physical key-store over one SQLite table.
pub struct KeyStore {
    conn: Rc<Connection>,
    name: String,
    table: String,
    allocator: RefCell<Rc<SequenceAllocator>>,
    expiration_tracked: Cell<bool>,
}

impl KeyStore {
    /// Opens the store, creating its table if needed.
    pub(crate) fn open(
        conn: Rc<Connection>,
        name: &str,
        table: String,
        allocator: Rc<SequenceAllocator>,
    ) -> Result<Self> {
        schema::create_store(&conn, &table)?;
        Ok(Self {
            conn,
            name: name.to_string(),
            table,
            allocator: RefCell::new(allocator),
            expiration_tracked: Cell::new(false),
        })
    }

    /// The store's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs `other`'s sequence allocator into this store, so both stamp
    /// writes from one counter. Must be called before this store's first
    /// write; the split store does this at construction.
    pub fn share_sequences_with(&self, other: &KeyStore) {
        if std::ptr::eq(self, other) {
            return;
        }
        *self.allocator.borrow_mut() = Rc::clone(&other.allocator.borrow());
    }

    /// The last sequence allocated in this store's sequence space.
    pub fn last_sequence(&self) -> Result<Sequence> {
        self.allocator.borrow().last()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Looks up a record by key. `MetaOnly` skips loading the body.
    pub fn get(&self, key: &[u8], content: ContentOption) -> Result<Option<Record>> {
        let sql = match content {
            ContentOption::All => format!(
                "SELECT sequence, version, body, flags, expiration FROM \"{}\" WHERE key = ?",
                self.table
            ),
            ContentOption::MetaOnly => format!(
                "SELECT sequence, version, NULL, flags, expiration FROM \"{}\" WHERE key = ?",
                self.table
            ),
        };
        let rec = self
            .conn
            .query_row(&sql, [key], |row| {
                let sequence: i64 = row.get(0)?;
                let version: Vec<u8> = row.get(1)?;
                let body: Option<Vec<u8>> = row.get(2)?;
                let flags: i64 = row.get(3)?;
                let expiration: i64 = row.get(4)?;
                Ok(Record {
                    key: key.to_vec(),
                    version,
                    body: body.unwrap_or_default(),
                    flags: DocumentFlags::from_raw(flags as u8),
                    sequence: Sequence::from_raw(sequence as u64),
                    expiration: expiration as u64,
                })
            })
            .optional()?;
        Ok(rec)
    }

    /// Counts records. With `include_deleted` false, records carrying the
    /// deleted flag are excluded; passing true is cheaper when the caller
    /// knows the store holds none (a split store's live side).
    pub fn record_count(&self, include_deleted: bool) -> Result<u64> {
        let sql = if include_deleted {
            format!("SELECT count(*) FROM \"{}\"", self.table)
        } else {
            format!("SELECT count(*) FROM \"{}\" WHERE (flags & 1) = 0", self.table)
        };
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Looks up several bodies at once, preserving input order. `callback`
    /// maps each found record to its returned body (or `None` to drop it);
    /// missing keys yield `None`.
    pub fn with_doc_bodies<F>(&self, keys: &[&[u8]], callback: &mut F) -> Result<Vec<Option<Vec<u8>>>>
    where
        F: FnMut(&Record) -> Option<Vec<u8>>,
    {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(key, ContentOption::All)? {
                Some(rec) => out.push(callback(&rec)),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Writes a record and returns its new sequence.
    ///
    /// - `replacing` absent: unconditional upsert.
    /// - `replacing == 0`: insert only if the key is absent; on conflict
    ///   returns [`Sequence::NONE`].
    /// - `replacing > 0`: update only if the stored sequence matches; on
    ///   mismatch returns [`Sequence::NONE`]. With `new_sequence` false the
    ///   record keeps `replacing` instead of getting a fresh sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        key: &[u8],
        version: &[u8],
        body: &[u8],
        flags: DocumentFlags,
        t: &Transaction,
        replacing: Option<Sequence>,
        new_sequence: bool,
    ) -> Result<Sequence> {
        if key.is_empty() {
            return Err(Error::InvalidParameter("record key must be non-empty".into()));
        }
        t.check(self.set_inner(key, version, body, flags, replacing, new_sequence))
    }

    fn set_inner(
        &self,
        key: &[u8],
        version: &[u8],
        body: &[u8],
        flags: DocumentFlags,
        replacing: Option<Sequence>,
        new_sequence: bool,
    ) -> Result<Sequence> {
        match replacing {
            None => {
                let seq = self.allocator.borrow().allocate()?;
                self.conn.execute(
                    &format!(
                        "INSERT INTO \"{}\" (key, sequence, version, body, flags, expiration)
                         VALUES (?, ?, ?, ?, ?, 0)
                         ON CONFLICT(key) DO UPDATE SET
                             sequence = excluded.sequence,
                             version  = excluded.version,
                             body     = excluded.body,
                             flags    = excluded.flags",
                        self.table
                    ),
                    params![key, seq.as_raw() as i64, version, body, flags.as_raw() as i64],
                )?;
                Ok(seq)
            }
            Some(expected) if expected.is_none() => {
                // Insert-only: any existing record is a conflict.
                if self.get(key, ContentOption::MetaOnly)?.is_some() {
                    return Ok(Sequence::NONE);
                }
                let seq = self.allocator.borrow().allocate()?;
                self.conn.execute(
                    &format!(
                        "INSERT INTO \"{}\" (key, sequence, version, body, flags, expiration)
                         VALUES (?, ?, ?, ?, ?, 0)",
                        self.table
                    ),
                    params![key, seq.as_raw() as i64, version, body, flags.as_raw() as i64],
                )?;
                Ok(seq)
            }
            Some(expected) => {
                let current: Option<i64> = self
                    .conn
                    .query_row(
                        &format!("SELECT sequence FROM \"{}\" WHERE key = ?", self.table),
                        [key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if current != Some(expected.as_raw() as i64) {
                    return Ok(Sequence::NONE);
                }
                let seq = if new_sequence {
                    self.allocator.borrow().allocate()?
                } else {
                    expected
                };
                self.conn.execute(
                    &format!(
                        "UPDATE \"{}\" SET sequence = ?, version = ?, body = ?, flags = ?
                         WHERE key = ?",
                        self.table
                    ),
                    params![seq.as_raw() as i64, version, body, flags.as_raw() as i64, key],
                )?;
                Ok(seq)
            }
        }
    }

    /// Deletes a record. With `expected` this is a CAS delete: the row is
    /// removed only if it exists with exactly that sequence. Returns whether
    /// a row was removed.
    pub fn del(&self, key: &[u8], t: &Transaction, expected: Option<Sequence>) -> Result<bool> {
        t.check(self.del_inner(key, expected))
    }

    fn del_inner(&self, key: &[u8], expected: Option<Sequence>) -> Result<bool> {
        let changed = match expected {
            Some(seq) => self.conn.execute(
                &format!("DELETE FROM \"{}\" WHERE key = ? AND sequence = ?", self.table),
                params![key, seq.as_raw() as i64],
            )?,
            None => self.conn.execute(
                &format!("DELETE FROM \"{}\" WHERE key = ?", self.table),
                params![key],
            )?,
        };
        Ok(changed > 0)
    }

    /// Removes every record, leaving the sequence counter alone.
    pub fn erase(&self, t: &Transaction) -> Result<()> {
        t.check((|| {
            self.conn
                .execute(&format!("DELETE FROM \"{}\"", self.table), [])?;
            Ok(())
        })())
    }

    // -------------------------------------------------------------------------
    // Expiration
    // -------------------------------------------------------------------------

    /// Enables expiration tracking: builds the partial index that makes
    /// `next_expiration` cheap. Idempotent.
    pub fn add_expiration(&self) -> Result<()> {
        if !self.expiration_tracked.get() {
            schema::create_expiration_index(&self.conn, &self.table)?;
            self.expiration_tracked.set(true);
        }
        Ok(())
    }

    /// Sets (or with 0 clears) a record's expiration. Returns whether the
    /// record exists.
    pub fn set_expiration(&self, key: &[u8], when: u64, t: &Transaction) -> Result<bool> {
        self.add_expiration()?;
        t.check((|| {
            let changed = self.conn.execute(
                &format!("UPDATE \"{}\" SET expiration = ? WHERE key = ?", self.table),
                params![when as i64, key],
            )?;
            Ok(changed > 0)
        })())
    }

    /// Reads a record's expiration; 0 if unset or the record is missing.
    pub fn expiration_of(&self, key: &[u8]) -> Result<u64> {
        let exp: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT expiration FROM \"{}\" WHERE key = ?", self.table),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exp.unwrap_or(0) as u64)
    }

    /// The earliest positive expiration in the store; 0 if none.
    pub fn next_expiration(&self) -> Result<u64> {
        let min: Option<i64> = self.conn.query_row(
            &format!(
                "SELECT min(expiration) FROM \"{}\" WHERE expiration > 0",
                self.table
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(min.unwrap_or(0) as u64)
    }

    // -------------------------------------------------------------------------
    // Enumeration
    // -------------------------------------------------------------------------

    /// Creates a cursor over the store.
    ///
    /// `by_sequence` orders and filters by sequence (`since` is exclusive);
    /// otherwise ordering is by key and `since` is ignored. The rows visible
    /// to the cursor are fixed when it is created.
    pub fn new_cursor(
        &self,
        by_sequence: bool,
        since: Sequence,
        options: &EnumerateOptions,
    ) -> Result<Box<dyn RecordCursor>> {
        let body_col = match options.content {
            ContentOption::All => "body",
            ContentOption::MetaOnly => "NULL",
        };
        let mut sql = format!(
            "SELECT key, sequence, version, {body_col}, flags, expiration FROM \"{}\"",
            self.table
        );
        let mut clauses: Vec<String> = Vec::new();
        if by_sequence && !since.is_none() {
            clauses.push(format!("sequence > {}", since.as_raw()));
        }
        if !options.include_deleted {
            clauses.push("(flags & 1) = 0".to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let order_col = if by_sequence { "sequence" } else { "key" };
        match options.sort {
            SortOption::Unsorted => {}
            SortOption::Ascending => sql.push_str(&format!(" ORDER BY {order_col} ASC")),
            SortOption::Descending => sql.push_str(&format!(" ORDER BY {order_col} DESC")),
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let key: Vec<u8> = row.get(0)?;
            let sequence: i64 = row.get(1)?;
            let version: Vec<u8> = row.get(2)?;
            let body: Option<Vec<u8>> = row.get(3)?;
            let flags: i64 = row.get(4)?;
            let expiration: i64 = row.get(5)?;
            Ok(Record {
                key,
                version,
                body: body.unwrap_or_default(),
                flags: DocumentFlags::from_raw(flags as u8),
                sequence: Sequence::from_raw(sequence as u64),
                expiration: expiration as u64,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(Box::new(PhysicalCursor::new(records)))
    }
}

// =============================================================================
// Cursors
// =============================================================================

/// Abstract cursor over a key-store: advance, then inspect the current row.
///
/// Three implementations exist: the physical cursor below, the merged
/// live/dead cursor in `split.rs`, and [`EmptyCursor`].
pub trait RecordCursor {
    /// Advances to the next record; false when exhausted.
    fn next(&mut self) -> bool;
    /// Key of the current record. Only valid after `next()` returned true.
    fn key(&self) -> &[u8];
    /// Sequence of the current record.
    fn sequence(&self) -> Sequence;
    /// Copies out the current record.
    fn read(&self) -> Record;
}

/// Cursor over a snapshot of physical-store rows.
pub struct PhysicalCursor {
    rows: std::vec::IntoIter<Record>,
    current: Option<Record>,
}

impl PhysicalCursor {
    fn new(records: Vec<Record>) -> Self {
        Self {
            rows: records.into_iter(),
            current: None,
        }
    }
}

impl RecordCursor for PhysicalCursor {
    fn next(&mut self) -> bool {
        self.current = self.rows.next();
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|r| r.key.as_slice()).unwrap_or(&[])
    }

    fn sequence(&self) -> Sequence {
        self.current.as_ref().map(|r| r.sequence).unwrap_or(Sequence::NONE)
    }

    fn read(&self) -> Record {
        self.current.clone().unwrap_or_default()
    }
}

/// A cursor over nothing.
pub struct EmptyCursor;

impl RecordCursor for EmptyCursor {
    fn next(&mut self) -> bool {
        false
    }

    fn key(&self) -> &[u8] {
        &[]
    }

    fn sequence(&self) -> Sequence {
        Sequence::NONE
    }

    fn read(&self) -> Record {
        Record::default()
    }
}

/// Public enumerator wrapping a cursor and the current record.
pub struct RecordEnumerator {
    imp: Box<dyn RecordCursor>,
    record: Record,
}

impl RecordEnumerator {
    pub(crate) fn new(imp: Box<dyn RecordCursor>) -> Self {
        Self {
            imp,
            record: Record::default(),
        }
    }

    /// Advances to the next record; false when exhausted.
    pub fn next(&mut self) -> bool {
        if self.imp.next() {
            self.record = self.imp.read();
            true
        } else {
            self.record = Record::default();
            false
        }
    }

    /// The current record. Only meaningful after `next()` returned true.
    pub fn record(&self) -> &Record {
        &self.record
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn temp_store() -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("ks.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_upsert_assigns_fresh_sequences() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();

        let s1 = store
            .set(b"a", b"1-aa", b"one", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        let s2 = store
            .set(b"a", b"2-aa", b"two", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        assert_eq!(s1.as_raw(), 1);
        assert_eq!(s2.as_raw(), 2);

        let rec = store.get(b"a", ContentOption::All).unwrap().unwrap();
        assert_eq!(rec.body, b"two");
        assert_eq!(rec.version, b"2-aa");
        assert_eq!(rec.sequence, s2);
        t.commit().unwrap();
    }

    #[test]
    fn test_insert_only_conflicts_on_existing_key() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();

        let s1 = store
            .set(b"a", b"1-aa", b"one", DocumentFlags::NONE, &t, Some(Sequence::NONE), true)
            .unwrap();
        assert_eq!(s1.as_raw(), 1);

        let s2 = store
            .set(b"a", b"1-bb", b"other", DocumentFlags::NONE, &t, Some(Sequence::NONE), true)
            .unwrap();
        assert!(s2.is_none());

        // A conflict burns no sequence.
        assert_eq!(store.last_sequence().unwrap().as_raw(), 1);
        t.commit().unwrap();
    }

    #[test]
    fn test_cas_update_and_delete() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();

        let s1 = store
            .set(b"a", b"1-aa", b"one", DocumentFlags::NONE, &t, None, true)
            .unwrap();

        // Mismatched expectation fails without touching the row.
        let stale = Sequence::from_raw(99);
        assert!(store
            .set(b"a", b"2-aa", b"x", DocumentFlags::NONE, &t, Some(stale), true)
            .unwrap()
            .is_none());
        assert!(!store.del(b"a", &t, Some(stale)).unwrap());
        assert_eq!(store.get(b"a", ContentOption::All).unwrap().unwrap().body, b"one");

        // Matching expectation succeeds.
        let s2 = store
            .set(b"a", b"2-aa", b"two", DocumentFlags::NONE, &t, Some(s1), true)
            .unwrap();
        assert_eq!(s2.as_raw(), 2);
        assert!(store.del(b"a", &t, Some(s2)).unwrap());
        assert!(store.get(b"a", ContentOption::MetaOnly).unwrap().is_none());
        t.commit().unwrap();
    }

    #[test]
    fn test_cas_update_can_keep_the_old_sequence() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();

        let s1 = store
            .set(b"a", b"1-aa", b"one", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        let s2 = store
            .set(b"a", b"1-ab", b"patched", DocumentFlags::NONE, &t, Some(s1), false)
            .unwrap();
        assert_eq!(s2, s1, "new_sequence=false reuses the replaced sequence");
        assert_eq!(store.last_sequence().unwrap(), s1);
        t.commit().unwrap();
    }

    #[test]
    fn test_meta_only_get_skips_the_body() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();
        store
            .set(b"a", b"1-aa", b"payload", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        t.commit().unwrap();

        let rec = store.get(b"a", ContentOption::MetaOnly).unwrap().unwrap();
        assert!(rec.body.is_empty());
        assert_eq!(rec.version, b"1-aa");
        assert!(rec.exists());
    }

    #[test]
    fn test_cursor_orderings_and_since() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();
        for key in [&b"c"[..], b"a", b"b"] {
            store
                .set(key, b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
                .unwrap();
        }
        t.commit().unwrap();

        // Key order ascending.
        let mut cursor = store
            .new_cursor(false, Sequence::NONE, &EnumerateOptions::default())
            .unwrap();
        let mut keys = Vec::new();
        while cursor.next() {
            keys.push(cursor.key().to_vec());
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        // Sequence order descending.
        let opts = EnumerateOptions {
            sort: SortOption::Descending,
            ..Default::default()
        };
        let mut cursor = store.new_cursor(true, Sequence::NONE, &opts).unwrap();
        let mut seqs = Vec::new();
        while cursor.next() {
            seqs.push(cursor.sequence().as_raw());
        }
        assert_eq!(seqs, vec![3, 2, 1]);

        // `since` is exclusive and applies to sequence enumerations.
        let mut cursor = store
            .new_cursor(true, Sequence::from_raw(1), &EnumerateOptions::default())
            .unwrap();
        let mut seqs = Vec::new();
        while cursor.next() {
            seqs.push(cursor.sequence().as_raw());
        }
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_erase_keeps_the_sequence_counter() {
        let (_dir, db) = temp_store();
        let store = db.key_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();
        store
            .set(b"a", b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        store.erase(&t).unwrap();
        t.commit().unwrap();

        assert_eq!(store.record_count(true).unwrap(), 0);
        assert_eq!(store.last_sequence().unwrap().as_raw(), 1);
    }
}
