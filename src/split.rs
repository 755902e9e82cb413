//! # Split Live/Dead Key-Store
//!
//! A logical key-store federating two physical ones: `live` holds current
//! documents, `dead` holds tombstones. The two share one sequence allocator,
//! so "everything since sequence N" spans both sides.
//!
//! ## Why Two Stores?
//!
//! Replication needs tombstones - a peer that missed a deletion must learn
//! about it from the change feed - but ordinary reads and queries never want
//! them. Keeping tombstones in a separate table makes the common case (live
//! data only) a plain scan of a table that contains nothing else, while
//! `include_deleted` enumerations pay for the merge only when asked:
//!
//! ```text
//!              SplitKeyStore("docs")
//!             ┌────────────┴────────────┐
//!             ▼                         ▼
//!        kv_docs (live)          kv_del_docs (dead)
//!        current documents       tombstones
//!             └────── one sequence space ──────┘
//! ```
//!
//! ## Rust Pattern: Composition over Inheritance
//!
//! Where a class hierarchy might subclass a key-store, this type *holds* two
//! [`KeyStore`] values and forwards or combines their operations. The
//! forwarding methods are boring on purpose; everything interesting is in
//! `set` and the merged cursor.
//!
//! ## The One-Store Invariant
//!
//! A key exists in at most one of the two sub-stores between transactions.
//! A write whose deleted flag differs from the record's current side moves
//! the record across, atomically within the enclosing transaction. All the
//! interesting code below exists to restore or exploit that invariant:
//! overwrites scrub the other side, conditional inserts treat existence in
//! either side as a conflict, and conditional updates chase a record that
//! crossed sides since the caller's snapshot.

use std::rc::Rc;

use crate::error::Result;
use crate::keystore::{KeyStore, RecordCursor, RecordEnumerator};
use crate::transaction::Transaction;
use crate::types::{ContentOption, DocumentFlags, EnumerateOptions, Record, Sequence, SortOption};

// =============================================================================
// Split Key-Store
// =============================================================================

/// Two physical key-stores presented as one.
pub struct SplitKeyStore {
    live: Rc<KeyStore>,
    dead: Rc<KeyStore>,
}

impl SplitKeyStore {
    /// Federates a live store and its tombstone twin. Installs the live
    /// store's sequence allocator into the dead store; that contract holds
    /// for the lifetime of the pair.
    pub(crate) fn new(live: Rc<KeyStore>, dead: Rc<KeyStore>) -> Self {
        dead.share_sequences_with(&live);
        Self { live, dead }
    }

    /// The logical store name (the live side's name).
    pub fn name(&self) -> &str {
        self.live.name()
    }

    /// The live sub-store.
    pub fn live(&self) -> &Rc<KeyStore> {
        &self.live
    }

    /// The tombstone sub-store.
    pub fn dead(&self) -> &Rc<KeyStore> {
        &self.dead
    }

    /// Last sequence in the shared sequence space.
    pub fn last_sequence(&self) -> Result<Sequence> {
        self.live.last_sequence()
    }

    /// Live count, plus tombstones iff `include_deleted`.
    pub fn record_count(&self, include_deleted: bool) -> Result<u64> {
        // Counting with the deleted filter off is cheaper, and the live side
        // holds no tombstones anyway.
        let mut count = self.live.record_count(true)?;
        if include_deleted {
            count += self.dead.record_count(true)?;
        }
        Ok(count)
    }

    /// Looks up a key on either side, live first.
    pub fn get(&self, key: &[u8], content: ContentOption) -> Result<Option<Record>> {
        match self.live.get(key, content)? {
            Some(rec) => Ok(Some(rec)),
            None => self.dead.get(key, content),
        }
    }

    /// Writes a record, routing it by its deleted flag and maintaining the
    /// one-store invariant. Returns [`Sequence::NONE`] on an MVCC conflict.
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
        let deleting = flags.is_deleted();
        let (target, other) = if deleting {
            (&self.dead, &self.live)
        } else {
            (&self.live, &self.dead)
        };

        match replacing {
            None => {
                // Overwrite: set in the target, then scrub the other side so
                // the key can't exist in both.
                let seq = target.set(key, version, body, flags, t, None, true)?;
                if !seq.is_none() {
                    other.del(key, t, None)?;
                }
                Ok(seq)
            }
            Some(expected) if expected.is_none() => {
                // Insert-only: a record on the other side blocks the insert
                // just as surely as one in the target.
                if other.get(key, ContentOption::MetaOnly)?.is_some() {
                    return Ok(Sequence::NONE);
                }
                target.set(key, version, body, flags, t, Some(Sequence::NONE), new_sequence)
            }
            Some(expected) => {
                let seq = target.set(key, version, body, flags, t, Some(expected), new_sequence)?;
                if seq.is_none() && new_sequence {
                    // The record may have crossed sides since the caller's
                    // snapshot. A CAS delete on the other side proves it was
                    // there at the expected sequence; then finish the move.
                    if other.del(key, t, Some(expected))? {
                        return target.set(key, version, body, flags, t, None, true);
                    }
                }
                Ok(seq)
            }
        }
    }

    /// Deletes a key from whichever side holds it. With `expected`, a CAS
    /// delete tried against the live side, then the dead side.
    pub fn del(&self, key: &[u8], t: &Transaction, expected: Option<Sequence>) -> Result<bool> {
        if self.live.del(key, t, expected)? {
            return Ok(true);
        }
        self.dead.del(key, t, expected)
    }

    /// Looks up several bodies at once, live side first, rechecking only the
    /// misses against the dead side. Input order is preserved.
    pub fn with_doc_bodies<F>(&self, keys: &[&[u8]], callback: &mut F) -> Result<Vec<Option<Vec<u8>>>>
    where
        F: FnMut(&Record) -> Option<Vec<u8>>,
    {
        let mut result = self.live.with_doc_bodies(keys, callback)?;

        let mut recheck_keys: Vec<&[u8]> = Vec::new();
        let mut recheck_indexes: Vec<usize> = Vec::new();
        for (i, body) in result.iter().enumerate() {
            if body.is_none() {
                recheck_keys.push(keys[i]);
                recheck_indexes.push(i);
            }
        }

        if !recheck_keys.is_empty() {
            let dead = self.dead.with_doc_bodies(&recheck_keys, callback)?;
            for (slot, body) in recheck_indexes.into_iter().zip(dead) {
                if body.is_some() {
                    result[slot] = body;
                }
            }
        }
        Ok(result)
    }

    /// Earliest positive expiration across both sides; 0 if neither has one.
    pub fn next_expiration(&self) -> Result<u64> {
        let lx = self.live.next_expiration()?;
        let dx = self.dead.next_expiration()?;
        if lx > 0 && dx > 0 {
            Ok(lx.min(dx))
        } else {
            Ok(lx.max(dx))
        }
    }

    /// Enables expiration tracking on both sides.
    pub fn add_expiration(&self) -> Result<()> {
        self.live.add_expiration()?;
        self.dead.add_expiration()
    }

    /// Sets a record's expiration on whichever side holds it.
    pub fn set_expiration(&self, key: &[u8], when: u64, t: &Transaction) -> Result<bool> {
        if self.live.set_expiration(key, when, t)? {
            return Ok(true);
        }
        self.dead.set_expiration(key, when, t)
    }

    /// Creates an enumerator over the federation.
    ///
    /// Including tombstones requires merging both sides, and merging requires
    /// an order, so `Unsorted` is upgraded to `Ascending`. Excluding them
    /// short-circuits to the live side's own cursor - with its deleted
    /// filter disabled, since the live side has nothing to filter.
    pub fn new_enumerator(
        &self,
        by_sequence: bool,
        since: Sequence,
        options: &EnumerateOptions,
    ) -> Result<RecordEnumerator> {
        let imp: Box<dyn RecordCursor> = if options.include_deleted {
            let mut opts = *options;
            if opts.sort == SortOption::Unsorted {
                opts.sort = SortOption::Ascending;
            }
            Box::new(MergedCursor::new(
                self.live.new_cursor(by_sequence, since, &opts)?,
                self.dead.new_cursor(by_sequence, since, &opts)?,
                by_sequence,
                opts.sort == SortOption::Descending,
            ))
        } else {
            let mut opts = *options;
            opts.include_deleted = true;
            self.live.new_cursor(by_sequence, since, &opts)?
        };
        Ok(RecordEnumerator::new(imp))
    }
}

// =============================================================================
// Merged Cursor
// =============================================================================

fn compare<T: Ord>(a: T, b: T) -> i8 {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Merge-sorts two child cursors, always presenting the lowest-sorting
/// record next (highest, when descending).
pub(crate) struct MergedCursor {
    live: Option<Box<dyn RecordCursor>>,
    dead: Option<Box<dyn RecordCursor>>,
    on_live: bool,
    cmp: i8,
    by_sequence: bool,
    descending: bool,
}

impl MergedCursor {
    pub(crate) fn new(
        live: Box<dyn RecordCursor>,
        dead: Box<dyn RecordCursor>,
        by_sequence: bool,
        descending: bool,
    ) -> Self {
        Self {
            live: Some(live),
            dead: Some(dead),
            on_live: false,
            cmp: 0,
            by_sequence,
            descending,
        }
    }

    fn current(&self) -> Option<&dyn RecordCursor> {
        let side = if self.on_live { &self.live } else { &self.dead };
        side.as_deref()
    }
}

impl RecordCursor for MergedCursor {
    fn next(&mut self) -> bool {
        // Advance the side(s) that produced the current record; on the first
        // call cmp is 0, so both children step onto their first rows.
        if self.cmp <= 0 {
            if let Some(cursor) = &mut self.live {
                if !cursor.next() {
                    self.live = None;
                }
            }
        }
        if self.cmp >= 0 {
            if let Some(cursor) = &mut self.dead {
                if !cursor.next() {
                    self.dead = None;
                }
            }
        }

        // Compare what the children now offer. Only a genuine comparison is
        // direction-sensitive; an exhausted side always loses, descending or
        // not, so the sentinel is applied after the negation.
        self.cmp = match (&self.live, &self.dead) {
            (Some(live), Some(dead)) => {
                let cmp = if self.by_sequence {
                    compare(live.sequence(), dead.sequence())
                } else {
                    compare(live.key(), dead.key())
                };
                if self.descending {
                    -cmp
                } else {
                    cmp
                }
            }
            (Some(_), None) => -1,
            (None, Some(_)) => 1,
            (None, None) => {
                self.cmp = 0;
                return false;
            }
        };

        // Lowest sorts first; on a tie the live side wins.
        self.on_live = self.cmp <= 0;
        true
    }

    fn key(&self) -> &[u8] {
        self.current().map(|c| c.key()).unwrap_or(&[])
    }

    fn sequence(&self) -> Sequence {
        self.current().map(|c| c.sequence()).unwrap_or(Sequence::NONE)
    }

    fn read(&self) -> Record {
        self.current().map(|c| c.read()).unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
