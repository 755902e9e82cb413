//! # Transactions & Write Serialization
//!
//! Writes are serialized **per file**, not per database handle. Every
//! database path maps to one process-wide `File`: a flyweight carrying the
//! writer slot (mutex + condvar) and the pre-transaction observer list. Two
//! `Database` instances opened on the same path - from any threads - share
//! the same `File` and therefore take turns writing.
//!
//! A [`Transaction`] is a scope: creating one notifies observers, waits for
//! the writer slot, and (unless it's a no-op) opens an engine transaction.
//! Dropping it applies whatever state it ended up in. Any guarded store
//! operation that fails flips the state from `Commit` to `Abort`, so an
//! error unwinding through the scope rolls everything back.
//!
//! ## Rust Pattern: Scope Guards (RAII)
//!
//! The critical section is tied to a value's lifetime, not to paired
//! begin/end calls:
//!
//! ```rust,ignore
//! let t = Transaction::new(&db)?;     // waits for the slot, BEGINs
//! store.set(b"key", b"1-aa", body, flags, &t, None, true)?;
//! t.commit()?;                        // applies the state, frees the slot
//! // ...or just drop `t`: the destructor applies whatever state remains.
//! ```
//!
//! Whatever path the scope exits by - explicit commit, early `?` return, or
//! a panic unwinding through it - the slot is released exactly once. That's
//! the whole reason the end-of-scope logic lives in `Drop` rather than in a
//! method callers could forget.
//!
//! ## Commit Errors
//!
//! A failed commit must not wedge other writers, so the slot is released
//! *before* the commit error surfaces to the caller. Prefer the explicit
//! [`Transaction::commit`] over dropping a committing transaction: `Drop`
//! can only log a commit failure, not return it.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use tracing::warn;

use crate::database::Database;
use crate::error::{Error, Result};

// =============================================================================
// Pre-Transaction Observers
// =============================================================================

/// Callback invoked synchronously before any writer on the same file takes
/// the transaction slot.
///
/// One-shot query enumerators use this to materialize their remaining rows
/// before the file changes underneath them. Observers must complete before
/// the writer proceeds; there is no cancellation.
pub trait PreTransactionObserver: Send + Sync {
    /// A writer is about to begin a transaction on this file.
    fn pre_transaction(&self);
}

struct ObserverList {
    entries: Vec<(u64, Weak<dyn PreTransactionObserver>)>,
    next_id: u64,
    /// Threads currently walking the observer list. Registration from one of
    /// these threads is re-entrant (an observer registering during its own
    /// notification) and is rejected.
    notifying: Vec<std::thread::ThreadId>,
}

// =============================================================================
// File
// =============================================================================

/// Process-wide per-path state: the writer slot and the observer list.
///
/// Created on first open of a path, kept for the life of the process.
pub(crate) struct File {
    busy: Mutex<bool>,
    cond: Condvar,
    observers: Mutex<ObserverList>,
}

static FILES: OnceLock<Mutex<HashMap<PathBuf, Arc<File>>>> = OnceLock::new();

fn normalize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    }
}

impl File {
    /// Returns the shared `File` for a path, creating it on first use.
    pub(crate) fn for_path(path: &Path) -> Arc<File> {
        let files = FILES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = files.lock().expect("file map mutex poisoned");
        Arc::clone(map.entry(normalize(path)).or_insert_with(|| {
            Arc::new(File {
                busy: Mutex::new(false),
                cond: Condvar::new(),
                observers: Mutex::new(ObserverList {
                    entries: Vec::new(),
                    next_id: 0,
                    notifying: Vec::new(),
                }),
            })
        }))
    }

    /// Blocks until the writer slot is free, then takes it.
    pub(crate) fn acquire(&self) {
        let mut busy = self.busy.lock().expect("transaction mutex poisoned");
        while *busy {
            busy = self.cond.wait(busy).expect("transaction mutex poisoned");
        }
        *busy = true;
    }

    /// Releases the writer slot and wakes one waiter.
    pub(crate) fn release(&self) {
        let mut busy = self.busy.lock().expect("transaction mutex poisoned");
        *busy = false;
        self.cond.notify_one();
    }

    /// Registers an observer; returns a token for removal. Fails if called
    /// from within a notification.
    pub(crate) fn add_observer(&self, observer: Weak<dyn PreTransactionObserver>) -> Result<u64> {
        let mut list = self.observers.lock().expect("observer mutex poisoned");
        if list.notifying.contains(&std::thread::current().id()) {
            return Err(Error::UnsupportedOperation(
                "cannot register an observer during pre-transaction notification",
            ));
        }
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, observer));
        Ok(id)
    }

    /// Removes an observer. Safe to call from inside a notification; removal
    /// takes effect immediately.
    pub(crate) fn remove_observer(&self, id: u64) {
        let mut list = self.observers.lock().expect("observer mutex poisoned");
        list.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Invokes every live observer. Dead weak references are pruned.
    pub(crate) fn notify_pre_transaction(&self) {
        let me = std::thread::current().id();
        let snapshot: Vec<(u64, Weak<dyn PreTransactionObserver>)> = {
            let mut list = self.observers.lock().expect("observer mutex poisoned");
            list.notifying.push(me);
            list.entries.retain(|(_, weak)| weak.strong_count() > 0);
            list.entries.clone()
        };
        for (id, weak) in snapshot {
            // An observer removed mid-notification must not be called.
            let still_registered = {
                let list = self.observers.lock().expect("observer mutex poisoned");
                list.entries.iter().any(|(entry_id, _)| *entry_id == id)
            };
            if !still_registered {
                continue;
            }
            if let Some(observer) = weak.upgrade() {
                observer.pre_transaction();
            }
        }
        let mut list = self.observers.lock().expect("observer mutex poisoned");
        if let Some(i) = list.notifying.iter().position(|t| *t == me) {
            list.notifying.swap_remove(i);
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// What a transaction will do when its scope ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Commit the engine transaction.
    Commit,
    /// Roll the engine transaction back.
    Abort,
    /// The slot was held only to exclude writers; nothing to apply.
    NoOp,
}

/// A per-writer critical-section scope on a database file.
///
/// At most one non-`NoOp` transaction exists per file at a time; other
/// writers wait on the file's condition variable. The scope always releases
/// the slot, whatever the exit path.
pub struct Transaction<'db> {
    db: &'db Database,
    state: Cell<TransactionState>,
    ended: bool,
}

impl<'db> Transaction<'db> {
    /// Begins a committing transaction, waiting for the writer slot.
    pub fn new(db: &'db Database) -> Result<Self> {
        Self::begin(db, TransactionState::Commit)
    }

    /// Takes the writer slot without opening an engine transaction. Used to
    /// exclude writers around file-level maintenance.
    pub fn no_op(db: &'db Database) -> Result<Self> {
        Self::begin(db, TransactionState::NoOp)
    }

    fn begin(db: &'db Database, state: TransactionState) -> Result<Self> {
        let file = db.file();
        file.notify_pre_transaction();
        file.acquire();
        if state == TransactionState::Commit {
            if let Err(e) = db.writer_conn().execute_batch("BEGIN IMMEDIATE") {
                file.release();
                return Err(e.into());
            }
        }
        Ok(Self {
            db,
            state: Cell::new(state),
            ended: false,
        })
    }

    /// The transaction's current state.
    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    /// Marks the transaction to roll back when the scope ends.
    pub fn abort(&self) {
        if self.state.get() == TransactionState::Commit {
            self.state.set(TransactionState::Abort);
        }
    }

    /// Routes a store operation's result through the transaction: any error
    /// flips a committing transaction to abort before re-surfacing.
    pub fn check<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Ends the scope, applying the current state. A commit error is
    /// returned only after the writer slot has been released.
    pub fn commit(mut self) -> Result<()> {
        self.end()
    }

    fn end(&mut self) -> Result<()> {
        self.ended = true;
        let result = match self.state.get() {
            TransactionState::Commit => {
                let committed = self.db.writer_conn().execute_batch("COMMIT");
                if committed.is_err() {
                    // Leave the connection out of transaction state; there is
                    // nothing useful to do with a rollback failure here.
                    let _ = self.db.writer_conn().execute_batch("ROLLBACK");
                    self.db.reload_document_keys();
                }
                committed.map_err(Error::from)
            }
            TransactionState::Abort => {
                if let Err(e) = self.db.writer_conn().execute_batch("ROLLBACK") {
                    warn!("rollback failed: {e}");
                }
                self.db.reload_document_keys();
                Ok(())
            }
            TransactionState::NoOp => Ok(()),
        };
        self.db.file().release();
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(e) = self.end() {
                warn!("commit failed while dropping transaction: {e}");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
