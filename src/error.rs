//! # Error Handling
//!
//! This module defines the error types used throughout nookdb. We use a
//! single error enum ([`Error`]) to represent all failure modes, which
//! simplifies error handling for library users.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Why a Single Error Type?
//!
//! Libraries commonly choose between:
//! 1. **Single enum** (our choice): Easy to match on, simple function signatures
//! 2. **Separate error types per module**: More precise, but verbose
//!
//! For nookdb, a single enum works well because:
//! - Most operations can fail in similar ways (SQLite errors, bad input)
//! - Callers typically want to handle errors uniformly (surface to the app,
//!   or match one or two recoverable variants)
//! - It keeps the API surface simple
//!
//! ## Error Categories
//!
//! Errors fall into these categories:
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Precondition | Bad store name, seek past end | Fix the call site |
//! | Compile-time | Missing FTS index, bad selector | Retry with different input |
//! | Conflict | Checkpoint revision mismatch | Re-read and retry |
//! | Corruption | Undecodable stored value | Surface; no auto-repair |
//! | Engine | SQLite error, I/O error | Log and investigate |
//!
//! ## What Is Deliberately NOT an Error
//!
//! Two failure classes stay out of this enum:
//!
//! - A CAS conflict on a conditional write returns the sentinel sequence 0.
//!   Conflicts are an expected outcome of optimistic concurrency, and the
//!   caller decides whether that means "retry" or "give up".
//! - A raw-document lookup that finds nothing returns `None`. Absence is an
//!   answer, not a failure.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors surfaced by nookdb operations.
///
/// # Rust Pattern: Enum Variants
///
/// Each variant represents a distinct failure mode. The `#[error(...)]`
/// attribute defines the `Display` message shown when the error is printed.
///
/// # Example
///
/// ```rust,ignore
/// use nookdb::{Error, Result};
///
/// fn example() -> Result<()> {
///     // Errors can be created directly
///     let err = Error::NoSuchIndex("by_text".to_string());
///
///     // Or propagated with ?
///     some_operation()?;
///
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A query referenced a full-text index that does not exist.
    ///
    /// # When This Happens
    ///
    /// Compiling a selector with a `match` test requires the backing
    /// full-text table to already exist in the file. Creating indexes is a
    /// separate, earlier step; compilation never creates them implicitly.
    ///
    /// # Recovery
    ///
    /// Create the index, then compile the query again.
    #[error("no such index: {0}")]
    NoSuchIndex(String),

    /// A caller-supplied argument was rejected (bad store name, seek past the
    /// end of a result set, malformed parameter dictionary, ...).
    ///
    /// # Recovery
    ///
    /// This is a bug at the call site, not a runtime condition. Nothing was
    /// changed; fix the argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A parameter binding named a property the compiled query doesn't have.
    ///
    /// # When This Happens
    ///
    /// Every key in a parameter dictionary must match a `$_name` placeholder
    /// in the compiled SQL. A typo'd key would otherwise be silently ignored
    /// and the query would run with the parameter unbound - surfacing the
    /// name loudly is kinder.
    #[error("unknown query parameter '{0}'")]
    InvalidQueryParam(String),

    /// The operation is not available in the enumerator's current mode,
    /// e.g. seeking backward or refreshing a one-shot enumerator.
    ///
    /// # Recovery
    ///
    /// Use a buffered enumerator if you need random access or refresh.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A stored value failed to decode. No automatic repair is attempted.
    ///
    /// # When This Happens
    ///
    /// - A document body blob isn't valid encoded-value data
    /// - A dictionary key id isn't in the file's shared-keys table
    /// - Checkpoint revision metadata doesn't parse as `<decimal>-cc`
    ///
    /// # Recovery
    ///
    /// May require restoring from a replica or backup. Decoding never
    /// guesses at partially valid data.
    #[error("corrupt revision data: {0}")]
    CorruptRevisionData(String),

    /// A peer checkpoint write carried a revision that doesn't match the
    /// stored one. The HTTP 409 equivalent at this layer.
    ///
    /// # Systems Concept: Optimistic Concurrency Control
    ///
    /// Peers don't lock checkpoints while reading them; instead each write
    /// presents the revision it last saw, and a mismatch means someone else
    /// wrote in between.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the checkpoint to get the current revision
    /// 2. Merge or discard the stale update
    /// 3. Retry the write with the fresh revision
    #[error("checkpoint revision conflict")]
    CheckpointConflict,

    /// The database file's own bookkeeping (schema version, file-state row)
    /// is missing or inconsistent.
    ///
    /// # When This Happens
    ///
    /// - Opening a file created by a newer schema version
    /// - The file was modified outside nookdb
    ///
    /// # Recovery
    ///
    /// May require manual intervention or restore from backup.
    #[error("corrupt database: {0}")]
    Corrupt(String),

    /// Any error from the underlying SQLite engine, passed through.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute automatically generates:
    /// ```rust,ignore
    /// impl From<rusqlite::Error> for Error {
    ///     fn from(err: rusqlite::Error) -> Self {
    ///         Error::Sqlite(err)
    ///     }
    /// }
    /// ```
    ///
    /// This enables the `?` operator to convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem errors while destroying or moving database files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
///
/// # Rust Pattern: Type Aliases
///
/// Defining `type Result<T> = std::result::Result<T, Error>` means:
/// - Functions return `Result<Foo>` instead of `Result<Foo, Error>`
/// - Less typing, clearer intent
/// - Standard pattern used by most Rust libraries
///
/// # Example
///
/// ```rust,ignore
/// use nookdb::Result;
///
/// fn do_something() -> Result<String> {
///     // On success:
///     Ok("done".to_string())
///
///     // On failure (Corrupt variant):
///     // Err(nookdb::Error::Corrupt("bad file state".to_string()))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
