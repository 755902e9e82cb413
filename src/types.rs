//! # Domain Types
//!
//! This module defines the core types used throughout nookdb: sequences,
//! document flags, records, and the option structs that shape reads and
//! enumerations.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! We use the "newtype pattern" for the scalar types - wrapping primitives
//! in single-field structs. This provides:
//!
//! - **Type safety**: Can't accidentally pass an expiration timestamp where
//!   a [`Sequence`] is expected
//! - **Self-documenting code**: Function signatures tell you what they expect
//! - **Encapsulation**: Sentinel handling lives in one place instead of
//!   being re-derived at every call site
//!
//! ## Example
//!
//! ```rust
//! use nookdb::types::Sequence;
//!
//! fn example(seq: Sequence) {
//!     // A raw u64 won't compile here - the caller must be explicit:
//!     // example(42);                      // won't compile
//!     // example(Sequence::from_raw(42));  // fine
//!     assert!(!seq.is_none() || seq == Sequence::NONE);
//! }
//! ```
//!
//! ## Invariants
//!
//! These types encode invariants the storage layer depends on:
//!
//! - [`Sequence`]: Strictly increasing within a file, never reused; zero is
//!   reserved as a sentinel and is never assigned to a record
//! - [`DocumentFlags`]: Only the deleted bit is interpreted by the engine,
//!   and only by the split store; the rest travel opaquely
//! - [`Record`]: The key is immutable and non-empty once stored

use std::fmt;

// =============================================================================
// Sequences
// =============================================================================

/// A monotonically increasing write identifier, unique within a database file.
///
/// Every write to a key-store is stamped with the next sequence from the
/// file's shared allocator. Sequences never repeat and never go backward, so
/// "everything since sequence N" is a meaningful replication cursor.
///
/// # Why Zero Is Reserved
///
/// Zero is the sentinel: "no sequence yet" on a fresh record, "expect the
/// key to be absent" in a conditional write, and "conflict" in a write
/// result. Reserving it lets those three things be expressed without
/// `Option` plumbing at the storage boundary, which keeps the conditional
/// write API a single return value.
///
/// # Rust Pattern: Copy
///
/// We derive `Copy` because `Sequence` is small (8 bytes) and frequently
/// passed around. `Copy` means it's copied by value instead of moved,
/// which is more ergonomic for small types.
///
/// # Example
///
/// ```rust
/// use nookdb::types::Sequence;
///
/// let first = Sequence::from_raw(1);
/// assert!(first > Sequence::NONE);
/// assert_eq!(first.next().as_raw(), 2);
/// assert!(Sequence::NONE.is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence(u64);

impl Sequence {
    /// The sentinel sequence (0).
    pub const NONE: Sequence = Sequence(0);

    /// Creates a Sequence from a raw value.
    ///
    /// # When to Use
    ///
    /// Primarily for reading from the database or expressing a caller's
    /// expectation in a conditional write. The allocator hands out new
    /// sequences; callers never invent them.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for database storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence.
    ///
    /// # Overflow
    ///
    /// At u64::MAX writes you've stored 18 quintillion records. At a million
    /// writes per second that takes 584,000 years to overflow.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if this is the sentinel (no sequence / conflict).
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Document Flags
// =============================================================================

/// Per-record flag bits.
///
/// Only [`DocumentFlags::DELETED`] is interpreted by the engine, and only by
/// the split key-store, which uses it to route a record to the live or the
/// tombstone sub-store. The remaining bits travel with the record untouched;
/// they belong to the revision layer above.
///
/// # Why Not the bitflags Crate?
///
/// A hand-rolled newtype keeps the on-disk meaning explicit: the raw byte IS
/// the stored column value, and this type is the complete list of bits the
/// engine will ever see. Three constants don't earn a macro.
///
/// # Example
///
/// ```rust
/// use nookdb::types::DocumentFlags;
///
/// let flags = DocumentFlags::DELETED | DocumentFlags::CONFLICTED;
/// assert!(flags.is_deleted());
/// assert!(flags.contains(DocumentFlags::CONFLICTED));
/// assert_eq!(flags.as_raw(), 0x03);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DocumentFlags(u8);

impl DocumentFlags {
    /// No flags set.
    pub const NONE: DocumentFlags = DocumentFlags(0);
    /// The record is a tombstone.
    pub const DELETED: DocumentFlags = DocumentFlags(0x01);
    /// The record has unresolved sibling revisions. Carried, not interpreted.
    pub const CONFLICTED: DocumentFlags = DocumentFlags(0x02);
    /// The record body references external attachments. Carried, not interpreted.
    pub const HAS_ATTACHMENTS: DocumentFlags = DocumentFlags(0x04);

    /// Creates flags from a raw byte.
    pub fn from_raw(value: u8) -> Self {
        Self(value)
    }

    /// Returns the raw byte for database storage.
    pub fn as_raw(&self) -> u8 {
        self.0
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub fn contains(&self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the deleted bit is set.
    pub fn is_deleted(&self) -> bool {
        self.contains(Self::DELETED)
    }
}

impl std::ops::BitOr for DocumentFlags {
    type Output = DocumentFlags;

    fn bitor(self, rhs: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 | rhs.0)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A stored document: opaque payload plus metadata.
///
/// # Fields
///
/// The key is immutable and non-empty; the version is opaque to the engine
/// (the revision layer above owns its format); the body is arbitrary bytes.
/// `expiration` is a Unix-milliseconds timestamp, with 0 meaning "never".
///
/// # Why Opaque Bytes?
///
/// nookdb is payload-agnostic - the body is just bytes, and the version is
/// just bytes. The engine indexes by key and sequence; what's *inside* a
/// document only matters to the value codec when a query asks for it. Not
/// parsing what we don't need keeps every write on the fast path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Primary key. Immutable, non-empty.
    pub key: Vec<u8>,
    /// Opaque version identifier.
    pub version: Vec<u8>,
    /// Document payload.
    pub body: Vec<u8>,
    /// Flag bits; see [`DocumentFlags`].
    pub flags: DocumentFlags,
    /// Sequence assigned at write time; [`Sequence::NONE`] if unsaved.
    pub sequence: Sequence,
    /// Expiration timestamp in Unix milliseconds; 0 = none.
    pub expiration: u64,
}

impl Record {
    /// Creates an empty record with the given key.
    ///
    /// # Rust Pattern: Struct Update Syntax
    ///
    /// `..Self::default()` fills the remaining fields from `Default`, so
    /// adding a field later doesn't break this constructor.
    pub fn with_key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Returns true if this record has been read from or written to a store.
    ///
    /// A record that "exists" carries a real sequence; a freshly constructed
    /// one still has [`Sequence::NONE`].
    pub fn exists(&self) -> bool {
        !self.sequence.is_none()
    }
}

// =============================================================================
// Read & Enumeration Options
// =============================================================================

/// How much of a record a read should load.
///
/// # Why Meta-Only?
///
/// Existence and conflict checks only need the sequence and flags; skipping
/// the body keeps large documents out of memory on the hot conditional-write
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOption {
    /// Key, sequence, flags, version, expiration; body left empty.
    MetaOnly,
    /// Everything including the body.
    All,
}

/// Sort order for an enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOption {
    /// Engine order; cheapest when the caller doesn't care.
    Unsorted,
    /// Ascending by key or sequence.
    Ascending,
    /// Descending by key or sequence.
    Descending,
}

/// Options shaping a record enumeration.
///
/// # Example
///
/// ```rust
/// use nookdb::types::{EnumerateOptions, SortOption};
///
/// // Tombstones included, newest first:
/// let opts = EnumerateOptions {
///     sort: SortOption::Descending,
///     include_deleted: true,
///     ..Default::default()
/// };
/// assert!(opts.include_deleted);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EnumerateOptions {
    /// Sort order. A merged live/dead enumeration upgrades `Unsorted` to
    /// `Ascending` because merging requires an order.
    pub sort: SortOption,
    /// Whether tombstones are included.
    pub include_deleted: bool,
    /// How much of each record to load.
    pub content: ContentOption,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        Self {
            sort: SortOption::Ascending,
            include_deleted: false,
            content: ContentOption::All,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
