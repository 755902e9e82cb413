//! # Value Codec & Row Recordings
//!
//! The binary formats that query results travel in:
//!
//! - A **value encoding**: a compact tagged format for column values,
//!   including nested arrays and dictionaries. Dictionary keys are short
//!   integer ids resolved against a [`SharedKeys`] dictionary, so repeated
//!   keys across thousands of documents cost four bytes instead of a string.
//! - A **row recording**: an immutable buffer of encoded result rows, each
//!   row being its column values followed by a bitmap of which of the first
//!   64 columns were SQL-NULL. Recordings are compared by their backing
//!   bytes, which works because the encoding is deterministic for a given
//!   row set and shared-keys table.
//!
//! ## Why Shared Keys?
//!
//! Document dictionaries repeat the same key strings endlessly:
//!
//! ```text
//! Without shared keys:             With shared keys:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ {"name":..,"type":..}    │     │ shared_keys: 0→"name"    │
//! │ {"name":..,"type":..}    │     │              1→"type"    │
//! │ {"name":..,"type":..}    │     │ {0:.., 1:..} × N docs    │
//! │ "name"/"type" × N docs   │     │ 4 bytes per key per doc  │
//! └──────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! The ids only mean something relative to a dictionary, which is why every
//! decode and re-encode names its scope explicitly (see [`rescope`]).
//!
//! ## Determinism
//!
//! Encoding the same values with the same dictionary always produces the
//! same bytes: fixed little-endian widths, no padding, dictionary entries in
//! insertion order. `refresh()` relies on this to detect "same results" by
//! comparing buffers.
//!
//! ## Rust Pattern: Separate Builder
//!
//! [`Recording`] is immutable once built; all mutation lives in
//! [`RecordingBuilder`]. Splitting the two means a `Recording` can be
//! shared (and byte-compared) without ever observing a half-written row.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Shared Keys
// =============================================================================

/// A dictionary mapping small integer ids to dictionary-key strings.
///
/// The database file persists one of these (`shared_keys` table) for document
/// bodies. Each query enumerator creates a *fresh* one for its result rows,
/// so results can introduce new keys without polluting the file's dictionary.
#[derive(Debug, Default, Clone)]
pub struct SharedKeys {
    keys: Vec<String>,
    by_name: HashMap<String, u32>,
}

impl SharedKeys {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted dictionary from a connection.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare("SELECT id, key FROM shared_keys ORDER BY id")?;
        let mut keys = Self::new();
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            Ok((id, key))
        })?;
        for row in rows {
            let (id, key) = row?;
            if id as usize != keys.keys.len() {
                return Err(Error::Corrupt(format!("shared key id {id} out of order")));
            }
            keys.intern(&key);
        }
        Ok(keys)
    }

    /// Persists entries at index `from` and beyond. The caller decides the
    /// transaction scope; new keys must commit with the documents that use
    /// them.
    pub fn persist_from(&self, conn: &Connection, from: usize) -> Result<()> {
        let mut stmt = conn.prepare("INSERT OR IGNORE INTO shared_keys (id, key) VALUES (?, ?)")?;
        for (i, key) in self.keys.iter().enumerate().skip(from) {
            stmt.execute(rusqlite::params![i as i64, key])?;
        }
        Ok(())
    }

    /// Returns the id for `key`, assigning the next id if it's new.
    pub fn intern(&mut self, key: &str) -> u32 {
        if let Some(&id) = self.by_name.get(key) {
            return id;
        }
        let id = self.keys.len() as u32;
        self.keys.push(key.to_string());
        self.by_name.insert(key.to_string(), id);
        id
    }

    /// Resolves an id back to its key string.
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.keys.get(id as usize).map(String::as_str)
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if no keys are interned.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// =============================================================================
// Values
// =============================================================================

/// A decoded column or document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
    /// Dictionary entries as (shared-key id, value), in encoding order.
    Dict(Vec<(u32, Value)>),
}

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_DICT: u8 = 6;

/// Appends the encoding of `value` to `out`.
pub fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(out, item);
            }
        }
        Value::Dict(entries) => {
            out.push(TAG_DICT);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key_id, item) in entries {
                out.extend_from_slice(&key_id.to_le_bytes());
                encode_value(out, item);
            }
        }
    }
}

/// Encodes a single value into a fresh buffer.
pub fn encode_value_to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(&mut out, value);
    out
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| Error::CorruptRevisionData("truncated value".into()))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let b = take(data, pos, 4)?;
    Ok(u32::from_le_bytes(b.try_into().unwrap()))
}

/// Decodes one value from `data` starting at `pos`, advancing `pos`.
pub fn decode_value(data: &[u8], pos: &mut usize) -> Result<Value> {
    let tag = take(data, pos, 1)?[0];
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_INT => {
            let b = take(data, pos, 8)?;
            Ok(Value::Int(i64::from_le_bytes(b.try_into().unwrap())))
        }
        TAG_FLOAT => {
            let b = take(data, pos, 8)?;
            Ok(Value::Float(f64::from_bits(u64::from_le_bytes(
                b.try_into().unwrap(),
            ))))
        }
        TAG_TEXT => {
            let len = take_u32(data, pos)? as usize;
            let b = take(data, pos, len)?;
            let s = std::str::from_utf8(b)
                .map_err(|_| Error::CorruptRevisionData("non-UTF-8 text value".into()))?;
            Ok(Value::Text(s.to_string()))
        }
        TAG_BLOB => {
            let len = take_u32(data, pos)? as usize;
            Ok(Value::Blob(take(data, pos, len)?.to_vec()))
        }
        TAG_ARRAY => {
            let count = take_u32(data, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value(data, pos)?);
            }
            Ok(Value::Array(items))
        }
        TAG_DICT => {
            let count = take_u32(data, pos)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key_id = take_u32(data, pos)?;
                entries.push((key_id, decode_value(data, pos)?));
            }
            Ok(Value::Dict(entries))
        }
        other => Err(Error::CorruptRevisionData(format!("unknown value tag {other}"))),
    }
}

/// Decodes a complete buffer as one value, rejecting trailing garbage.
pub fn decode_value_exact(data: &[u8]) -> Result<Value> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos)?;
    if pos != data.len() {
        return Err(Error::CorruptRevisionData("trailing bytes after value".into()));
    }
    Ok(value)
}

/// Rewrites a value from one shared-keys scope into another, re-interning
/// every dictionary key. Fails if `value` references an id unknown to `from`.
pub fn rescope(value: &Value, from: &SharedKeys, to: &mut SharedKeys) -> Result<Value> {
    match value {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(rescope(item, from, to)?);
            }
            Ok(Value::Array(out))
        }
        Value::Dict(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (key_id, item) in entries {
                let key = from.resolve(*key_id).ok_or_else(|| {
                    Error::CorruptRevisionData(format!("unknown shared key id {key_id}"))
                })?;
                let new_id = to.intern(key);
                out.push((new_id, rescope(item, from, to)?));
            }
            Ok(Value::Dict(out))
        }
        other => Ok(other.clone()),
    }
}

/// Converts a JSON value into a codec [`Value`], interning object keys into
/// `keys`. Integers that fit i64 stay integers; other numbers become floats;
/// booleans become 0/1 integers (the engine has no boolean column type).
pub fn value_from_json(json: &serde_json::Value, keys: &mut SharedKeys) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Int(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(|v| value_from_json(v, keys)).collect())
        }
        serde_json::Value::Object(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| (keys.intern(k), value_from_json(v, keys)))
                .collect(),
        ),
    }
}

// =============================================================================
// Row Recordings
// =============================================================================

/// An immutable buffer of encoded result rows.
///
/// Each row is `[u32 column-count][encoded columns...][u64 missing-bitmap]`.
/// Rows are addressed by absolute row index; the recording knows the index
/// of its first row within the whole result set.
#[derive(Debug, Clone)]
pub struct Recording {
    data: Arc<Vec<u8>>,
    row_offsets: Vec<usize>,
    first_row: u64,
}

impl Recording {
    /// Index of the first row held, within the whole result set.
    pub fn first_row(&self) -> u64 {
        self.first_row
    }

    /// Number of rows held.
    pub fn num_rows(&self) -> usize {
        self.row_offsets.len()
    }

    /// Byte-compares the backing buffers. Strong equality: the encoder is
    /// deterministic for a given row set and shared-keys table.
    pub fn has_equal_contents(&self, other: &Recording) -> bool {
        self.data == other.data || *self.data == *other.data
    }

    /// Decodes the row at relative index `i` into (columns, missing bitmap).
    pub fn decode_row(&self, i: usize) -> Result<(Vec<Value>, u64)> {
        let start = *self
            .row_offsets
            .get(i)
            .ok_or_else(|| Error::InvalidParameter(format!("row {i} out of range")))?;
        let data = &self.data[..];
        let mut pos = start;
        let ncols = take_u32(data, &mut pos)? as usize;
        let mut columns = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            columns.push(decode_value(data, &mut pos)?);
        }
        let b = take(data, &mut pos, 8)?;
        let missing = u64::from_le_bytes(b.try_into().unwrap());
        Ok((columns, missing))
    }
}

/// Builds a [`Recording`] row by row.
#[derive(Debug)]
pub struct RecordingBuilder {
    buf: Vec<u8>,
    row_offsets: Vec<usize>,
    first_row: u64,
}

impl RecordingBuilder {
    /// Starts a recording whose first row has absolute index `first_row`.
    pub fn new(first_row: u64) -> Self {
        Self {
            buf: Vec::new(),
            row_offsets: Vec::new(),
            first_row,
        }
    }

    /// Appends one row. `missing` is the SQL-NULL bitmap over the first 64
    /// columns; null columns are also encoded inline as [`Value::Null`].
    pub fn push_row(&mut self, columns: &[Value], missing: u64) {
        self.row_offsets.push(self.buf.len());
        self.buf.extend_from_slice(&(columns.len() as u32).to_le_bytes());
        for col in columns {
            encode_value(&mut self.buf, col);
        }
        self.buf.extend_from_slice(&missing.to_le_bytes());
    }

    /// Number of rows pushed so far.
    pub fn num_rows(&self) -> usize {
        self.row_offsets.len()
    }

    /// Finishes the recording. Returns `None` if no rows were pushed.
    pub fn finish(self) -> Option<Recording> {
        if self.row_offsets.is_empty() {
            return None;
        }
        Some(Recording {
            data: Arc::new(self.buf),
            row_offsets: self.row_offsets,
            first_row: self.first_row,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
