//! # Query Enumerator
//!
//! Executes a compiled [`Query`](crate::query::Query) against a snapshot and
//! serves rows in two modes:
//!
//! - **Buffered** (default): all rows are materialized up front into a
//!   [`Recording`], after which the enumerator supports seeking anywhere,
//!   row counting, and [`refresh`](QueryEnumerator::refresh).
//! - **One-shot**: rows stream from the live statement in pages of 50, with
//!   no backward seeking and no refresh. To survive the file changing
//!   mid-stream, a one-shot enumerator registers a pre-transaction observer;
//!   the moment a writer begins, the remaining rows are materialized and the
//!   statement is released.
//!
//! ## Why Two Modes?
//!
//! Buffered pays its whole cost up front - every row encoded before the
//! first is served - and buys random access and cheap refresh in exchange.
//! One-shot starts streaming immediately and touches only the rows the
//! caller actually reads, which is what a UI wants for "show the first
//! screen of results now". The pre-transaction hook is the price of the
//! one-shot mode: a live statement can't be left straddling someone else's
//! write, so the first writer to show up forces the stragglers into memory.
//!
//! The mode machinery is an explicit state machine:
//!
//! ```text
//! Fresh ──(one-shot)──► Streaming ──(pre-transaction)──► Materializing ─┐
//!   │                       │                                           ▼
//!   └──(buffered, via Materializing)──────────────────────────────► Buffered
//!                           │                                           │
//!                           └──────────────► Exhausted ◄────────────────┘
//! ```
//!
//! ## Snapshot Stability
//!
//! Each enumerator owns a private read-only connection holding an open read
//! transaction, so its pages all come from one snapshot regardless of what
//! the writer commits meanwhile. Pages re-prepare the statement with a
//! LIMIT/OFFSET window against that pinned snapshot; a long-lived statement
//! handle would borrow the connection for the enumerator's whole lifetime,
//! which safe Rust has no way to express.

use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::codec::{self, Recording, RecordingBuilder, SharedKeys, Value};
use crate::error::{Error, Result};
use crate::query::{FullTextTerm, Query, TokenizerQueryScope};
use crate::transaction::PreTransactionObserver;
use crate::types::Sequence;

/// Rows recorded per page in one-shot streaming.
const PAGE_SIZE: i64 = 50;

/// Implicit prefix columns of a full-text query result.
const FTS_ROWID_COL: usize = 0;
const FTS_OFFSETS_COL: usize = 1;

// =============================================================================
// Options
// =============================================================================

/// Options for creating a query enumerator.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Stream rows from the live statement instead of materializing.
    pub one_shot: bool,
    /// Parameter bindings: a JSON object, or a binary-encoded dictionary
    /// whose keys resolve against the file's document dictionary.
    pub params: Option<Vec<u8>>,
}

/// Where the enumerator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumState {
    /// Created, no row served yet.
    Fresh,
    /// One-shot, reading from the live statement.
    Streaming,
    /// Mid-materialization (observable only from the observer callback).
    Materializing,
    /// All remaining rows live in recordings; the statement is released.
    Buffered,
    /// Every row has been consumed.
    Exhausted,
}

// =============================================================================
// Parameter Binding
// =============================================================================

/// A value ready to bind to a statement parameter.
#[derive(Debug, Clone)]
enum Bound {
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

fn bound_from_json(value: &serde_json::Value) -> Option<Bound> {
    match value {
        serde_json::Value::Null => None,
        // Booleans and non-integer numbers bind as doubles.
        serde_json::Value::Bool(b) => Some(Bound::Float(if *b { 1.0 } else { 0.0 })),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Bound::Int(i)),
            None => Some(Bound::Float(n.as_f64().unwrap_or(f64::NAN))),
        },
        serde_json::Value::String(s) => Some(Bound::Text(s.clone())),
        other => {
            // Structured parameters travel as encoded blobs.
            let mut scratch = SharedKeys::new();
            let v = codec::value_from_json(other, &mut scratch);
            Some(Bound::Blob(codec::encode_value_to_vec(&v)))
        }
    }
}

fn bound_from_value(value: &Value) -> Option<Bound> {
    match value {
        Value::Null => None,
        Value::Int(n) => Some(Bound::Int(*n)),
        Value::Float(f) => Some(Bound::Float(*f)),
        Value::Text(s) => Some(Bound::Text(s.clone())),
        Value::Blob(b) => Some(Bound::Blob(b.clone())),
        other => Some(Bound::Blob(codec::encode_value_to_vec(other))),
    }
}

/// Parses `params` into named bindings, checking every name against the
/// compiled statement. Returns the bindings and the required parameters
/// still unbound.
fn build_bindings(
    query: &Query,
    conn: &Connection,
    params: Option<&[u8]>,
    doc_keys: &SharedKeys,
) -> Result<(Vec<(String, Bound)>, BTreeSet<String>)> {
    let mut unbound = query.required_params().clone();
    let mut bindings = Vec::new();

    let Some(raw) = params else {
        return Ok((bindings, unbound));
    };

    let mut entries: Vec<(String, Option<Bound>)> = Vec::new();
    let first = raw.iter().find(|b| !b.is_ascii_whitespace());
    let last = raw.iter().rev().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') && last == Some(&b'}') {
        let parsed: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| Error::InvalidParameter(format!("invalid parameter JSON: {e}")))?;
        let obj = parsed
            .as_object()
            .ok_or_else(|| Error::InvalidParameter("parameter bindings must be an object".into()))?;
        for (key, value) in obj {
            entries.push((key.clone(), bound_from_json(value)));
        }
    } else {
        let value = codec::decode_value_exact(raw)?;
        let Value::Dict(dict) = value else {
            return Err(Error::InvalidParameter(
                "parameter bindings must be a dictionary".into(),
            ));
        };
        for (key_id, value) in &dict {
            let key = doc_keys.resolve(*key_id).ok_or_else(|| {
                Error::InvalidParameter(format!("unknown shared key id {key_id} in parameters"))
            })?;
            entries.push((key.to_string(), bound_from_value(value)));
        }
    }

    // Validate names against the statement before any page runs: binding a
    // name the SQL doesn't have is the caller's bug.
    let stmt = conn.prepare(query.sql())?;
    for (key, bound) in entries {
        unbound.remove(&key);
        if stmt.parameter_index(&format!("$_{key}"))?.is_none() {
            return Err(Error::InvalidQueryParam(key));
        }
        if let Some(bound) = bound {
            bindings.push((key, bound));
        }
    }
    Ok((bindings, unbound))
}

// =============================================================================
// Live Rows
// =============================================================================

/// The "live statement": a private read-only connection pinned to one
/// snapshot, stepped in LIMIT/OFFSET pages and encoded into recordings.
struct LiveRows {
    conn: Connection,
    sql: String,
    bindings: Vec<(String, Bound)>,
    total_columns: usize,
    first_custom: usize,
    doc_keys: SharedKeys,
    result_keys: SharedKeys,
    row_count: u64,
    open: bool,
}

impl LiveRows {
    /// Records up to `max_rows` rows starting at the current position.
    /// Returns `None` once exhausted; releases the snapshot at that point.
    fn record_rows(&mut self, max_rows: i64) -> Result<Option<Recording>> {
        if !self.open {
            return Ok(None);
        }
        let _query_scope = TokenizerQueryScope::enter();

        let mut builder = RecordingBuilder::new(self.row_count);
        let page_sql = format!(
            "SELECT * FROM ({}) LIMIT {} OFFSET {}",
            self.sql, max_rows, self.row_count
        );
        let mut stmt = self.conn.prepare(&page_sql)?;
        for (name, bound) in &self.bindings {
            if let Some(idx) = stmt.parameter_index(&format!("$_{name}"))? {
                match bound {
                    Bound::Int(n) => stmt.raw_bind_parameter(idx, n)?,
                    Bound::Float(f) => stmt.raw_bind_parameter(idx, f)?,
                    Bound::Text(s) => stmt.raw_bind_parameter(idx, s)?,
                    Bound::Blob(b) => stmt.raw_bind_parameter(idx, b)?,
                }
            }
        }

        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(self.total_columns);
            let mut missing = 0u64;
            for i in 0..self.total_columns {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => {
                        if i < 64 {
                            missing |= 1 << i;
                        }
                        Value::Null
                    }
                    ValueRef::Integer(n) => Value::Int(n),
                    ValueRef::Real(f) => Value::Float(f),
                    ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => {
                        if i >= self.first_custom {
                            // User-declared blob columns hold encoded values
                            // scoped to the file's document dictionary;
                            // re-encode them under the result dictionary.
                            let value = codec::decode_value_exact(b)?;
                            codec::rescope(&value, &self.doc_keys, &mut self.result_keys)?
                        } else {
                            Value::Text(String::from_utf8_lossy(b).into_owned())
                        }
                    }
                };
                columns.push(value);
            }
            builder.push_row(&columns, missing);
        }
        drop(rows);
        drop(stmt);

        let recorded = builder.num_rows() as u64;
        self.row_count += recorded;
        if (recorded as i64) < max_rows {
            self.finish();
        }
        debug!(rows = recorded, total = self.row_count, "recorded result page");
        Ok(builder.finish())
    }

    /// Skips forward so the next page starts at absolute row `row`.
    fn skip_to(&mut self, row: u64) {
        if row > self.row_count {
            self.row_count = row;
        }
    }

    /// Ends the read transaction. Idempotent.
    fn finish(&mut self) {
        if self.open {
            let _ = self.conn.execute_batch("ROLLBACK");
            self.open = false;
        }
    }
}

impl Drop for LiveRows {
    fn drop(&mut self) {
        self.finish();
    }
}

// =============================================================================
// Shared Source
// =============================================================================

struct SourceState {
    live: Option<LiveRows>,
    /// A materialized recording waiting to be served (produced by
    /// `materialize`, consumed by the enumerator's next page request).
    pending: Option<Recording>,
    row_count: u64,
}

/// The enumerator's row source, shared with the file's observer bus so a
/// writer's begin can materialize the stream from any thread.
struct SharedSource {
    state: Mutex<SourceState>,
}

impl SharedSource {
    fn new(live: LiveRows) -> Self {
        Self {
            state: Mutex::new(SourceState {
                live: Some(live),
                pending: None,
                row_count: 0,
            }),
        }
    }

    /// Serves the next recording: the pending materialization if one exists,
    /// else a page stepped from the live statement (optionally skipping to
    /// `start` first).
    fn page_at(&self, start: Option<u64>, max_rows: i64) -> Result<Option<Recording>> {
        let mut state = self.state.lock().expect("source mutex poisoned");
        if let Some(pending) = state.pending.take() {
            return Ok(Some(pending));
        }
        let Some(live) = state.live.as_mut() else {
            return Ok(None);
        };
        if let Some(start) = start {
            live.skip_to(start);
        }
        let page = live.record_rows(max_rows)?;
        let row_count = live.row_count;
        let exhausted = !live.open;
        state.row_count = row_count;
        if exhausted {
            state.live = None;
        }
        Ok(page)
    }

    /// Records every remaining row into the pending slot and releases the
    /// statement.
    fn materialize(&self) -> Result<()> {
        let mut state = self.state.lock().expect("source mutex poisoned");
        if let Some(live) = &mut state.live {
            let rest = live.record_rows(i64::MAX)?;
            let total = live.row_count;
            state.live = None;
            state.row_count = total;
            if rest.is_some() {
                debug_assert!(state.pending.is_none());
                state.pending = rest;
            }
        }
        Ok(())
    }

    fn take_pending(&self) -> Option<Recording> {
        self.state.lock().expect("source mutex poisoned").pending.take()
    }

    fn has_live(&self) -> bool {
        self.state.lock().expect("source mutex poisoned").live.is_some()
    }

    fn row_count(&self) -> u64 {
        self.state.lock().expect("source mutex poisoned").row_count
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("source mutex poisoned");
        if let Some(live) = &mut state.live {
            live.finish();
            state.row_count = live.row_count;
        }
        state.live = None;
    }
}

impl PreTransactionObserver for SharedSource {
    fn pre_transaction(&self) {
        if let Err(e) = self.materialize() {
            warn!("failed to materialize one-shot query results before a transaction: {e}");
            self.finish();
        }
    }
}

// =============================================================================
// Playback
// =============================================================================

/// Read position within one recording; decodes the current row eagerly so
/// column access is infallible.
struct Playback {
    rec: Recording,
    pos: usize,
    columns: Vec<Value>,
    missing: u64,
}

impl Playback {
    fn new(rec: Recording) -> Result<Self> {
        let (columns, missing) = rec.decode_row(0)?;
        Ok(Self {
            rec,
            pos: 0,
            columns,
            missing,
        })
    }

    fn first_row(&self) -> u64 {
        self.rec.first_row()
    }

    fn recording(&self) -> &Recording {
        &self.rec
    }

    fn advance(&mut self) -> Result<bool> {
        if self.pos + 1 >= self.rec.num_rows() {
            return Ok(false);
        }
        self.pos += 1;
        let (columns, missing) = self.rec.decode_row(self.pos)?;
        self.columns = columns;
        self.missing = missing;
        Ok(true)
    }

    /// Positions at an absolute row index; false if outside this recording.
    fn seek_abs(&mut self, row: u64) -> Result<bool> {
        if row < self.rec.first_row() {
            return Ok(false);
        }
        let rel = (row - self.rec.first_row()) as usize;
        if rel >= self.rec.num_rows() {
            return Ok(false);
        }
        self.pos = rel;
        let (columns, missing) = self.rec.decode_row(self.pos)?;
        self.columns = columns;
        self.missing = missing;
        Ok(true)
    }
}

// =============================================================================
// Query Enumerator
// =============================================================================

/// A paged, snapshot-stable cursor over a query's results.
pub struct QueryEnumerator {
    query: Rc<Query>,
    options: QueryOptions,
    last_sequence: Sequence,
    source: Arc<SharedSource>,
    observer_token: Option<u64>,
    state: EnumState,
    cur: Option<Playback>,
    next_e: Option<Playback>,
    old_e: Option<Playback>,
    cur_row: i64,
}

impl std::fmt::Debug for QueryEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEnumerator")
            .field("state", &self.state)
            .field("cur_row", &self.cur_row)
            .finish_non_exhaustive()
    }
}

impl QueryEnumerator {
    pub(crate) fn create(
        query: Rc<Query>,
        options: QueryOptions,
        last_sequence: Sequence,
        conn: Connection,
    ) -> Result<QueryEnumerator> {
        let doc_keys = SharedKeys::load(&conn)?;
        let (bindings, unbound) =
            build_bindings(&query, &conn, options.params.as_deref(), &doc_keys)?;
        if !unbound.is_empty() {
            let names: Vec<String> = unbound.iter().map(|p| format!("${p}")).collect();
            warn!(
                params = %names.join(" "),
                "some query parameters were left unbound and will have value MISSING"
            );
        }

        let live = LiveRows {
            conn,
            sql: query.sql().to_string(),
            bindings,
            total_columns: query.total_columns(),
            first_custom: query.first_custom_result_column() as usize,
            doc_keys,
            result_keys: SharedKeys::new(),
            row_count: 0,
            open: true,
        };

        let mut enumerator = QueryEnumerator {
            query,
            options,
            last_sequence,
            source: Arc::new(SharedSource::new(live)),
            observer_token: None,
            state: EnumState::Fresh,
            cur: None,
            next_e: None,
            old_e: None,
            cur_row: -1,
        };

        if enumerator.options.one_shot {
            // Observe transaction begins so the remaining rows can be
            // materialized before the file changes underneath the statement.
            let observer: Arc<dyn PreTransactionObserver> =
                Arc::clone(&enumerator.source) as Arc<dyn PreTransactionObserver>;
            let token = enumerator
                .query
                .file()
                .add_observer(Arc::downgrade(&observer))?;
            enumerator.observer_token = Some(token);
        } else {
            enumerator.state = EnumState::Materializing;
            enumerator.fast_forward()?;
            enumerator.state = EnumState::Buffered;
        }
        debug!(one_shot = enumerator.options.one_shot, "created query enumerator");
        Ok(enumerator)
    }

    /// The file's last sequence when this snapshot was taken.
    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnumState {
        self.state
    }

    /// Current row index; -1 before the first `next()`.
    pub fn current_row(&self) -> i64 {
        self.cur_row
    }

    fn first_custom(&self) -> usize {
        self.query.first_custom_result_column() as usize
    }

    fn end_observing(&mut self) {
        if let Some(token) = self.observer_token.take() {
            self.query.file().remove_observer(token);
        }
    }

    /// Materializes every remaining row (queueing it as the next recording)
    /// and releases the statement.
    fn fast_forward(&mut self) -> Result<()> {
        if self.source.has_live() {
            self.source.materialize()?;
        }
        if self.next_e.is_none() {
            if let Some(rec) = self.source.take_pending() {
                self.next_e = Some(Playback::new(rec)?);
            }
        }
        self.end_observing();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Iteration
    // -------------------------------------------------------------------------

    /// Advances to the next row; false at the end of the results.
    pub fn next(&mut self) -> Result<bool> {
        let mut advanced = false;
        if let Some(cur) = &mut self.cur {
            advanced = cur.advance()?;
        }
        if !advanced {
            if let Some(queued) = self.next_e.take() {
                self.cur = Some(queued);
            } else {
                let previous = self.cur.take();
                if !self.options.one_shot {
                    // Keep the last recording around for refresh comparison.
                    self.old_e = previous;
                }
                self.cur = match self.source.page_at(None, PAGE_SIZE)? {
                    Some(rec) => Some(Playback::new(rec)?),
                    None => None,
                };
                if !self.source.has_live() {
                    self.end_observing();
                }
            }
        }

        if self.cur.is_some() {
            self.cur_row += 1;
            self.state = if self.options.one_shot && self.source.has_live() {
                EnumState::Streaming
            } else {
                EnumState::Buffered
            };
            Ok(true)
        } else {
            self.state = EnumState::Exhausted;
            Ok(false)
        }
    }

    /// User-declared columns of the current row (prefix columns skipped).
    /// Empty when there is no current row.
    pub fn columns(&self) -> &[Value] {
        match &self.cur {
            Some(cur) => {
                let first = self.first_custom().min(cur.columns.len());
                &cur.columns[first..]
            }
            None => &[],
        }
    }

    /// All columns of the current row, prefix included.
    pub fn all_columns(&self) -> &[Value] {
        self.cur.as_ref().map(|c| c.columns.as_slice()).unwrap_or(&[])
    }

    /// Bitmap of which of the first 64 columns were SQL-NULL.
    pub fn missing_columns(&self) -> u64 {
        self.cur.as_ref().map(|c| c.missing).unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Seek & Count
    // -------------------------------------------------------------------------

    /// Positions on an absolute row index so its columns are readable
    /// immediately.
    pub fn seek(&mut self, row_index: i64) -> Result<()> {
        if row_index == self.cur_row {
            return Ok(());
        }
        if row_index < 0 {
            return Err(Error::InvalidParameter("seek to a negative row".into()));
        }
        let target = row_index as u64;

        if let Some(cur) = &mut self.cur {
            if cur.seek_abs(target)? {
                self.cur_row = row_index;
                return Ok(());
            }
        }

        if row_index < self.cur_row {
            // Seeking back past the current recording. The one recoverable
            // case: landing exactly one row before it, by rewinding it and
            // parking it as next.
            let parkable = self
                .cur
                .as_ref()
                .map(|c| target + 1 == c.first_row())
                .unwrap_or(false);
            if parkable {
                let mut cur = self.cur.take().expect("checked above");
                cur.seek_abs(cur.first_row())?;
                self.next_e = Some(cur);
                self.cur_row = row_index;
                Ok(())
            } else {
                Err(Error::UnsupportedOperation(
                    "one-shot query enumerator cannot seek backward",
                ))
            }
        } else {
            // Seeking forward past the current recording. A queued recording
            // that contains the target is promoted; one that doesn't is
            // stale (e.g. a parked page behind the live statement's
            // position) and is discarded so the statement can step forward.
            if let Some(queued) = &mut self.next_e {
                if queued.seek_abs(target)? {
                    self.cur = self.next_e.take();
                    self.cur_row = row_index;
                    return Ok(());
                }
                self.next_e = None;
            }
            self.cur = None;
            match self.source.page_at(Some(target), PAGE_SIZE)? {
                Some(rec) => {
                    let mut playback = Playback::new(rec)?;
                    if !playback.seek_abs(target)? {
                        return Err(Error::InvalidParameter(
                            "seeking past the end of the query results".into(),
                        ));
                    }
                    self.cur = Some(playback);
                    self.cur_row = row_index;
                    if !self.source.has_live() {
                        self.end_observing();
                    }
                    Ok(())
                }
                None => Err(Error::InvalidParameter(
                    "seeking past the end of the query results".into(),
                )),
            }
        }
    }

    /// Total number of result rows. Forces full materialization.
    pub fn row_count(&mut self) -> Result<i64> {
        self.fast_forward()?;
        Ok(self.source.row_count() as i64)
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    fn comparison_recording(&self) -> Option<&Recording> {
        self.cur
            .as_ref()
            .or(self.next_e.as_ref())
            .or(self.old_e.as_ref())
            .map(Playback::recording)
    }

    fn has_equal_contents(&self, other: &QueryEnumerator) -> bool {
        let mine = self.comparison_recording();
        let theirs = other.cur.as_ref().or(other.next_e.as_ref()).map(Playback::recording);
        match (mine, theirs) {
            (Some(a), Some(b)) => a.has_equal_contents(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Re-runs the query. Returns a new enumerator iff the file changed
    /// *and* the recorded result bytes differ; otherwise `None` (updating
    /// the stored snapshot sequence so later refreshes stay cheap).
    pub fn refresh(&mut self) -> Result<Option<QueryEnumerator>> {
        if self.options.one_shot {
            return Err(Error::UnsupportedOperation(
                "one-shot query enumerator cannot refresh",
            ));
        }
        let fresh = self
            .query
            .create_enumerator_since(&self.options, self.last_sequence)?;
        match fresh {
            None => Ok(None),
            Some(fresh) => {
                if self.has_equal_contents(&fresh) {
                    self.last_sequence = fresh.last_sequence;
                    Ok(None)
                } else {
                    Ok(Some(fresh))
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Full-Text
    // -------------------------------------------------------------------------

    /// True iff the compiled query references a full-text index.
    pub fn has_full_text(&self) -> bool {
        !self.query.fts_tables().is_empty()
    }

    /// Parses the current row's full-text match terms from the implicit
    /// prefix columns: the FTS row id and the whitespace-separated offsets
    /// stream (quadruples of key index, term index, byte offset, length).
    pub fn full_text_terms(&self) -> Result<Vec<FullTextTerm>> {
        let row = self.all_columns();
        let data_source = match row.get(FTS_ROWID_COL) {
            Some(Value::Int(n)) => *n as u64,
            _ => {
                return Err(Error::CorruptRevisionData(
                    "full-text row id column is not an integer".into(),
                ))
            }
        };
        let offsets = match row.get(FTS_OFFSETS_COL) {
            Some(Value::Text(s)) => s,
            _ => {
                return Err(Error::CorruptRevisionData(
                    "full-text offsets column is not text".into(),
                ))
            }
        };

        let numbers: Vec<u32> = offsets
            .split_ascii_whitespace()
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| {
                Error::CorruptRevisionData("malformed full-text offsets stream".into())
            })?;
        if numbers.len() % 4 != 0 {
            warn!(
                len = numbers.len(),
                "full-text offsets stream is not a multiple of four; ignoring the tail"
            );
        }
        Ok(numbers
            .chunks_exact(4)
            .map(|quad| FullTextTerm {
                data_source,
                key_index: quad[0],
                term_index: quad[1],
                byte_offset: quad[2],
                byte_length: quad[3],
            })
            .collect())
    }
}

impl Drop for QueryEnumerator {
    fn drop(&mut self) {
        self.end_observing();
        self.source.finish();
        debug!("query enumerator dropped");
    }
}
