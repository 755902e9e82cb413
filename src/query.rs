//! # Query Compilation
//!
//! A [`Query`] is an immutable compilation artifact: the SQL a selector
//! compiled to, the parameters it can bind, the full-text tables it touches,
//! and the shape of its result columns. Enumeration lives in
//! `enumerator.rs`; this module owns compile-time concerns plus the two
//! statement-shaped helpers that outlive enumeration (`explain`,
//! `matched_text`).
//!
//! ## The Compiler Boundary
//!
//! Translating a JSON-shaped selector into SQL is the job of an external
//! collaborator behind the [`QueryCompiler`] trait. The engine only cares
//! about its output contract, [`CompiledSelector`]. Tests plug in trivial
//! compilers; the production parser lives elsewhere.
//!
//! ## Rust Pattern: Immutable Compilation Artifact
//!
//! A [`Query`] never changes after `compile` returns - no setters, no
//! interior mutability, handed out as `Rc<Query>`. That's what makes it safe
//! to create any number of enumerators from one query, including from
//! `refresh()` re-running an old one: every enumerator sees the identical
//! SQL, parameter set, and column layout, and differs only in its snapshot.
//!
//! ## Why Validate Parameters Up Front?
//!
//! Compilation strips `opt_`-prefixed parameters from the required set and
//! checks FTS tables exist before preparing anything. Failing at compile
//! time turns "my query silently returns nothing" into an error with the
//! offending name in it, at the one moment the caller is looking.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::database::Database;
use crate::enumerator::{QueryEnumerator, QueryOptions};
use crate::error::{Error, Result};
use crate::schema;
use crate::split::SplitKeyStore;
use crate::transaction::File;
use crate::types::Sequence;

// =============================================================================
// Compiler Boundary
// =============================================================================

/// Output of selector compilation.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    /// The generated SQL. Named parameters use the `$_name` convention.
    pub sql: String,
    /// Names of bindable parameters (without the `$_` prefix).
    pub parameters: BTreeSet<String>,
    /// Full-text virtual tables the SQL references.
    pub fts_tables: Vec<String>,
    /// Index of the first user-declared result column. Columns before it are
    /// implicit prefix columns (doc id, sequence, ...).
    pub first_custom_result_column: u32,
    /// Ordered titles for all result columns.
    pub column_titles: Vec<String>,
    /// True if the selector references document expiration.
    pub uses_expiration: bool,
}

/// Compiles a JSON-shaped selector into SQL over a split store's tables.
pub trait QueryCompiler {
    /// Compiles `selector`. Implementations report malformed selectors as
    /// [`Error::InvalidParameter`].
    fn compile(&self, store: &SplitKeyStore, selector: &[u8]) -> Result<CompiledSelector>;
}

// =============================================================================
// Full-Text Terms
// =============================================================================

/// One full-text match span, as reported by the FTS engine's offsets stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullTextTerm {
    /// FTS row id of the matched document.
    pub data_source: u64,
    /// Which indexed key (column) matched.
    pub key_index: u32,
    /// Which query term matched.
    pub term_index: u32,
    /// Byte offset of the match in the indexed text.
    pub byte_offset: u32,
    /// Byte length of the match.
    pub byte_length: u32,
}

// =============================================================================
// Tokenizer Query Flag
// =============================================================================

static TOKENIZER_RUNNING_QUERY: AtomicBool = AtomicBool::new(false);

/// True while result rows are being recorded, so the FTS tokenizer can tell
/// query-time tokenization from index-time tokenization.
pub fn tokenizer_running_query() -> bool {
    TOKENIZER_RUNNING_QUERY.load(Ordering::SeqCst)
}

/// Scope guard setting the tokenizer query flag; clears it on drop, so the
/// flag resets on both normal and error exits.
pub(crate) struct TokenizerQueryScope;

impl TokenizerQueryScope {
    pub(crate) fn enter() -> Self {
        TOKENIZER_RUNNING_QUERY.store(true, Ordering::SeqCst);
        Self
    }
}

impl Drop for TokenizerQueryScope {
    fn drop(&mut self) {
        TOKENIZER_RUNNING_QUERY.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Query
// =============================================================================

/// A compiled query: factory for enumerators.
pub struct Query {
    path: PathBuf,
    file: Arc<File>,
    conn: Rc<Connection>,
    selector: Vec<u8>,
    sql: String,
    /// Parameters that must be bound (the `opt_`-prefixed ones removed).
    required_params: BTreeSet<String>,
    fts_tables: Vec<String>,
    first_custom: u32,
    column_titles: Vec<String>,
    total_columns: usize,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Compiles `selector` against `store`.
    ///
    /// Fails with [`Error::NoSuchIndex`] if the selector uses a full-text
    /// match but the backing FTS table does not exist. Enables expiration
    /// tracking on the store if the selector references expiration.
    pub fn compile(
        db: &Database,
        store: &SplitKeyStore,
        compiler: &dyn QueryCompiler,
        selector: &[u8],
    ) -> Result<Rc<Query>> {
        debug!(selector = %String::from_utf8_lossy(selector), "compiling query");
        let compiled = compiler.compile(store, selector)?;

        let mut required = compiled.parameters;
        // Optional parameters don't warn when left unbound.
        required.retain(|p| !p.starts_with("opt_"));

        for fts in &compiled.fts_tables {
            if !schema::table_exists(db.writer_conn(), fts)? {
                return Err(Error::NoSuchIndex(format!(
                    "'match' test requires the full-text index '{fts}'"
                )));
            }
        }

        if compiled.uses_expiration {
            store.add_expiration()?;
        }

        // Prepare once to validate the SQL and learn the column count.
        let total_columns = {
            let stmt = db.writer_conn().prepare(&compiled.sql)?;
            stmt.column_count()
        };
        debug!(sql = %compiled.sql, "compiled query");

        Ok(Rc::new(Query {
            path: db.path().to_path_buf(),
            file: Arc::clone(db.file()),
            conn: db.shared_conn(),
            selector: selector.to_vec(),
            sql: compiled.sql,
            required_params: required,
            fts_tables: compiled.fts_tables,
            first_custom: compiled.first_custom_result_column,
            column_titles: compiled.column_titles,
            total_columns,
        }))
    }

    /// The generated SQL.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Ordered titles of all result columns.
    pub fn column_titles(&self) -> &[String] {
        &self.column_titles
    }

    /// Number of user-visible result columns.
    pub fn column_count(&self) -> usize {
        self.total_columns - self.first_custom as usize
    }

    /// Index of the first user-declared result column.
    pub fn first_custom_result_column(&self) -> u32 {
        self.first_custom
    }

    pub(crate) fn total_columns(&self) -> usize {
        self.total_columns
    }

    pub(crate) fn required_params(&self) -> &BTreeSet<String> {
        &self.required_params
    }

    /// Full-text tables the query references.
    pub fn fts_tables(&self) -> &[String] {
        &self.fts_tables
    }

    pub(crate) fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// The SQL, the engine's query plan, and the original selector.
    pub fn explain(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str(&self.sql);
        out.push_str("\n\n");

        let mut stmt = self.conn.prepare(&format!("EXPLAIN QUERY PLAN {}", self.sql))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for i in 0..3 {
                let n: i64 = row.get(i)?;
                out.push_str(&format!("{n}|"));
            }
            let detail: String = row.get(3)?;
            out.push_str(&format!(" {detail}\n"));
        }

        out.push('\n');
        out.push_str(&String::from_utf8_lossy(&self.selector));
        out.push('\n');
        Ok(out)
    }

    /// Fetches the indexed text a full-text term matched, by FTS row id and
    /// key index. Returns empty bytes (with a warning) if the row is gone.
    pub fn matched_text(&self, term: &FullTextTerm) -> Result<Vec<u8>> {
        let fts = self
            .fts_tables
            .first()
            .ok_or_else(|| Error::NoSuchIndex("query has no full-text index".into()))?;

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM \"{fts}\" WHERE docid=?"))?;
        let mut rows = stmt.query([term.data_source as i64])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(term.key_index as usize)?;
                Ok(text.into_bytes())
            }
            None => {
                warn!(
                    fts = %fts,
                    docid = term.data_source,
                    "full-text index has no row for docid"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Creates an enumerator over the query's current results.
    pub fn create_enumerator(self: &Rc<Self>, options: &QueryOptions) -> Result<QueryEnumerator> {
        match self.create_enumerator_since(options, Sequence::NONE)? {
            Some(e) => Ok(e),
            // Sequence::NONE never matches the snapshot check.
            None => Err(Error::Corrupt("enumerator creation short-circuited".into())),
        }
    }

    /// Creates an enumerator, unless the file's last sequence still equals
    /// `last_seq` (meaning the results cannot have changed).
    pub fn create_enumerator_since(
        self: &Rc<Self>,
        options: &QueryOptions,
        last_seq: Sequence,
    ) -> Result<Option<QueryEnumerator>> {
        // The read transaction pins a snapshot, so the sequence check below
        // stays consistent with the rows the enumerator will see.
        let conn = schema::open_read_only(&self.path)?;
        conn.execute_batch("BEGIN")?;
        let current = Sequence::from_raw(schema::last_sequence(&conn)?);
        if !last_seq.is_none() && last_seq == current {
            let _ = conn.execute_batch("ROLLBACK");
            return Ok(None);
        }
        QueryEnumerator::create(Rc::clone(self), options.clone(), current, conn).map(Some)
    }
}
