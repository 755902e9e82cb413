#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;

use nookdb::{
    CompiledSelector, Database, DocumentFlags, QueryCompiler, Result, Sequence, SplitKeyStore,
    Transaction,
};

/// Creates a fresh on-disk database in its own temp directory.
pub fn create_temp_db(name: &str) -> (tempfile::TempDir, PathBuf, Database) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let db = Database::open(&path).expect("open database");
    (dir, path, db)
}

/// Writes one JSON document into a split store, in its own transaction.
pub fn put_doc(db: &Database, store: &SplitKeyStore, key: &[u8], json: &[u8]) -> Sequence {
    let t = Transaction::new(db).expect("begin transaction");
    let body = db.encode_document(json, &t).expect("encode document");
    let seq = store
        .set(key, b"1-aa", &body, DocumentFlags::NONE, &t, None, true)
        .expect("set document");
    t.commit().expect("commit");
    seq
}

/// Deletes a document (writes a tombstone) in its own transaction.
pub fn delete_doc(db: &Database, store: &SplitKeyStore, key: &[u8]) -> Sequence {
    let t = Transaction::new(db).expect("begin transaction");
    let seq = store
        .set(key, b"2-aa", b"", DocumentFlags::DELETED, &t, None, true)
        .expect("set tombstone");
    t.commit().expect("commit");
    seq
}

/// A compiler stub returning a canned compilation, standing in for the
/// external selector parser.
pub struct FixedCompiler(pub CompiledSelector);

impl QueryCompiler for FixedCompiler {
    fn compile(&self, _store: &SplitKeyStore, _selector: &[u8]) -> Result<CompiledSelector> {
        Ok(self.0.clone())
    }
}

/// All documents in the `docs` store, ordered by key. Prefix columns:
/// key, sequence; custom column: body.
pub fn docs_selector() -> CompiledSelector {
    CompiledSelector {
        sql: "SELECT key, sequence, body FROM \"kv_docs\" ORDER BY key".to_string(),
        parameters: BTreeSet::new(),
        fts_tables: Vec::new(),
        first_custom_result_column: 2,
        column_titles: vec!["key".into(), "sequence".into(), "body".into()],
        uses_expiration: false,
    }
}

/// Like [`docs_selector`], gated on a required `min_seq` parameter.
pub fn docs_since_selector() -> CompiledSelector {
    CompiledSelector {
        sql: "SELECT key, sequence, body FROM \"kv_docs\" WHERE sequence >= $_min_seq \
              ORDER BY key"
            .to_string(),
        parameters: BTreeSet::from(["min_seq".to_string()]),
        fts_tables: Vec::new(),
        first_custom_result_column: 2,
        column_titles: vec!["key".into(), "sequence".into(), "body".into()],
        uses_expiration: false,
    }
}

/// Zero-padded document key, so key order equals insertion order.
pub fn doc_key(i: usize) -> Vec<u8> {
    format!("doc-{i:04}").into_bytes()
}
