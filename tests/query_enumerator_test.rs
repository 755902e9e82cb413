mod common;

use std::collections::BTreeSet;

use nookdb::codec::{self, Value};
use nookdb::{
    CompiledSelector, Database, EnumState, Error, FullTextTerm, Query, QueryOptions, Transaction,
};

use common::{doc_key, docs_selector, docs_since_selector, FixedCompiler};

fn seed_docs(db: &Database, count: usize) -> std::rc::Rc<nookdb::SplitKeyStore> {
    let store = db.split_store("docs").unwrap();
    for i in 0..count {
        common::put_doc(db, &store, &doc_key(i), format!("{{\"n\":{i}}}").as_bytes());
    }
    store
}

fn compile_fixed(db: &Database, selector: CompiledSelector) -> std::rc::Rc<Query> {
    let store = db.split_store("docs").unwrap();
    Query::compile(db, &store, &FixedCompiler(selector), b"{\"all\":true}").unwrap()
}

fn body_n(i: i64) -> Value {
    // Documents are {"n": i}; the enumerator's fresh result dictionary
    // interns "n" first, so it always gets id 0.
    Value::Dict(vec![(0, Value::Int(i))])
}

// =============================================================================
// Buffered Mode
// =============================================================================

#[test]
fn buffered_enumerator_serves_all_rows_in_order() {
    let (_dir, _path, db) = common::create_temp_db("buffered.db");
    seed_docs(&db, 7);

    let query = compile_fixed(&db, docs_selector());
    let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
    assert_eq!(e.state(), EnumState::Buffered);

    let mut bodies = Vec::new();
    while e.next().unwrap() {
        assert_eq!(e.columns().len(), 1, "one custom column");
        bodies.push(e.columns()[0].clone());
    }
    assert_eq!(e.state(), EnumState::Exhausted);
    assert_eq!(bodies, (0..7).map(body_n).collect::<Vec<_>>());
}

#[test]
fn row_count_matches_a_fresh_iteration() {
    let (_dir, _path, db) = common::create_temp_db("rowcount.db");
    seed_docs(&db, 73);

    let query = compile_fixed(&db, docs_selector());
    let mut counting = query.create_enumerator(&QueryOptions::default()).unwrap();
    assert_eq!(counting.row_count().unwrap(), 73);

    let mut fresh = query.create_enumerator(&QueryOptions::default()).unwrap();
    let mut n = 0;
    while fresh.next().unwrap() {
        n += 1;
    }
    assert_eq!(n, 73);
}

#[test]
fn buffered_seek_moves_anywhere() {
    let (_dir, _path, db) = common::create_temp_db("seek.db");
    seed_docs(&db, 10);

    let query = compile_fixed(&db, docs_selector());
    let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
    assert!(e.next().unwrap());
    assert_eq!(e.current_row(), 0);

    e.seek(7).unwrap();
    assert_eq!(e.current_row(), 7);
    assert_eq!(e.columns()[0], body_n(7));

    // Backward is fine in buffered mode.
    e.seek(2).unwrap();
    assert_eq!(e.columns()[0], body_n(2));

    // Seeking to the current row is a no-op.
    e.seek(2).unwrap();
    assert_eq!(e.columns()[0], body_n(2));

    // Iteration continues from the seek position.
    assert!(e.next().unwrap());
    assert_eq!(e.columns()[0], body_n(3));

    let err = e.seek(10).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
    let err = e.seek(-3).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
}

// =============================================================================
// One-Shot Mode
// =============================================================================

#[test]
fn one_shot_streams_in_pages_and_cannot_rewind_past_a_page() {
    let (_dir, _path, db) = common::create_temp_db("oneshot.db");
    seed_docs(&db, 120);

    let query = compile_fixed(&db, docs_selector());
    let options = QueryOptions {
        one_shot: true,
        ..Default::default()
    };
    let mut e = query.create_enumerator(&options).unwrap();
    assert_eq!(e.state(), EnumState::Fresh);

    // Consume into the second page (rows 0..=59).
    for i in 0..60 {
        assert!(e.next().unwrap());
        assert_eq!(e.columns()[0], body_n(i));
    }
    assert_eq!(e.state(), EnumState::Streaming);

    // Backward within the current page's window works...
    e.seek(55).unwrap();
    assert_eq!(e.columns()[0], body_n(55));

    // ...but not into an earlier, discarded page.
    let err = e.seek(10).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)));

    // Forward seek past the current page skips ahead on the live statement.
    e.seek(100).unwrap();
    assert_eq!(e.columns()[0], body_n(100));

    let err = e.seek(400).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
}

#[test]
fn forward_seek_past_a_parked_recording_steps_the_live_statement() {
    let (_dir, _path, db) = common::create_temp_db("oneshot-park.db");
    seed_docs(&db, 120);

    let query = compile_fixed(&db, docs_selector());
    let options = QueryOptions {
        one_shot: true,
        ..Default::default()
    };
    let mut e = query.create_enumerator(&options).unwrap();

    // Consume into the second page (rows 0..=59), then seek to the row just
    // before it: the page is rewound and parked as the next recording.
    for i in 0..60 {
        assert!(e.next().unwrap());
        assert_eq!(e.columns()[0], body_n(i));
    }
    e.seek(49).unwrap();
    assert_eq!(e.current_row(), 49);

    // A forward target beyond the parked page is still reachable: the live
    // statement has unconsumed rows past 99, so the stale park must be
    // dropped in favor of stepping the statement forward.
    e.seek(105).unwrap();
    assert_eq!(e.columns()[0], body_n(105));

    let mut remaining = 0;
    while e.next().unwrap() {
        remaining += 1;
    }
    assert_eq!(remaining, 14, "rows 106..=119 follow the seek target");
}

#[test]
fn one_shot_refresh_is_unsupported() {
    let (_dir, _path, db) = common::create_temp_db("oneshot-refresh.db");
    seed_docs(&db, 3);

    let query = compile_fixed(&db, docs_selector());
    let options = QueryOptions {
        one_shot: true,
        ..Default::default()
    };
    let mut e = query.create_enumerator(&options).unwrap();
    assert!(matches!(e.refresh(), Err(Error::UnsupportedOperation(_))));
}

#[test]
fn one_shot_materializes_when_a_writer_begins() {
    let (_dir, _path, db) = common::create_temp_db("oneshot-write.db");
    let store = seed_docs(&db, 120);

    let query = compile_fixed(&db, docs_selector());
    let options = QueryOptions {
        one_shot: true,
        ..Default::default()
    };
    let mut e = query.create_enumerator(&options).unwrap();

    for i in 0..10 {
        assert!(e.next().unwrap());
        assert_eq!(e.columns()[0], body_n(i));
    }

    // A writer begins: the pre-transaction observer fires and the enumerator
    // records its remaining rows before the file changes.
    let t = Transaction::new(&db).unwrap();
    let body = db.encode_document(b"{\"n\":5000}", &t).unwrap();
    store
        .set(&doc_key(50), b"2-aa", &body, nookdb::DocumentFlags::NONE, &t, None, true)
        .unwrap();
    store
        .set(&doc_key(200), b"1-aa", &body, nookdb::DocumentFlags::NONE, &t, None, true)
        .unwrap();
    t.commit().unwrap();

    // The reader continues past row 10 and sees all 120 original rows,
    // including the pre-write body of the row modified underneath it.
    let mut total = 10;
    while e.next().unwrap() {
        if e.current_row() == 50 {
            assert_eq!(e.columns()[0], body_n(50), "snapshot must predate the write");
        }
        total += 1;
    }
    assert_eq!(total, 120);
    assert_eq!(e.state(), EnumState::Exhausted);
}

// =============================================================================
// Refresh
// =============================================================================

#[test]
fn refresh_returns_nothing_while_results_are_unchanged() {
    let (_dir, _path, db) = common::create_temp_db("refresh.db");
    let store = seed_docs(&db, 5);

    let query = compile_fixed(&db, docs_selector());
    let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
    while e.next().unwrap() {}

    // No writes at all: the sequence check short-circuits.
    assert!(e.refresh().unwrap().is_none());

    // A write that doesn't touch the query's rows: sequence changed, bytes
    // identical, still no new enumerator.
    let other = db.split_store("other").unwrap();
    common::put_doc(&db, &other, b"elsewhere", b"{\"n\":1}");
    assert!(e.refresh().unwrap().is_none());

    // Mutating a result row produces a fresh enumerator.
    common::put_doc(&db, &store, &doc_key(2), b"{\"n\":222}");
    let mut fresh = e.refresh().unwrap().expect("results changed");
    let mut bodies = Vec::new();
    while fresh.next().unwrap() {
        bodies.push(fresh.columns()[0].clone());
    }
    assert_eq!(bodies[2], body_n(222));
    assert_eq!(bodies.len(), 5);
}

// =============================================================================
// Parameters
// =============================================================================

#[test]
fn parameters_bind_by_name() {
    let (_dir, _path, db) = common::create_temp_db("params.db");
    seed_docs(&db, 6);

    let query = compile_fixed(&db, docs_since_selector());
    let options = QueryOptions {
        params: Some(b"{\"min_seq\": 3}".to_vec()),
        ..Default::default()
    };
    let mut e = query.create_enumerator(&options).unwrap();
    let mut n = 0;
    while e.next().unwrap() {
        n += 1;
    }
    assert_eq!(n, 4, "sequences 3..=6 qualify");
}

#[test]
fn unknown_parameter_names_are_rejected() {
    let (_dir, _path, db) = common::create_temp_db("params-unknown.db");
    seed_docs(&db, 2);

    let query = compile_fixed(&db, docs_since_selector());
    let options = QueryOptions {
        params: Some(b"{\"min_seq\": 1, \"bogus\": 7}".to_vec()),
        ..Default::default()
    };
    match query.create_enumerator(&options) {
        Err(Error::InvalidQueryParam(name)) => assert_eq!(name, "bogus"),
        other => panic!("expected InvalidQueryParam, got {other:?}"),
    }
}

#[test]
fn unbound_required_parameters_yield_missing_not_errors() {
    let (_dir, _path, db) = common::create_temp_db("params-unbound.db");
    seed_docs(&db, 4);

    let query = compile_fixed(&db, docs_since_selector());
    // min_seq never bound: it compares as NULL, so no row qualifies - but
    // the query itself runs.
    let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
    assert!(!e.next().unwrap());
}

#[test]
fn binary_parameter_dictionaries_bind_too() {
    let (_dir, _path, db) = common::create_temp_db("params-binary.db");
    seed_docs(&db, 6);

    // Get "min_seq" into the file's document dictionary, then address it by
    // its shared-key id.
    let other = db.split_store("other").unwrap();
    common::put_doc(&db, &other, b"k", b"{\"min_seq\": 0}");
    let mut keys = db.document_keys();
    let id = keys.intern("min_seq");

    let params = codec::encode_value_to_vec(&Value::Dict(vec![(id, Value::Int(5))]));
    let query = compile_fixed(&db, docs_since_selector());
    let options = QueryOptions {
        params: Some(params),
        ..Default::default()
    };
    let mut e = query.create_enumerator(&options).unwrap();
    let mut n = 0;
    while e.next().unwrap() {
        n += 1;
    }
    assert_eq!(n, 2, "sequences 5 and 6 qualify");
}

// =============================================================================
// Columns & Recording
// =============================================================================

#[test]
fn null_columns_set_bits_in_the_missing_bitmap() {
    let (_dir, _path, db) = common::create_temp_db("missing.db");
    seed_docs(&db, 1);

    let selector = CompiledSelector {
        sql: "SELECT key, sequence, NULL AS note, body FROM \"kv_docs\" ORDER BY key".to_string(),
        parameters: BTreeSet::new(),
        fts_tables: Vec::new(),
        first_custom_result_column: 2,
        column_titles: vec!["key".into(), "sequence".into(), "note".into(), "body".into()],
        uses_expiration: false,
    };
    let query = compile_fixed(&db, selector);
    assert_eq!(query.column_count(), 2);

    let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
    assert!(e.next().unwrap());
    assert_eq!(e.columns(), &[Value::Null, body_n(0)]);
    assert_eq!(e.missing_columns(), 1 << 2, "only the NULL column is flagged");
}

#[test]
fn explain_includes_sql_plan_and_selector() {
    let (_dir, _path, db) = common::create_temp_db("explain.db");
    seed_docs(&db, 1);

    let query = compile_fixed(&db, docs_selector());
    let explained = query.explain().unwrap();
    assert!(explained.contains("SELECT key, sequence, body"));
    assert!(explained.contains("kv_docs"), "plan should mention the table");
    assert!(explained.contains("{\"all\":true}"), "original selector is appended");
}

// =============================================================================
// Full-Text
// =============================================================================

fn fts_selector() -> CompiledSelector {
    CompiledSelector {
        sql: "SELECT docid, offsets, content FROM \"fts_docs\" ORDER BY docid".to_string(),
        parameters: BTreeSet::new(),
        fts_tables: vec!["fts_docs".to_string()],
        first_custom_result_column: 2,
        column_titles: vec!["docid".into(), "offsets".into(), "content".into()],
        uses_expiration: false,
    }
}

fn create_fts_fixture(path: &std::path::Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE fts_docs (docid INTEGER PRIMARY KEY, offsets TEXT, content TEXT);
         INSERT INTO fts_docs VALUES (7, '0 0 4 5 1 2 14 3', 'brown fox jumps over');",
    )
    .unwrap();
}

#[test]
fn missing_fts_table_fails_compilation() {
    let (_dir, _path, db) = common::create_temp_db("fts-missing.db");
    let store = db.split_store("docs").unwrap();
    let err = Query::compile(&db, &store, &FixedCompiler(fts_selector()), b"{}").unwrap_err();
    assert!(matches!(err, Error::NoSuchIndex(_)));
}

#[test]
fn full_text_terms_parse_the_offsets_stream() {
    let (_dir, path, db) = common::create_temp_db("fts.db");
    create_fts_fixture(&path);

    let query = compile_fixed(&db, fts_selector());
    let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
    assert!(e.has_full_text());
    assert!(e.next().unwrap());

    let terms = e.full_text_terms().unwrap();
    assert_eq!(
        terms,
        vec![
            FullTextTerm {
                data_source: 7,
                key_index: 0,
                term_index: 0,
                byte_offset: 4,
                byte_length: 5,
            },
            FullTextTerm {
                data_source: 7,
                key_index: 1,
                term_index: 2,
                byte_offset: 14,
                byte_length: 3,
            },
        ]
    );

    // Matched-text lookup goes back through the FTS table by docid.
    let text = query
        .matched_text(&FullTextTerm {
            data_source: 7,
            key_index: 2,
            term_index: 0,
            byte_offset: 0,
            byte_length: 0,
        })
        .unwrap();
    assert_eq!(text, b"brown fox jumps over");

    // A vanished row warns and returns empty, not an error.
    let text = query
        .matched_text(&FullTextTerm {
            data_source: 999,
            key_index: 2,
            term_index: 0,
            byte_offset: 0,
            byte_length: 0,
        })
        .unwrap();
    assert!(text.is_empty());
}
