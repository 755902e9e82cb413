mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nookdb::{
    ContentOption, Database, DocumentFlags, Error, PreTransactionObserver, Transaction,
    TransactionState,
};

#[test]
fn writers_on_the_same_path_serialize() {
    let (_dir, path, db) = common::create_temp_db("serialize.db");
    drop(db);

    // Each thread opens its own handle; the shared per-path File state must
    // serialize their transactions.
    let path_a = path.clone();
    let a = std::thread::spawn(move || {
        let db = Database::open(&path_a).unwrap();
        let store = db.split_store("docs").unwrap();
        let t = Transaction::new(&db).unwrap();
        store
            .set(b"from-a", b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        t.commit().unwrap();
    });

    // Give thread A a head start into its transaction.
    std::thread::sleep(Duration::from_millis(30));
    let started = Instant::now();
    let db = Database::open(&path).unwrap();
    let store = db.split_store("docs").unwrap();
    let t = Transaction::new(&db).unwrap();
    let waited = started.elapsed();
    store
        .set(b"from-b", b"1-bb", b"{}", DocumentFlags::NONE, &t, None, true)
        .unwrap();
    t.commit().unwrap();
    a.join().unwrap();

    assert!(
        waited >= Duration::from_millis(40),
        "second writer should have blocked, waited only {waited:?}"
    );
    assert_eq!(store.record_count(true).unwrap(), 2);

    // Sequences assigned across the two commits are strictly increasing.
    let sa = store.get(b"from-a", ContentOption::MetaOnly).unwrap().unwrap().sequence;
    let sb = store.get(b"from-b", ContentOption::MetaOnly).unwrap().unwrap().sequence;
    assert!(sa < sb);
}

#[test]
fn sequences_within_one_transaction_are_contiguous() {
    let (_dir, _path, db) = common::create_temp_db("contig.db");
    let store = db.split_store("docs").unwrap();

    let t = Transaction::new(&db).unwrap();
    let mut seqs = Vec::new();
    for i in 0..5 {
        let key = common::doc_key(i);
        seqs.push(
            store
                .set(&key, b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
                .unwrap()
                .as_raw(),
        );
    }
    t.commit().unwrap();

    let expected: Vec<u64> = (1..=5).collect();
    assert_eq!(seqs, expected);
    assert_eq!(db.last_sequence().unwrap().as_raw(), 5);
}

#[test]
fn dropping_a_committing_transaction_commits() {
    let (_dir, _path, db) = common::create_temp_db("drop-commit.db");
    let store = db.split_store("docs").unwrap();

    {
        let t = Transaction::new(&db).unwrap();
        store
            .set(b"k", b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        // Scope exit applies the current state, which is still Commit.
    }
    assert!(store.get(b"k", ContentOption::MetaOnly).unwrap().is_some());
}

#[test]
fn aborted_transaction_rolls_everything_back() {
    let (_dir, _path, db) = common::create_temp_db("abort.db");
    let store = db.split_store("docs").unwrap();

    {
        let t = Transaction::new(&db).unwrap();
        store
            .set(b"k", b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
            .unwrap();
        t.abort();
        assert_eq!(t.state(), TransactionState::Abort);
    }
    assert!(store.get(b"k", ContentOption::MetaOnly).unwrap().is_none());
    assert_eq!(db.last_sequence().unwrap().as_raw(), 0, "allocation rolled back too");
}

#[test]
fn a_failed_guarded_operation_flips_the_state_to_abort() {
    let (_dir, _path, db) = common::create_temp_db("flip.db");
    let store = db.split_store("docs").unwrap();

    let t = Transaction::new(&db).unwrap();
    store
        .set(b"k", b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
        .unwrap();
    assert_eq!(t.state(), TransactionState::Commit);

    let err: Result<(), Error> = t.check(Err(Error::Corrupt("simulated engine failure".into())));
    assert!(err.is_err());
    assert_eq!(t.state(), TransactionState::Abort);
    drop(t);

    assert!(store.get(b"k", ContentOption::MetaOnly).unwrap().is_none());
}

#[test]
fn precondition_violations_do_not_change_transaction_state() {
    let (_dir, _path, db) = common::create_temp_db("precondition.db");
    let store = db.split_store("docs").unwrap();

    let t = Transaction::new(&db).unwrap();
    let err = store
        .set(b"", b"1-aa", b"{}", DocumentFlags::NONE, &t, None, true)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
    assert_eq!(t.state(), TransactionState::Commit);
    t.commit().unwrap();
}

#[test]
fn a_noop_transaction_still_excludes_writers() {
    let (_dir, path, db) = common::create_temp_db("noop.db");

    let t = Transaction::no_op(&db).unwrap();
    assert_eq!(t.state(), TransactionState::NoOp);

    let path2 = path.clone();
    let blocked = std::thread::spawn(move || {
        let db = Database::open(&path2).unwrap();
        let started = Instant::now();
        let t = Transaction::new(&db).unwrap();
        let waited = started.elapsed();
        drop(t);
        waited
    });

    std::thread::sleep(Duration::from_millis(80));
    drop(t);
    let waited = blocked.join().unwrap();
    assert!(
        waited >= Duration::from_millis(40),
        "writer should have waited for the no-op scope, waited {waited:?}"
    );
}

struct CountingObserver(AtomicU32);

impl PreTransactionObserver for CountingObserver {
    fn pre_transaction(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn observers_fire_on_every_transaction_begin() {
    let (_dir, _path, db) = common::create_temp_db("observer.db");

    let observer = Arc::new(CountingObserver(AtomicU32::new(0)));
    let as_dyn: Arc<dyn PreTransactionObserver> = observer.clone();
    let token = db
        .add_pre_transaction_observer(Arc::downgrade(&as_dyn))
        .unwrap();

    Transaction::new(&db).unwrap().commit().unwrap();
    drop(Transaction::no_op(&db).unwrap());
    assert_eq!(observer.0.load(Ordering::SeqCst), 2);

    db.remove_pre_transaction_observer(token);
    Transaction::new(&db).unwrap().commit().unwrap();
    assert_eq!(observer.0.load(Ordering::SeqCst), 2, "removed observer stays silent");
}

#[test]
fn dead_observers_are_pruned_silently() {
    let (_dir, _path, db) = common::create_temp_db("observer-dead.db");

    let observer = Arc::new(CountingObserver(AtomicU32::new(0)));
    let as_dyn: Arc<dyn PreTransactionObserver> = observer.clone();
    db.add_pre_transaction_observer(Arc::downgrade(&as_dyn)).unwrap();
    drop(as_dyn);
    drop(observer);

    // Nothing to call; must not panic or wedge.
    Transaction::new(&db).unwrap().commit().unwrap();
}
