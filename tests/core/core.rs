use serde_json::json;
use std::fs;
use std::time::Duration;
use taucmdr::core::database::JsonDatabase;
use taucmdr::core::error::TauError;
use taucmdr::core::lock::{InterProcessLock, LockHolder};
use taucmdr::core::record::{Keys, fields};
use taucmdr::core::store::Store;
use tempfile::tempdir;

#[test]
fn failed_transaction_leaves_file_byte_identical() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("db.json");
    let db = JsonDatabase::open(&path).unwrap();
    db.insert("Target", fields(json!({"name": "t1", "cc": "gcc"}))).unwrap();
    let before = fs::read(&path).unwrap();

    let result: Result<(), TauError> = db.transaction(|| {
        db.insert("Target", fields(json!({"name": "t2"})))?;
        db.update("Target", &fields(json!({"cc": "icc"})), &Keys::ById(1), false)?;
        Err(TauError::InternalError("abort".into()))
    });
    assert!(result.is_err());
    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(db.count("Target").unwrap(), 1);
    assert_eq!(db.transaction_depth(), 0);
}

#[test]
fn nested_transactions_commit_at_outermost_exit() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("db.json");
    let db = JsonDatabase::open(&path).unwrap();
    let before = fs::read(&path).unwrap();

    db.transaction(|| {
        db.insert("Measurement", fields(json!({"name": "m1"})))?;
        db.transaction(|| {
            assert_eq!(db.transaction_depth(), 2);
            db.insert("Measurement", fields(json!({"name": "m2"})))?;
            Ok(())
        })?;
        // Inner exit does not write.
        assert_eq!(fs::read(&path).unwrap(), before);
        Ok(())
    })
    .unwrap();

    let reopened = JsonDatabase::open(&path).unwrap();
    assert_eq!(reopened.count("Measurement").unwrap(), 2);
    let m2 = reopened
        .get("Measurement", &Keys::by_field("name", "m2"), false)
        .unwrap()
        .unwrap();
    assert_eq!(m2.id(), Some(2));
}

#[test]
fn read_only_database_serves_reads_and_rejects_writes() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("db.json");
    {
        let db = JsonDatabase::open(&path).unwrap();
        db.insert("Application", fields(json!({"name": "a1"}))).unwrap();
    }
    let db = JsonDatabase::open_read_only(&path).unwrap();
    assert!(db.is_readonly());
    assert!(db.contains("Application", &Keys::by_field("name", "a1"), false).unwrap());
    let err = db
        .insert("Application", fields(json!({"name": "a2"})))
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(!err.hints().is_empty());
}

#[test]
fn match_any_ors_field_equalities() {
    let tmp = tempdir().unwrap();
    let db = JsonDatabase::open(&tmp.path().join("db.json")).unwrap();
    db.insert("Target", fields(json!({"name": "t1", "cc": "gcc"}))).unwrap();
    db.insert("Target", fields(json!({"name": "t2", "cc": "icc"}))).unwrap();
    db.insert("Target", fields(json!({"name": "t3", "cc": "clang"}))).unwrap();

    let keys = Keys::ByFields(fields(json!({"name": "t1", "cc": "icc"})));
    assert_eq!(db.search("Target", &keys, true).unwrap().len(), 2);
    assert!(db.search("Target", &keys, false).unwrap().is_empty());

    let named = db
        .match_field("Target", "cc", |v| v.as_str().is_some_and(|cc| cc.ends_with("cc")))
        .unwrap();
    assert_eq!(named.len(), 2);
}

#[test]
fn lock_is_reentrant_and_released_by_outermost_guard() {
    let tmp = tempdir().unwrap();
    let lock = InterProcessLock::for_prefix(tmp.path(), Duration::from_secs(1), Duration::from_secs(3600));
    {
        let _outer = lock.acquire().unwrap();
        {
            let _inner = lock.acquire().unwrap();
            assert!(lock.path().exists());
        }
        assert!(lock.is_held());
        assert!(lock.path().exists());
    }
    assert!(!lock.is_held());
    assert!(!lock.path().exists());
}

#[test]
fn second_handle_times_out_while_lock_is_held() {
    let tmp = tempdir().unwrap();
    let first = InterProcessLock::for_prefix(tmp.path(), Duration::from_secs(1), Duration::from_secs(3600));
    let second = InterProcessLock::for_prefix(tmp.path(), Duration::from_millis(200), Duration::from_secs(3600));
    let _guard = first.acquire().unwrap();
    let err = second.acquire().unwrap_err();
    assert!(err.to_string().starts_with("Timed out waiting for lock"));
    assert_eq!(err.hints().len(), 2);
}

#[cfg(target_os = "linux")]
#[test]
fn lock_left_by_dead_process_is_taken_over() {
    let tmp = tempdir().unwrap();
    let lock = InterProcessLock::for_prefix(tmp.path(), Duration::from_secs(2), Duration::from_secs(3600));
    let holder = LockHolder {
        pid: u32::MAX - 1,
        token: "crashed".into(),
        acquired_at: "2020-01-01T00:00:00Z".into(),
    };
    fs::write(lock.path(), serde_json::to_vec(&holder).unwrap()).unwrap();

    let _guard = lock.acquire().unwrap();
    let current = lock.read_holder().unwrap();
    assert_eq!(current.pid, std::process::id());
    assert_ne!(current.token, "crashed");
}

#[test]
fn topics_drain_once() {
    let tmp = tempdir().unwrap();
    let store = Store::create(tmp.path()).unwrap();
    for n in 0..3 {
        store.push_to_topic("rebuild_required", json!({"n": n}));
    }
    let drained = store.pop_topic("rebuild_required");
    assert_eq!(drained, vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
    assert!(store.pop_topic("rebuild_required").is_empty());
}

#[test]
fn store_is_found_from_a_subdirectory() {
    let tmp = tempdir().unwrap();
    Store::create(tmp.path()).unwrap();
    let nested = tmp.path().join("src").join("deep");
    fs::create_dir_all(&nested).unwrap();
    let store = Store::find(&nested).unwrap();
    assert_eq!(store.prefix(), tmp.path().join(".tau"));

    let elsewhere = tempdir().unwrap();
    assert!(matches!(
        Store::find(elsewhere.path()).unwrap_err(),
        TauError::ProjectSelectionError(_)
    ));
}
