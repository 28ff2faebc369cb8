//! Integration tests: documents, indexes and files through the public `Db` API.
//!
//! Each test opens a database in its own temp directory; reopen tests close
//! it and open the same directory again.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use serde::ser::{Error as _, Serializer};
use serde::Serialize;
use serde_json::json;
use tempfile::TempDir;

use tinyvault::{Analyzer, Db, DbConfig, DbError, IndexMapping, Query, SearchRequest};

const KEY: [u8; 32] = [0x42; 32];

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> DbConfig {
    DbConfig::default().with_sync_writes(false).with_history_retention(5)
}

fn test_db() -> (Db, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Db::open_with_config(dir.path(), &KEY, test_config()).unwrap();
    (db, dir)
}

fn reopen(db: Db, dir: &TempDir) -> Db {
    db.close().unwrap();
    drop(db);
    Db::open_with_config(dir.path(), &KEY, test_config()).unwrap()
}

fn email_mapping() -> IndexMapping {
    IndexMapping::new().with_field("email", Analyzer::Keyword)
}

fn email_query(email: &str) -> SearchRequest {
    SearchRequest::new(Query::term("email", email))
}

/// Serializes fine or fails on demand.
enum Doc {
    Good(serde_json::Value),
    Broken,
}

impl Serialize for Doc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Doc::Good(value) => value.serialize(serializer),
            Doc::Broken => Err(S::Error::custom("refusing to serialize")),
        }
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[test]
fn test_email_index_put_query_delete() {
    let (db, _dir) = test_db();
    let users = db.use_collection("users").unwrap();

    users.put("u1", &json!({"email": "a@b.com"})).unwrap();
    users.set_index("email", email_mapping()).unwrap();

    let hits = users.search("email", email_query("a@b.com")).unwrap();
    assert_eq!(hits.total, 1);
    assert_eq!(hits.ids(), vec!["u1"]);

    users.delete("u1").unwrap();
    let hits = users.search("email", email_query("a@b.com")).unwrap();
    assert_eq!(hits.total, 0);
}

#[test]
fn test_put_multi_rejected_when_one_item_fails() {
    let (db, _dir) = test_db();
    let items = db.use_collection("items").unwrap();

    let err = items.put_multi(&["a", "b"], &[Doc::Good(json!({"x": 1})), Doc::Broken]).unwrap_err();
    assert!(matches!(err, DbError::Serialization(_)));
    assert!(items.get("a").unwrap_err().is_not_found());
    assert!(items.get("b").unwrap_err().is_not_found());
}

#[test]
fn test_put_multi_all_or_nothing_on_success() {
    let (db, _dir) = test_db();
    let items = db.use_collection("items").unwrap();
    let version = items.put_multi(&["a", "b", "c"], &[json!(1), json!(2), json!(3)]).unwrap();

    let values = items.get_multi(&["a", "b", "c"]).unwrap();
    assert!(values.iter().all(Option::is_some));
    // One transaction, one version
    for id in ["a", "b", "c"] {
        assert_eq!(items.history(id, 1).unwrap()[0].version, version);
    }
}

#[test]
fn test_rollback_depth_bounded_by_retention() {
    let (db, _dir) = test_db();
    let docs = db.use_collection("docs").unwrap();

    // Retention 5: rollback 0..=4 reach back, 5 does not. Every rollback
    // writes a new version, so each depth gets its own document.
    for k in 0..6usize {
        let id = format!("d{k}");
        for rev in 0..10u64 {
            docs.put(&id, &json!({ "rev": rev })).unwrap();
        }
        if k == 5 {
            assert!(matches!(
                docs.rollback(&id, k),
                Err(DbError::VersionNotFound { requested: 5, .. })
            ));
            continue;
        }
        let (restored, _) = docs.rollback(&id, k).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&restored.content.unwrap()).unwrap();
        assert_eq!(value["rev"], json!(9 - (k as u64 + 1)));
        let current: serde_json::Value = docs.get_as(&id).unwrap();
        assert_eq!(current, value);
    }
}

#[test]
fn test_rollback_exact_content() {
    let (db, _dir) = test_db();
    let docs = db.use_collection("docs").unwrap();
    for content in ["v1", "v2", "v3", "v4"] {
        docs.put_bytes("d", content.as_bytes().to_vec()).unwrap();
    }
    assert_eq!(docs.rollback("d", 2).unwrap().0.content.unwrap(), b"v1");
    assert_eq!(docs.get("d").unwrap(), b"v1");
}

#[test]
fn test_concurrent_puts_serialize() {
    let (db, _dir) = test_db();
    let docs = Arc::new(db.use_collection("docs").unwrap());

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|content| {
            let docs = Arc::clone(&docs);
            thread::spawn(move || docs.put_bytes("id", content.as_bytes().to_vec()).unwrap())
        })
        .collect();
    let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), 3);

    let history = docs.history("id", 3).unwrap();
    let mut seen: Vec<Vec<u8>> = history.iter().map(|rev| rev.content.clone().unwrap()).collect();
    let second = seen[1].clone();
    let newest_first: Vec<u64> = versions.iter().rev().copied().collect();
    assert_eq!(history.iter().map(|rev| rev.version).collect::<Vec<_>>(), newest_first);
    seen.sort();
    assert_eq!(seen, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);

    assert_eq!(docs.rollback("id", 0).unwrap().0.content.unwrap(), second);
}

#[test]
fn test_concurrent_indexed_writes_converge() {
    let (db, _dir) = test_db();
    let users = Arc::new(db.use_collection("users").unwrap());
    users.set_index("email", email_mapping()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let users = Arc::clone(&users);
            thread::spawn(move || {
                for round in 0..5 {
                    let email = format!("user{t}-{round}@x");
                    users.put(&format!("u{t}"), &json!({ "email": email })).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let all = users.search("email", SearchRequest::new(Query::MatchAll).with_size(100)).unwrap();
    assert_eq!(all.total, 4);
    for t in 0..4 {
        let hits = users.search("email", email_query(&format!("user{t}-4@x"))).unwrap();
        assert_eq!(hits.ids(), vec![format!("u{t}").as_str()]);
        let stale = users.search("email", email_query(&format!("user{t}-3@x"))).unwrap();
        assert_eq!(stale.total, 0);
    }
}

#[test]
fn test_search_paging_and_prefix() {
    let (db, _dir) = test_db();
    let users = db.use_collection("users").unwrap();
    users.set_index("email", email_mapping()).unwrap();
    for i in 0..15 {
        users.put(&format!("u{i:02}"), &json!({ "email": format!("person{i}@corp") })).unwrap();
    }

    let request = SearchRequest::new(Query::prefix("email", "person1")).with_size(3).with_from(2);
    let page = users.search("email", request).unwrap();
    // person1, person10..person14
    assert_eq!(page.total, 6);
    assert_eq!(page.hits.len(), 3);

    let timed = SearchRequest::new(Query::MatchAll).with_timeout(Duration::from_secs(5));
    assert_eq!(users.search("email", timed).unwrap().total, 15);
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[test]
fn test_large_file_five_chunks() {
    const MB: usize = 1024 * 1024;
    let dir = TempDir::new().unwrap();
    let config = test_config().with_file_chunk_size(5 * MB);
    let db = Db::open_with_config(dir.path(), &KEY, config).unwrap();

    let data: Vec<u8> = (0..23 * MB).map(|i| (i * 7 % 256) as u8).collect();
    let meta = db.put_file("video", "video.bin", data.as_slice()).unwrap();
    assert_eq!(meta.chunk_count(), 5);
    assert_eq!(meta.size, (23 * MB) as u64);

    let mut out = Vec::with_capacity(data.len());
    db.read_file("video", &mut out).unwrap();
    assert!(out == data);
}

#[test]
fn test_chunk_boundary_lengths() {
    let chunk = 64usize;
    let dir = TempDir::new().unwrap();
    let config = test_config().with_file_chunk_size(chunk);
    let db = Db::open_with_config(dir.path(), &KEY, config).unwrap();

    for len in [0, 1, chunk - 1, chunk, chunk + 1, 5 * chunk] {
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let id = format!("file-{len}");
        db.put_file(&id, "blob", data.as_slice()).unwrap();

        let mut out = Vec::new();
        assert_eq!(db.read_file(&id, &mut out).unwrap(), len as u64);
        assert_eq!(out, data, "length {len}");
    }
}

#[test]
fn test_file_writer_is_exclusive() {
    let (db, _dir) = test_db();
    let mut writer = db.file_writer("doc", "doc.txt").unwrap();
    std::io::Write::write_all(&mut writer, b"hello").unwrap();

    assert!(matches!(db.file_writer("doc", "doc.txt"), Err(DbError::FileInWrite(_))));
    let meta = writer.close().unwrap();
    assert_eq!(meta.size, 5);
    assert!(!meta.in_write);
    assert!(db.file_writer("doc", "doc.txt").is_ok());
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_everything_survives_reopen() {
    let (db, dir) = test_db();
    let users = db.use_collection("users").unwrap();
    users.put("u1", &json!({"email": "a@b.com"})).unwrap();
    users.put("u1", &json!({"email": "new@b.com"})).unwrap();
    users.set_index("email", email_mapping()).unwrap();
    db.put_file("f", "f.bin", &b"file body"[..]).unwrap();
    drop(users);

    let db = reopen(db, &dir);
    let users = db.use_collection("users").unwrap();
    assert_eq!(users.index_names(), vec!["email"]);
    assert_eq!(users.history("u1", 10).unwrap().len(), 2);
    assert_eq!(users.search("email", email_query("new@b.com")).unwrap().ids(), vec!["u1"]);

    let mut out = Vec::new();
    db.read_file("f", &mut out).unwrap();
    assert_eq!(out, b"file body");

    // Index keeps working after reopen
    users.delete("u1").unwrap();
    assert_eq!(users.search("email", email_query("new@b.com")).unwrap().total, 0);
}

#[test]
fn test_wrong_key_rejected() {
    let (db, dir) = test_db();
    db.use_collection("users").unwrap();
    db.close().unwrap();
    drop(db);

    let err = Db::open_with_config(dir.path(), &[0u8; 32], test_config()).unwrap_err();
    assert!(matches!(err, DbError::Decryption { .. }));
}

#[test]
fn test_backup_and_load() {
    let (source, _source_dir) = test_db();
    let users = source.use_collection("users").unwrap();
    users.put("u1", &json!({"email": "a@b.com"})).unwrap();
    users.set_index("email", email_mapping()).unwrap();
    source.put_file("f", "f.bin", &b"payload"[..]).unwrap();

    let mut backup = Vec::new();
    let since = source.backup(&mut backup, 0).unwrap();
    assert!(since > 0);

    let (target, _target_dir) = test_db();
    let target = target.load(backup.as_slice()).unwrap();

    let users = target.use_collection("users").unwrap();
    assert_eq!(users.get_as::<serde_json::Value>("u1").unwrap()["email"], "a@b.com");
    assert_eq!(users.search("email", email_query("a@b.com")).unwrap().ids(), vec!["u1"]);
    let mut out = Vec::new();
    target.read_file("f", &mut out).unwrap();
    assert_eq!(out, b"payload");

    // Incremental: nothing new since the first backup
    let mut empty = Vec::new();
    assert_eq!(source.backup(&mut empty, since).unwrap(), since);
}

#[test]
fn test_deleted_collection_is_gone_after_reopen() {
    let (db, dir) = test_db();
    let tmp = db.use_collection("tmp").unwrap();
    tmp.put_bytes("x", b"1".to_vec()).unwrap();
    tmp.set_index("email", email_mapping()).unwrap();
    db.delete_collection("tmp").unwrap();
    drop(tmp);

    let db = reopen(db, &dir);
    assert!(db.collection_names().is_empty());
    let again = db.use_collection("tmp").unwrap();
    assert!(again.get("x").unwrap_err().is_not_found());
    assert!(again.index_names().is_empty());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_put_get_roundtrip(
        docs in proptest::collection::vec(
            ("[a-z]{1,8}", proptest::collection::vec(any::<u8>(), 0..256)),
            1..10,
        )
    ) {
        let (db, _dir) = test_db();
        let items = db.use_collection("items").unwrap();
        let mut expected = std::collections::BTreeMap::new();
        for (id, content) in docs {
            items.put_bytes(&id, content.clone()).unwrap();
            expected.insert(id, content);
        }
        for (id, content) in &expected {
            prop_assert_eq!(&items.get(id).unwrap(), content);
        }
        let ids: Vec<String> = expected.keys().cloned().collect();
        prop_assert_eq!(items.get_ids("", 100).unwrap(), ids);
    }
}
