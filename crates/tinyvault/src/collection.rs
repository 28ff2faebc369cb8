//! Collections: versioned documents plus their indexes
//!
//! Every write goes through the coordinator as one transaction. When the
//! collection has indexes, the transaction also carries one pending marker
//! per document; the indexes are updated after the commit and the markers
//! cleared once every index has caught up. Markers left behind by a crash
//! are replayed by [`Collection::reconcile_indexes`], which `Db::open` runs.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tinyvault_core::IterOptions;
use tinyvault_index::{IndexMapping, SearchIndex, SearchRequest, SearchResult};
use tracing::{debug, info, warn};

use crate::adapter::EncryptedStore;
use crate::db::{remove_dir, Shared};
use crate::error::{DbError, DbResult};
use crate::index::{AttachedIndex, IndexDescriptor};
use crate::keys;
use crate::registry::CollectionState;
use crate::transaction::Operation;

/// Ids read per page while backfilling or replaying markers.
const SCAN_PAGE: usize = 1000;

/// One version of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub version: u64,
    /// `None` for a deletion
    pub content: Option<Vec<u8>>,
}

/// Handle on one collection. Cheap to clone.
#[derive(Clone)]
pub struct Collection {
    shared: Arc<Shared>,
    state: Arc<CollectionState>,
}

impl Collection {
    pub(crate) fn new(shared: Arc<Shared>, state: Arc<CollectionState>) -> Self {
        Self { shared, state }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Leading key byte of everything stored in this collection.
    pub fn prefix(&self) -> u8 {
        self.state.prefix
    }

    fn check_live(&self) -> DbResult<()> {
        self.shared.check_open()?;
        if self.state.is_dropped() {
            return Err(DbError::CollectionNotFound(self.state.name.clone()));
        }
        Ok(())
    }

    fn doc_key(&self, id: &str) -> Vec<u8> {
        keys::document_key(self.state.prefix, id)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Store `content` as JSON under `id`. Returns the commit version.
    pub fn put<T: Serialize + ?Sized>(&self, id: &str, content: &T) -> DbResult<u64> {
        let bytes = serde_json::to_vec(content)?;
        self.write(vec![(id.to_string(), Some(bytes))])
    }

    /// Store raw bytes. Indexes skip documents that are not JSON.
    pub fn put_bytes(&self, id: &str, content: Vec<u8>) -> DbResult<u64> {
        self.write(vec![(id.to_string(), Some(content))])
    }

    /// Store several documents atomically: if any fails to serialize
    /// nothing is written.
    pub fn put_multi<I, T>(&self, ids: &[I], contents: &[T]) -> DbResult<u64>
    where
        I: AsRef<str>,
        T: Serialize,
    {
        if ids.len() != contents.len() {
            return Err(DbError::PutMultiLength { ids: ids.len(), contents: contents.len() });
        }
        let docs = ids
            .iter()
            .zip(contents)
            .map(|(id, content)| Ok((id.as_ref().to_string(), Some(serde_json::to_vec(content)?))))
            .collect::<DbResult<Vec<_>>>()?;
        self.write(docs)
    }

    /// Tombstone `id`. History stays reachable; deleting an absent id is
    /// not an error.
    pub fn delete(&self, id: &str) -> DbResult<u64> {
        self.write(vec![(id.to_string(), None)])
    }

    fn write(&self, docs: Vec<(String, Option<Vec<u8>>)>) -> DbResult<u64> {
        self.check_live()?;
        if docs.iter().any(|(id, _)| id.is_empty()) {
            return Err(DbError::EmptyId);
        }

        // Held across the commit so an index being attached either sees
        // this write in its backfill or is in the list below
        let registered = self.state.indexes.read();
        let indexes: Vec<Arc<AttachedIndex>> = registered.values().cloned().collect();

        let mut ops = Vec::with_capacity(docs.len() * if indexes.is_empty() { 1 } else { 2 });
        let mut markers = Vec::new();
        let mut ids = Vec::with_capacity(docs.len());
        for (id, payload) in docs {
            let key = self.doc_key(&id);
            ops.push(match payload {
                Some(bytes) => Operation::put(key, bytes),
                None => Operation::delete(key),
            });
            if !indexes.is_empty() {
                let seq = self.shared.next_marker_seq();
                let marker = keys::pending_key(self.state.prefix, &id, seq);
                ops.push(Operation::put(marker.clone(), Vec::new()).with_clean_history());
                markers.push(marker);
            }
            ids.push(id);
        }

        let version = self.shared.submit(ops)?;
        drop(registered);
        debug!(
            collection = %self.state.name,
            documents = ids.len(),
            version,
            "documents committed"
        );

        if !indexes.is_empty() {
            self.sync_indexes(&indexes, &ids)?;
            self.clear_markers(markers)?;
        }
        Ok(version)
    }

    fn sync_indexes(&self, indexes: &[Arc<AttachedIndex>], ids: &[String]) -> DbResult<()> {
        for attached in indexes {
            // Detached since the commit
            if attached.index.is_closed() {
                continue;
            }
            for id in ids {
                attached.sync(id, || self.shared.load(&self.doc_key(id)))?;
            }
        }
        Ok(())
    }

    fn clear_markers(&self, markers: Vec<Vec<u8>>) -> DbResult<()> {
        if markers.is_empty() {
            return Ok(());
        }
        let ops = markers
            .into_iter()
            .map(|key| Operation::delete(key).with_clean_history())
            .collect();
        self.shared.submit(ops)?;
        Ok(())
    }

    /// Replay pending index updates left by writes that committed but never
    /// finished updating their indexes. Returns the number of ids replayed.
    pub fn reconcile_indexes(&self) -> DbResult<usize> {
        self.check_live()?;
        let prefix = keys::pending_prefix(self.state.prefix);
        let indexes = self.state.attached();
        let mut replayed = 0usize;

        loop {
            let markers = {
                let txn = self.shared.read_txn()?;
                let mut iter = txn.iter(IterOptions::default().with_prefix(prefix.clone()));
                iter.rewind();
                let mut markers = Vec::new();
                while let Some(item) = iter.item() {
                    markers.push(item.key().to_vec());
                    if markers.len() == SCAN_PAGE {
                        break;
                    }
                    iter.next();
                }
                markers
            };
            if markers.is_empty() {
                break;
            }

            let mut ids: Vec<String> = markers
                .iter()
                .filter_map(|key| keys::pending_id(key, self.state.prefix).map(str::to_string))
                .collect();
            ids.sort();
            ids.dedup();
            self.sync_indexes(&indexes, &ids)?;
            self.clear_markers(markers)?;
            replayed += ids.len();
        }

        if replayed > 0 {
            debug!(collection = %self.state.name, replayed, "pending index updates replayed");
        }
        Ok(replayed)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Newest content of `id`. Absent and deleted documents are `NotFound`.
    pub fn get(&self, id: &str) -> DbResult<Vec<u8>> {
        self.check_live()?;
        self.shared.load(&self.doc_key(id))?.ok_or_else(|| DbError::NotFound(id.to_string()))
    }

    pub fn get_as<T: DeserializeOwned>(&self, id: &str) -> DbResult<T> {
        Ok(serde_json::from_slice(&self.get(id)?)?)
    }

    /// Several documents from one snapshot, `None` where absent.
    pub fn get_multi<I: AsRef<str>>(&self, ids: &[I]) -> DbResult<Vec<Option<Vec<u8>>>> {
        self.check_live()?;
        let txn = self.shared.read_txn()?;
        ids.iter().map(|id| self.shared.load_in(&txn, &self.doc_key(id.as_ref()))).collect()
    }

    /// Up to `limit` versions of `id`, newest first, deletions included.
    pub fn history(&self, id: &str, limit: usize) -> DbResult<Vec<Revision>> {
        self.check_live()?;
        let key = self.doc_key(id);
        let txn = self.shared.read_txn()?;
        let mut iter = txn.iter(IterOptions::all_versions().with_prefix(key.clone()));
        iter.seek(&key);

        let mut revisions = Vec::new();
        while let Some(item) = iter.item() {
            if item.key() != key.as_slice() || revisions.len() == limit {
                break;
            }
            // A discarded tombstone is what a purge leaves behind
            if item.is_deleted() && item.discard_earlier() {
                break;
            }
            let content = match item.value() {
                Some(sealed) => Some(self.shared.cipher.decrypt(&key, sealed)?),
                None => None,
            };
            revisions.push(Revision { version: item.version(), content });
            iter.next();
        }
        Ok(revisions)
    }

    /// Copy the version `previous + 1` steps back forward as a new version.
    /// `0` restores the version before the current one. Returns the restored
    /// revision and the version it was written at.
    pub fn rollback(&self, id: &str, previous: usize) -> DbResult<(Revision, u64)> {
        let depth = previous.saturating_add(1);
        let revisions = self.history(id, depth.saturating_add(1))?;
        let Some(target) = revisions.get(depth).cloned() else {
            return Err(DbError::VersionNotFound {
                id: id.to_string(),
                requested: previous,
                available: revisions.len().saturating_sub(1),
            });
        };
        let version = self.write(vec![(id.to_string(), target.content.clone())])?;
        info!(
            collection = %self.state.name,
            id,
            from = target.version,
            to = version,
            "document rolled back"
        );
        Ok((target, version))
    }

    /// Ids of live documents from `start` inclusive, in key order.
    pub fn get_ids(&self, start: &str, limit: usize) -> DbResult<Vec<String>> {
        self.check_live()?;
        let txn = self.shared.read_txn()?;
        let prefix = keys::document_prefix(self.state.prefix);
        let mut iter = txn.iter(IterOptions::default().with_prefix(prefix.clone()));
        iter.seek(&self.doc_key(start));

        let mut ids = Vec::new();
        while let Some(item) = iter.item() {
            if ids.len() == limit {
                break;
            }
            if let Some(id) = keys::strip_id(item.key(), &prefix) {
                ids.push(id.to_string());
            }
            iter.next();
        }
        Ok(ids)
    }

    /// Live documents from `start` inclusive, with their content.
    pub fn get_values(&self, start: &str, limit: usize) -> DbResult<Vec<(String, Vec<u8>)>> {
        self.check_live()?;
        let txn = self.shared.read_txn()?;
        let prefix = keys::document_prefix(self.state.prefix);
        let mut iter = txn.iter(IterOptions::default().with_prefix(prefix.clone()));
        iter.seek(&self.doc_key(start));

        let mut values = Vec::new();
        while let Some(item) = iter.item() {
            if values.len() == limit {
                break;
            }
            if let (Some(id), Some(sealed)) = (keys::strip_id(item.key(), &prefix), item.value()) {
                values.push((id.to_string(), self.shared.cipher.decrypt(item.key(), sealed)?));
            }
            iter.next();
        }
        Ok(values)
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Attach index `name` and index every live document into it. On failure
    /// nothing of the index is left behind.
    pub fn set_index(&self, name: &str, mapping: IndexMapping) -> DbResult<()> {
        self.check_live()?;
        let _attach = self.shared.attach_lock.lock();
        let prefix = keys::index_prefix(self.state.prefix, keys::index_hash(name));
        {
            let indexes = self.state.indexes.read();
            if indexes.contains_key(name) {
                return Err(DbError::IndexNameExists {
                    collection: self.state.name.clone(),
                    name: name.to_string(),
                });
            }
            let clash = indexes.values().find(|index| index.descriptor.prefix == prefix);
            if let Some(existing) = clash {
                return Err(DbError::HashCollision {
                    name: name.to_string(),
                    existing: existing.name().to_string(),
                    prefix,
                });
            }
        }

        let dir = self.shared.index_dir(&prefix);
        // Leftovers of an attach that never completed
        remove_dir(&dir);
        self.shared.purge_prefix(&prefix)?;

        let attached = match self.create_index(name, &prefix, mapping) {
            Ok(attached) => Arc::new(attached),
            Err(e) => {
                self.discard_index(&dir, &prefix);
                return Err(e);
            }
        };
        self.state.indexes.write().insert(name.to_string(), Arc::clone(&attached));

        match self.backfill(&attached).and_then(|count| self.shared.persist().map(|()| count)) {
            Ok(count) => {
                info!(
                    collection = %self.state.name,
                    index = name,
                    documents = count,
                    "index attached"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    collection = %self.state.name,
                    index = name,
                    error = %e,
                    "index attach failed"
                );
                self.state.indexes.write().remove(name);
                if let Err(close) = attached.index.close() {
                    warn!(index = name, error = %close, "index close failed");
                }
                self.discard_index(&dir, &prefix);
                Err(e)
            }
        }
    }

    fn create_index(
        &self,
        name: &str,
        prefix: &[u8],
        mapping: IndexMapping,
    ) -> DbResult<AttachedIndex> {
        let dir = self.shared.index_dir(prefix);
        let store = self.shared.store_config(prefix.to_vec());
        let index = SearchIndex::create(&dir, mapping.clone(), store)?;
        let snapshot = SearchIndex::<EncryptedStore>::snapshot(&dir)?;
        let descriptor =
            IndexDescriptor { name: name.to_string(), prefix: prefix.to_vec(), mapping, snapshot };
        Ok(AttachedIndex::new(descriptor, index))
    }

    fn index_not_found(&self, name: &str) -> DbError {
        DbError::IndexNotFound { collection: self.state.name.clone(), name: name.to_string() }
    }

    fn discard_index(&self, dir: &std::path::Path, prefix: &[u8]) {
        remove_dir(dir);
        if let Err(e) = self.shared.purge_prefix(prefix) {
            warn!(prefix = ?prefix, error = %e, "index rows left behind");
        }
    }

    fn backfill(&self, attached: &AttachedIndex) -> DbResult<usize> {
        let mut start = String::new();
        let mut count = 0usize;
        loop {
            let ids = self.get_ids(&start, SCAN_PAGE)?;
            for id in &ids {
                attached.sync(id, || self.shared.load(&self.doc_key(id)))?;
            }
            count += ids.len();
            match ids.last() {
                Some(last) if ids.len() == SCAN_PAGE => {
                    // Smallest id after `last`
                    start = format!("{last}\u{0}");
                }
                _ => break,
            }
        }
        Ok(count)
    }

    /// Detach index `name` and purge its rows.
    pub fn delete_index(&self, name: &str) -> DbResult<()> {
        self.check_live()?;
        let _attach = self.shared.attach_lock.lock();
        let attached = self
            .state
            .indexes
            .write()
            .remove(name)
            .ok_or_else(|| self.index_not_found(name))?;

        if let Err(e) = attached.index.close() {
            warn!(collection = %self.state.name, index = name, error = %e, "index close failed");
        }
        remove_dir(&self.shared.index_dir(&attached.descriptor.prefix));
        self.shared.persist()?;
        let purged = self.shared.purge_prefix(&attached.descriptor.prefix)?;
        info!(collection = %self.state.name, index = name, rows = purged, "index deleted");
        Ok(())
    }

    /// Run `request` against index `name`. Without a timeout of its own the
    /// request gets the configured query timeout.
    pub fn search(&self, name: &str, request: SearchRequest) -> DbResult<SearchResult> {
        self.check_live()?;
        let attached = self
            .state
            .indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| self.index_not_found(name))?;
        let request = match request.timeout {
            Some(_) => request,
            None => request.with_timeout(self.shared.config.query_timeout),
        };
        Ok(attached.index.search(&request)?)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.indexes.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.state.name)
            .field("prefix", &self.state.prefix)
            .field("indexes", &self.index_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::keys;
    use crate::transaction::Operation;
    use crate::{Analyzer, Db, DbConfig, DbError, IndexMapping, Query, SearchRequest};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_db() -> (Db, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = DbConfig::default().with_history_retention(3);
        let db = Db::open_with_config(dir.path(), &[3u8; 32], config).unwrap();
        (db, dir)
    }

    fn email_index() -> IndexMapping {
        IndexMapping::new().with_field("email", Analyzer::Keyword)
    }

    #[test]
    fn test_put_get_delete() {
        let (db, _dir) = test_db();
        let users = db.use_collection("users").unwrap();

        users.put("u1", &json!({"name": "ada"})).unwrap();
        let doc: serde_json::Value = users.get_as("u1").unwrap();
        assert_eq!(doc["name"], "ada");

        users.delete("u1").unwrap();
        assert!(users.get("u1").unwrap_err().is_not_found());
        users.delete("u1").unwrap();
        assert!(matches!(users.put_bytes("", vec![1]), Err(DbError::EmptyId)));
    }

    #[test]
    fn test_history_and_rollback() {
        let (db, _dir) = test_db();
        let docs = db.use_collection("docs").unwrap();
        for content in ["a", "b", "c"] {
            docs.put_bytes("d", content.as_bytes().to_vec()).unwrap();
        }

        let history = docs.history("d", 10).unwrap();
        let contents: Vec<_> = history.iter().map(|rev| rev.content.clone().unwrap()).collect();
        assert_eq!(contents, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        assert!(history.windows(2).all(|w| w[0].version > w[1].version));

        let (restored, version) = docs.rollback("d", 0).unwrap();
        assert_eq!(restored.content.as_deref(), Some(&b"b"[..]));
        assert_eq!(docs.get("d").unwrap(), b"b");
        assert_eq!(docs.history("d", 1).unwrap()[0].version, version);

        // Four versions now: b, c, b, a
        assert_eq!(docs.rollback("d", 2).unwrap().0.content.as_deref(), Some(&b"a"[..]));
        assert!(matches!(
            docs.rollback("d", 3),
            Err(DbError::VersionNotFound { requested: 3, .. })
        ));
    }

    #[test]
    fn test_history_bounded_by_retention() {
        let (db, _dir) = test_db();
        let docs = db.use_collection("docs").unwrap();
        for i in 0..8u8 {
            docs.put_bytes("d", vec![i]).unwrap();
        }
        // Retention 3 plus the current version
        assert_eq!(docs.history("d", 100).unwrap().len(), 4);
        assert_eq!(docs.rollback("d", 2).unwrap().0.content, Some(vec![4]));
        assert!(docs.rollback("d", 3).is_err());
    }

    #[test]
    fn test_rollback_to_deletion() {
        let (db, _dir) = test_db();
        let docs = db.use_collection("docs").unwrap();
        docs.delete("d").unwrap();
        docs.put_bytes("d", b"x".to_vec()).unwrap();
        let (restored, _) = docs.rollback("d", 0).unwrap();
        assert_eq!(restored.content, None);
        assert!(docs.get("d").unwrap_err().is_not_found());
    }

    #[test]
    fn test_listing_skips_deleted() {
        let (db, _dir) = test_db();
        let items = db.use_collection("items").unwrap();
        for id in ["a", "b", "c", "d"] {
            items.put_bytes(id, id.as_bytes().to_vec()).unwrap();
        }
        items.delete("b").unwrap();

        assert_eq!(items.get_ids("", 10).unwrap(), vec!["a", "c", "d"]);
        assert_eq!(items.get_ids("b", 2).unwrap(), vec!["c", "d"]);
        let values = items.get_values("c", 10).unwrap();
        assert_eq!(
            values,
            vec![("c".to_string(), b"c".to_vec()), ("d".to_string(), b"d".to_vec())]
        );

        let multi = items.get_multi(&["a", "b"]).unwrap();
        assert_eq!(multi, vec![Some(b"a".to_vec()), None]);
    }

    #[test]
    fn test_put_multi_length_mismatch() {
        let (db, _dir) = test_db();
        let items = db.use_collection("items").unwrap();
        let err = items.put_multi(&["a", "b"], &[json!(1)]).unwrap_err();
        assert!(matches!(err, DbError::PutMultiLength { ids: 2, contents: 1 }));
    }

    #[test]
    fn test_index_backfill_and_search() {
        let (db, _dir) = test_db();
        let users = db.use_collection("users").unwrap();
        users.put("u1", &json!({"email": "a@b.com"})).unwrap();
        users.put("u2", &json!({"email": "c@d.com"})).unwrap();
        users.put_bytes("raw", b"not json".to_vec()).unwrap();

        users.set_index("email", email_index()).unwrap();
        assert_eq!(users.index_names(), vec!["email"]);

        let by_email = |email: &str| SearchRequest::new(Query::term("email", email));
        let hits = users.search("email", by_email("c@d.com")).unwrap();
        assert_eq!(hits.ids(), vec!["u2"]);

        users.put("u2", &json!({"email": "e@f.com"})).unwrap();
        let stale = users.search("email", by_email("c@d.com")).unwrap();
        assert_eq!(stale.total, 0);
        let all = users.search("email", SearchRequest::new(Query::MatchAll)).unwrap();
        assert_eq!(all.total, 2);
    }

    #[test]
    fn test_index_name_conflicts() {
        let (db, _dir) = test_db();
        let users = db.use_collection("users").unwrap();
        users.set_index("email", email_index()).unwrap();
        assert!(matches!(
            users.set_index("email", email_index()),
            Err(DbError::IndexNameExists { .. })
        ));
        assert!(matches!(users.delete_index("missing"), Err(DbError::IndexNotFound { .. })));
        assert!(matches!(
            users.search("missing", SearchRequest::new(Query::MatchAll)),
            Err(DbError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn test_delete_index_purges_rows() {
        let (db, _dir) = test_db();
        let users = db.use_collection("users").unwrap();
        users.put("u1", &json!({"email": "a@b.com"})).unwrap();
        users.set_index("email", email_index()).unwrap();
        users.delete_index("email").unwrap();
        assert!(users.index_names().is_empty());

        // Re-attaching starts from a clean prefix
        users.set_index("email", email_index()).unwrap();
        let hits = users.search("email", SearchRequest::new(Query::MatchAll)).unwrap();
        assert_eq!(hits.ids(), vec!["u1"]);
    }

    #[test]
    fn test_writes_leave_no_pending_markers() {
        let (db, _dir) = test_db();
        let users = db.use_collection("users").unwrap();
        users.set_index("email", email_index()).unwrap();
        users.put_multi(&["a", "b"], &[json!({"email": "x"}), json!({"email": "y"})]).unwrap();
        assert_eq!(users.reconcile_indexes().unwrap(), 0);
    }

    #[test]
    fn test_leftover_markers_replayed() {
        let (db, dir) = test_db();
        let users = db.use_collection("users").unwrap();
        users.set_index("email", email_index()).unwrap();

        // A document and its marker committed, the index never updated
        let doc = serde_json::to_vec(&json!({"email": "z@z"})).unwrap();
        db.shared
            .submit(vec![
                Operation::put(keys::document_key(users.prefix(), "u9"), doc),
                Operation::put(keys::pending_key(users.prefix(), "u9", 77), Vec::new())
                    .with_clean_history(),
            ])
            .unwrap();
        let query = || SearchRequest::new(Query::term("email", "z@z"));
        assert_eq!(users.search("email", query()).unwrap().total, 0);

        db.close().unwrap();
        drop((users, db));
        let config = DbConfig::default().with_history_retention(3);
        let db = Db::open_with_config(dir.path(), &[3u8; 32], config).unwrap();
        let users = db.use_collection("users").unwrap();
        assert_eq!(users.search("email", query()).unwrap().ids(), vec!["u9"]);
        assert_eq!(users.reconcile_indexes().unwrap(), 0);
    }
}
