//! Inverted index over a [`KvStore`]
//!
//! Writes for one document are a single batch: new term rows, deletes for
//! terms the document no longer has, dictionary and document-count merge
//! operands, and the back row. Index writes are serialized by an internal
//! lock so the back row read and the batch built from it stay consistent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{IndexError, IndexResult};
use crate::mapping::IndexMapping;
use crate::merge::CountMergeOperator;
use crate::query::{Query, SearchHit, SearchRequest, SearchResult};
use crate::rows::{self, BackRow, BackTerm};
use crate::store::{KvIterator, KvReader, KvStore, KvStoreOpener, KvWriter};

pub const META_FILE: &str = "index_meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexMeta {
    format_version: u8,
    store: String,
    mapping: IndexMapping,
}

pub struct SearchIndex<S: KvStore> {
    path: PathBuf,
    mapping: IndexMapping,
    store: S,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl<S: KvStore> SearchIndex<S> {
    /// Create a new index at `path`. Fails if one already exists there.
    pub fn create<O>(path: impl AsRef<Path>, mapping: IndexMapping, opener: O) -> IndexResult<Self>
    where
        O: KvStoreOpener<Store = S>,
    {
        let path = path.as_ref().to_path_buf();
        let meta_path = path.join(META_FILE);
        if meta_path.exists() {
            return Err(IndexError::PathExists(path));
        }
        fs::create_dir_all(&path).map_err(|e| IndexError::io(&path, e))?;

        let store = opener.open(Arc::new(CountMergeOperator))?;
        let writer = store.writer()?;
        let mut batch = writer.new_batch();
        batch.set(rows::VERSION_KEY, vec![rows::FORMAT_VERSION]);
        writer.execute_batch(batch)?;
        writer.close()?;

        let meta = IndexMeta {
            format_version: rows::FORMAT_VERSION,
            store: store.name().to_string(),
            mapping: mapping.clone(),
        };
        write_meta(&meta_path, &meta)?;

        info!(
            path = %path.display(),
            store = store.name(),
            fields = mapping.fields.len(),
            "index created"
        );
        Ok(Self {
            path,
            mapping,
            store,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open an index created earlier at `path`.
    pub fn open<O>(path: impl AsRef<Path>, opener: O) -> IndexResult<Self>
    where
        O: KvStoreOpener<Store = S>,
    {
        let path = path.as_ref().to_path_buf();
        let meta_path = path.join(META_FILE);
        let bytes = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::MetaMissing(path))
            }
            Err(e) => return Err(IndexError::io(&meta_path, e)),
        };
        let meta: IndexMeta = serde_json::from_slice(&bytes)?;
        if meta.format_version != rows::FORMAT_VERSION {
            return Err(IndexError::IncompatibleVersion {
                found: meta.format_version,
                expected: rows::FORMAT_VERSION,
            });
        }

        let store = opener.open(Arc::new(CountMergeOperator))?;
        let reader = store.reader()?;
        let stored = reader.get(rows::VERSION_KEY)?;
        reader.close()?;
        match stored.as_deref() {
            Some([version]) if *version == rows::FORMAT_VERSION => {}
            Some([version]) => {
                return Err(IndexError::IncompatibleVersion {
                    found: *version,
                    expected: rows::FORMAT_VERSION,
                })
            }
            Some(other) => {
                return Err(IndexError::CorruptRow(format!(
                    "version row of {} bytes",
                    other.len()
                )))
            }
            None => {
                let writer = store.writer()?;
                let mut batch = writer.new_batch();
                batch.set(rows::VERSION_KEY, vec![rows::FORMAT_VERSION]);
                writer.execute_batch(batch)?;
                writer.close()?;
            }
        }

        debug!(path = %path.display(), store = store.name(), "index opened");
        Ok(Self {
            path,
            mapping: meta.mapping,
            store,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn check_open(&self) -> IndexResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    /// Index `doc` under `id`, replacing whatever `id` was indexed as before.
    pub fn index(&self, id: &str, doc: &Value) -> IndexResult<()> {
        let mut freqs: BTreeMap<(String, String), u32> = BTreeMap::new();
        for pair in self.mapping.extract(doc) {
            *freqs.entry(pair).or_insert(0) += 1;
        }
        let terms = freqs
            .into_iter()
            .map(|((field, term), freq)| BackTerm { field, term, freq })
            .collect();
        self.apply(id, BackRow { terms })
    }

    /// Remove `id` from the index. Unknown ids are a no-op.
    pub fn delete(&self, id: &str) -> IndexResult<()> {
        self.apply(id, BackRow::default())
    }

    fn apply(&self, id: &str, next: BackRow) -> IndexResult<()> {
        self.check_open()?;
        if id.is_empty() {
            return Err(IndexError::EmptyId);
        }
        let _guard = self.write_lock.lock();

        let back_key = rows::back_key(id);
        let reader = self.store.reader()?;
        let previous = match reader.get(&back_key)? {
            Some(bytes) => Some(BackRow::decode(&bytes)?),
            None => None,
        };
        reader.close()?;

        if previous.is_none() && next.terms.is_empty() {
            return Ok(());
        }
        if previous.as_ref() == Some(&next) {
            return Ok(());
        }

        let old: HashMap<(&str, &str), u32> = previous
            .iter()
            .flat_map(|row| row.terms.iter())
            .map(|t| ((t.field.as_str(), t.term.as_str()), t.freq))
            .collect();
        let new: BTreeSet<(&str, &str)> =
            next.terms.iter().map(|t| (t.field.as_str(), t.term.as_str())).collect();

        let writer = self.store.writer()?;
        let mut batch = writer.new_batch();

        for &(field, term) in old.keys() {
            if !new.contains(&(field, term)) {
                batch.delete(rows::term_key(field, term, id));
                batch.merge(
                    rows::dictionary_key(field, term),
                    CountMergeOperator::encode_delta(-1),
                );
            }
        }
        for t in &next.terms {
            let key = (t.field.as_str(), t.term.as_str());
            match old.get(&key) {
                Some(&freq) if freq == t.freq => {}
                Some(_) => {
                    batch.set(rows::term_key(&t.field, &t.term, id), rows::encode_frequency(t.freq))
                }
                None => {
                    let frequency = rows::encode_frequency(t.freq);
                    batch.set(rows::term_key(&t.field, &t.term, id), frequency);
                    batch.merge(
                        rows::dictionary_key(&t.field, &t.term),
                        CountMergeOperator::encode_delta(1),
                    );
                }
            }
        }

        match (previous.is_some(), next.terms.is_empty()) {
            (_, true) => {
                batch.delete(back_key);
                batch.merge(rows::DOC_COUNT_KEY, CountMergeOperator::encode_delta(-1));
            }
            (false, false) => {
                batch.set(back_key, next.encode()?);
                batch.merge(rows::DOC_COUNT_KEY, CountMergeOperator::encode_delta(1));
            }
            (true, false) => batch.set(back_key, next.encode()?),
        }

        let ops = batch.len();
        writer.execute_batch(batch)?;
        writer.close()?;
        debug!(id, ops, "index rows written");
        Ok(())
    }

    /// Number of indexed documents.
    pub fn doc_count(&self) -> IndexResult<u64> {
        self.check_open()?;
        let reader = self.store.reader()?;
        let count = reader.get(rows::DOC_COUNT_KEY)?;
        reader.close()?;
        Ok(count.as_deref().and_then(CountMergeOperator::decode_count).unwrap_or(0))
    }

    pub fn search(&self, request: &SearchRequest) -> IndexResult<SearchResult> {
        self.check_open()?;
        let started = Instant::now();
        let deadline = request.timeout.map(|timeout| started + timeout);

        let reader = self.store.reader()?;
        let total_docs = reader
            .get(rows::DOC_COUNT_KEY)?
            .as_deref()
            .and_then(CountMergeOperator::decode_count)
            .unwrap_or(0);
        let search = Searcher { reader: &reader, mapping: &self.mapping, deadline, total_docs };
        let scores = search.eval(&request.query)?;
        drop(search);
        reader.close()?;

        let total = scores.len();
        let mut hits: Vec<SearchHit> =
            scores.into_iter().map(|(id, score)| SearchHit { id, score }).collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        let hits = hits.into_iter().skip(request.from).take(request.size).collect();

        Ok(SearchResult { total, hits, took: started.elapsed() })
    }

    pub fn close(&self) -> IndexResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.close()?;
        debug!(path = %self.path.display(), "index closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bytes of the index's private files at `path`, for backups. The rows
    /// themselves live in the store and are backed up with it.
    pub fn snapshot(path: impl AsRef<Path>) -> IndexResult<Vec<u8>> {
        let meta_path = path.as_ref().join(META_FILE);
        fs::read(&meta_path).map_err(|e| IndexError::io(&meta_path, e))
    }

    /// Recreate the private files at `path` from [`SearchIndex::snapshot`] bytes.
    pub fn restore_snapshot(path: impl AsRef<Path>, bytes: &[u8]) -> IndexResult<()> {
        let path = path.as_ref();
        let meta: IndexMeta = serde_json::from_slice(bytes)?;
        fs::create_dir_all(path).map_err(|e| IndexError::io(path, e))?;
        write_meta(&path.join(META_FILE), &meta)
    }
}

fn write_meta(meta_path: &Path, meta: &IndexMeta) -> IndexResult<()> {
    let bytes = serde_json::to_vec_pretty(meta)?;
    let tmp = meta_path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| IndexError::io(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| IndexError::io(&tmp, e))?;
    file.sync_all().map_err(|e| IndexError::io(&tmp, e))?;
    fs::rename(&tmp, meta_path).map_err(|e| IndexError::io(meta_path, e))
}

/// Evaluates one query tree against one reader.
struct Searcher<'r, R: KvReader> {
    reader: &'r R,
    mapping: &'r IndexMapping,
    deadline: Option<Instant>,
    total_docs: u64,
}

type Scores = HashMap<String, f64>;

impl<R: KvReader> Searcher<'_, R> {
    fn check_deadline(&self) -> IndexResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(IndexError::Timeout),
            _ => Ok(()),
        }
    }

    fn eval(&self, query: &Query) -> IndexResult<Scores> {
        self.check_deadline()?;
        match query {
            Query::Term { field, term } => self.term(field, term),
            Query::Match { field, text } => {
                let tokens = self.mapping.analyzer_for(field).analyze(text);
                if tokens.is_empty() {
                    return Ok(Scores::new());
                }
                let parts = tokens
                    .into_iter()
                    .map(|term| Query::Term { field: field.clone(), term })
                    .collect();
                self.eval(&Query::Conjunction(parts))
            }
            Query::Prefix { field, prefix } => self.prefix(field, prefix),
            Query::MatchAll => self.match_all(),
            Query::Conjunction(parts) => {
                let mut iter = parts.iter();
                let mut acc = match iter.next() {
                    Some(first) => self.eval(first)?,
                    None => return Ok(Scores::new()),
                };
                for part in iter {
                    if acc.is_empty() {
                        break;
                    }
                    let next = self.eval(part)?;
                    acc = acc
                        .into_iter()
                        .filter_map(|(id, score)| next.get(&id).map(|other| (id, score + other)))
                        .collect();
                }
                Ok(acc)
            }
            Query::Disjunction(parts) => {
                let mut acc = Scores::new();
                for part in parts {
                    for (id, score) in self.eval(part)? {
                        *acc.entry(id).or_insert(0.0) += score;
                    }
                }
                Ok(acc)
            }
        }
    }

    fn idf(&self, field: &str, term: &str) -> IndexResult<f64> {
        let df = self
            .reader
            .get(&rows::dictionary_key(field, term))?
            .as_deref()
            .and_then(CountMergeOperator::decode_count)
            .unwrap_or(0);
        Ok(1.0 + ((self.total_docs as f64 + 1.0) / (df as f64 + 1.0)).ln())
    }

    fn term(&self, field: &str, term: &str) -> IndexResult<Scores> {
        let idf = self.idf(field, term)?;
        let field_prefix = rows::field_prefix(field);
        let mut scores = Scores::new();
        let mut iter = self.reader.prefix_iterator(&rows::term_postings_prefix(field, term))?;
        while let Some((key, value)) = iter.current()? {
            let (_, id) = rows::parse_term_key(&key, &field_prefix)?;
            let tf = rows::decode_frequency(&value)?;
            scores.insert(id.to_string(), (tf as f64).sqrt() * idf);
            iter.next();
        }
        Ok(scores)
    }

    fn prefix(&self, field: &str, prefix: &str) -> IndexResult<Scores> {
        let field_prefix = rows::field_prefix(field);
        let mut scores = Scores::new();
        let mut iter = self.reader.prefix_iterator(&rows::term_prefix_scan(field, prefix))?;
        let mut scanned = 0usize;
        while let Some((key, value)) = iter.current()? {
            let (_, id) = rows::parse_term_key(&key, &field_prefix)?;
            let tf = rows::decode_frequency(&value)?;
            *scores.entry(id.to_string()).or_insert(0.0) += (tf as f64).sqrt();
            iter.next();
            scanned += 1;
            if scanned % 1024 == 0 {
                self.check_deadline()?;
            }
        }
        Ok(scores)
    }

    fn match_all(&self) -> IndexResult<Scores> {
        let mut scores = Scores::new();
        let mut iter = self.reader.prefix_iterator(rows::back_prefix())?;
        while let Some(key) = iter.key() {
            scores.insert(rows::parse_back_key(key)?.to_string(), 1.0);
            iter.next();
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::memory::{MemoryOpener, MemoryStore};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_index(dir: &TempDir) -> SearchIndex<MemoryStore> {
        let mapping = IndexMapping::new()
            .with_field("email", Analyzer::Keyword)
            .with_field("bio", Analyzer::Standard);
        SearchIndex::create(dir.path().join("idx"), mapping, MemoryOpener).unwrap()
    }

    fn ids(index: &SearchIndex<MemoryStore>, query: Query) -> Vec<String> {
        let result = index.search(&SearchRequest::new(query).with_size(100)).unwrap();
        let mut ids: Vec<String> = result.hits.into_iter().map(|hit| hit.id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_term_query_after_index_and_delete() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        index.index("u1", &json!({"email": "a@b.com"})).unwrap();
        index.index("u2", &json!({"email": "c@d.com"})).unwrap();

        assert_eq!(ids(&index, Query::term("email", "a@b.com")), vec!["u1"]);
        assert_eq!(index.doc_count().unwrap(), 2);

        index.delete("u1").unwrap();
        assert!(ids(&index, Query::term("email", "a@b.com")).is_empty());
        assert_eq!(index.doc_count().unwrap(), 1);
    }

    #[test]
    fn test_reindex_replaces_old_terms() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        index.index("u1", &json!({"email": "old@x"})).unwrap();
        index.index("u1", &json!({"email": "new@x"})).unwrap();

        assert!(ids(&index, Query::term("email", "old@x")).is_empty());
        assert_eq!(ids(&index, Query::term("email", "new@x")), vec!["u1"]);
        assert_eq!(index.doc_count().unwrap(), 1);

        let reader = index.store().reader().unwrap();
        let df = reader.get(&rows::dictionary_key("email", "old@x")).unwrap().unwrap();
        assert_eq!(CountMergeOperator::decode_count(&df), Some(0));
    }

    #[test]
    fn test_match_prefix_and_boolean_queries() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        index.index("1", &json!({"bio": "Rust storage engines", "email": "one@x"})).unwrap();
        index.index("2", &json!({"bio": "storage for photos", "email": "two@x"})).unwrap();
        index.index("3", &json!({"bio": "rusty bikes"})).unwrap();

        assert_eq!(ids(&index, Query::matching("bio", "STORAGE rust")), vec!["1"]);
        assert_eq!(ids(&index, Query::prefix("bio", "rust")), vec!["1", "3"]);
        assert_eq!(ids(&index, Query::MatchAll), vec!["1", "2", "3"]);
        assert_eq!(
            ids(
                &index,
                Query::Disjunction(vec![
                    Query::term("email", "two@x"),
                    Query::matching("bio", "bikes"),
                ])
            ),
            vec!["2", "3"]
        );
        assert!(ids(&index, Query::Conjunction(vec![])).is_empty());
    }

    #[test]
    fn test_hits_ranked_and_paged() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        index.index("a", &json!({"bio": "cat"})).unwrap();
        index.index("b", &json!({"bio": "cat cat cat"})).unwrap();
        index.index("c", &json!({"bio": "cat"})).unwrap();

        let result = index.search(&SearchRequest::new(Query::matching("bio", "cat"))).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.ids(), vec!["b", "a", "c"]);

        let page = index
            .search(&SearchRequest::new(Query::matching("bio", "cat")).with_from(1).with_size(1))
            .unwrap();
        assert_eq!(page.ids(), vec!["a"]);
    }

    #[test]
    fn test_zero_timeout_fails() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        let request = SearchRequest::new(Query::MatchAll).with_timeout(Duration::ZERO);
        assert!(matches!(index.search(&request), Err(IndexError::Timeout)));
    }

    #[test]
    fn test_create_twice_fails_and_open_reads_meta() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        let path = index.path().to_path_buf();

        let again = SearchIndex::create(&path, IndexMapping::new(), MemoryOpener);
        assert!(matches!(again, Err(IndexError::PathExists(_))));

        let reopened = SearchIndex::open(&path, MemoryOpener).unwrap();
        assert_eq!(reopened.mapping(), index.mapping());

        let missing = SearchIndex::open(dir.path().join("nope"), MemoryOpener);
        assert!(matches!(missing, Err(IndexError::MetaMissing(_))));
    }

    #[test]
    fn test_snapshot_restore() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        let bytes = SearchIndex::<MemoryStore>::snapshot(index.path()).unwrap();

        let target = dir.path().join("restored");
        SearchIndex::<MemoryStore>::restore_snapshot(&target, &bytes).unwrap();
        let restored = SearchIndex::open(&target, MemoryOpener).unwrap();
        assert_eq!(restored.mapping(), index.mapping());
    }

    #[test]
    fn test_closed_and_empty_id() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir);
        assert!(matches!(index.index("", &json!({})), Err(IndexError::EmptyId)));
        index.close().unwrap();
        assert!(matches!(index.index("x", &json!({})), Err(IndexError::Closed)));
        assert!(matches!(
            index.search(&SearchRequest::new(Query::MatchAll)),
            Err(IndexError::Closed)
        ));
    }
}
