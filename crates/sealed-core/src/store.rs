//! Document store contract and two backends.
//!
//! The engine only needs hierarchical JSON documents addressed by
//! slash-separated paths:
//!
//! ```text
//! sessions/{runId}
//! sessions/{runId}/commits/{blockId}
//! sessions/{runId}/reveal/{blockId}
//! sessions/{runId}/sealed_envelope/{sealedId}
//! sessions/{runId}/logs/{blockId}-{trial:04}
//! sessions/{runId}/details/{name}
//! ```
//!
//! Every write is a single-document upsert; nothing here is transactional.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// Path builders for the session subtree.
pub mod paths {
    pub const SESSIONS: &str = "sessions";

    pub fn session(run_id: &str) -> String {
        format!("{SESSIONS}/{run_id}")
    }

    pub fn commits(run_id: &str) -> String {
        format!("{SESSIONS}/{run_id}/commits")
    }

    pub fn commit(run_id: &str, block_id: &str) -> String {
        format!("{}/{block_id}", commits(run_id))
    }

    pub fn reveals(run_id: &str) -> String {
        format!("{SESSIONS}/{run_id}/reveal")
    }

    pub fn reveal(run_id: &str, block_id: &str) -> String {
        format!("{}/{block_id}", reveals(run_id))
    }

    pub fn sealed_envelopes(run_id: &str) -> String {
        format!("{SESSIONS}/{run_id}/sealed_envelope")
    }

    pub fn sealed_envelope(run_id: &str, sealed_id: &str) -> String {
        format!("{}/{sealed_id}", sealed_envelopes(run_id))
    }

    pub fn logs(run_id: &str) -> String {
        format!("{SESSIONS}/{run_id}/logs")
    }

    pub fn log(run_id: &str, block_id: &str, trial: u32) -> String {
        format!("{}/{block_id}-{trial:04}", logs(run_id))
    }

    pub fn details(run_id: &str) -> String {
        format!("{SESSIONS}/{run_id}/details")
    }

    pub fn detail(run_id: &str, name: &str) -> String {
        format!("{}/{name}", details(run_id))
    }
}

/// Async key/value + subcollection store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert `doc` under a fresh id in `collection` and return the id.
    async fn create(&self, collection: &str, doc: Value) -> Result<String, StoreError>;

    /// Write `doc` at `path`, replacing whatever was there.
    async fn upsert(&self, path: &str, doc: Value) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Direct child documents of `collection`, sorted by id.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

fn check_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty()
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StoreError::WriteFailed {
            path: path.to_string(),
            message: "invalid document path".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local store used by tests and simulations.
///
/// Writes whose path starts with a prefix registered through
/// [`MemoryStore::fail_on`] are rejected, which lets callers exercise the
/// commit/reveal failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
    fail_prefixes: Mutex<Vec<String>>,
    creates: AtomicUsize,
    create_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `create` call, widening the window for concurrent callers.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn fail_on(&self, prefix: impl Into<String>) {
        if let Ok(mut prefixes) = self.fail_prefixes.lock() {
            prefixes.push(prefix.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut prefixes) = self.fail_prefixes.lock() {
            prefixes.clear();
        }
    }

    /// Number of successful `create` calls.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All paths currently stored, in order.
    pub fn paths(&self) -> Vec<String> {
        self.docs
            .lock()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn check_writable(&self, path: &str) -> Result<(), StoreError> {
        check_path(path)?;
        let prefixes = self.fail_prefixes.lock().map_err(|_| poisoned(path))?;
        if prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(StoreError::WriteFailed {
                path: path.to_string(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

fn poisoned(path: &str) -> StoreError {
    StoreError::WriteFailed {
        path: path.to_string(),
        message: "store lock poisoned".into(),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, collection: &str, doc: Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = format!("{collection}/{id}");
        self.check_writable(&path)?;
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.docs
            .lock()
            .map_err(|_| poisoned(&path))?
            .insert(path, doc);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn upsert(&self, path: &str, doc: Value) -> Result<(), StoreError> {
        self.check_writable(path)?;
        self.docs
            .lock()
            .map_err(|_| poisoned(path))?
            .insert(path.to_string(), doc);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .docs
            .lock()
            .map_err(|_| poisoned(path))?
            .get(path)
            .cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let prefix = format!("{collection}/");
        let docs = self.docs.lock().map_err(|_| poisoned(collection))?;
        Ok(docs
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let id = &k[prefix.len()..];
                (!id.contains('/')).then(|| (id.to_string(), v.clone()))
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per document under a root directory.
///
/// `sessions/abc/commits/b1` is stored at `{root}/sessions/abc/commits/b1.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, path: &str) -> PathBuf {
        let mut file = self.root.join(path);
        file.set_extension("json");
        file
    }

    fn io_err(path: &str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn create(&self, collection: &str, doc: Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.upsert(&format!("{collection}/{id}"), doc).await?;
        Ok(id)
    }

    async fn upsert(&self, path: &str, doc: Value) -> Result<(), StoreError> {
        check_path(path)?;
        let file = self.file_for(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(path, e))?;
        }
        let json = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Encoding {
            path: path.to_string(),
            source,
        })?;
        tokio::fs::write(&file, json)
            .await
            .map_err(|e| Self::io_err(path, e))
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        check_path(path)?;
        let bytes = match tokio::fs::read(self.file_for(path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Encoding {
                path: path.to_string(),
                source,
            })
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        check_path(collection)?;
        let dir = self.root.join(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(collection, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err(collection, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get(&format!("{collection}/{id}")).await? {
                out.push((id, doc));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(paths::session("r1"), "sessions/r1");
        assert_eq!(paths::commit("r1", "b"), "sessions/r1/commits/b");
        assert_eq!(paths::reveal("r1", "b"), "sessions/r1/reveal/b");
        assert_eq!(paths::log("r1", "b", 7), "sessions/r1/logs/b-0007");
        assert_eq!(paths::sealed_envelope("r1", "s"), "sessions/r1/sealed_envelope/s");
        assert_eq!(paths::detail("r1", "summary"), "sessions/r1/details/summary");
    }

    async fn exercise(store: &dyn DocumentStore) {
        let run = store.create(paths::SESSIONS, json!({"n": 1})).await.unwrap();
        store
            .upsert(&paths::log(&run, "b", 2), json!({"trial": 2}))
            .await
            .unwrap();
        store
            .upsert(&paths::log(&run, "b", 1), json!({"trial": 1}))
            .await
            .unwrap();
        store
            .upsert(&paths::log(&run, "b", 1), json!({"trial": 1, "v": 2}))
            .await
            .unwrap();

        let logs = store.list(&paths::logs(&run)).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].0, "b-0001");
        assert_eq!(logs[0].1["v"], 2);

        let sessions = store.list(paths::SESSIONS).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].0, run);

        assert!(store.get("sessions/missing").await.unwrap().is_none());
        assert!(store.upsert("sessions/../x", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store).await;
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn test_file_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        exercise(&store).await;
        assert!(store.list("nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_by_prefix() {
        let store = MemoryStore::new();
        store.fail_on("sessions/r/reveal");
        assert!(store.upsert("sessions/r/reveal/b1", json!({})).await.is_err());
        store.upsert("sessions/r/commits/b1", json!({})).await.unwrap();
        store.clear_failures();
        store.upsert("sessions/r/reveal/b1", json!({})).await.unwrap();
        assert_eq!(store.len(), 2);
    }
}
