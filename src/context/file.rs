use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{ContextScope, ContextStore};
use crate::error::{Result, RuntimeError};

const FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl PersistedEntry {
    fn expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| Utc::now().timestamp_millis() >= at)
    }
}

type ScopeKey = (ContextScope, String);

struct Inner {
    base_dir: PathBuf,
    scopes: RwLock<HashMap<ScopeKey, HashMap<String, PersistedEntry>>>,
    dirty: Mutex<HashSet<ScopeKey>>,
}

/// Filesystem backend: one JSON file per `(scope, scope_id)` pair.
///
/// Writes mark the scope dirty; a background flusher writes dirty scopes
/// every ~100 ms so bursts coalesce into one file write. `close()` flushes
/// everything synchronously and stops the flusher.
pub struct FileContextStore {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl FileContextStore {
    pub fn new(base_dir: PathBuf) -> Self {
        let inner = Arc::new(Inner {
            base_dir,
            scopes: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        });
        let shutdown = CancellationToken::new();

        let flusher_inner = inner.clone();
        let flusher_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_DEBOUNCE);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = flusher_inner.flush_dirty().await {
                            tracing::warn!(error = %e, "context flush failed");
                        }
                    }
                    _ = flusher_shutdown.cancelled() => return,
                }
            }
        });

        FileContextStore { inner, shutdown }
    }

    /// Load every `*.json` under the base directory. Files that fail to
    /// parse are logged and skipped, never overwritten on read failure.
    pub async fn load(&self) -> Result<()> {
        std::fs::create_dir_all(&self.inner.base_dir)?;

        let mut loaded: HashMap<ScopeKey, HashMap<String, PersistedEntry>> = HashMap::new();
        for entry in std::fs::read_dir(&self.inner.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(scope_key) = parse_file_stem(stem) else {
                tracing::warn!(path = %path.display(), "skipping context file with unrecognized name");
                continue;
            };

            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<HashMap<String, PersistedEntry>>(&content) {
                Ok(mut entries) => {
                    entries.retain(|_, e| !e.expired());
                    loaded.insert(scope_key, entries);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid context file");
                }
            }
        }

        let count = loaded.len();
        *self.inner.scopes.write().await = loaded;
        tracing::debug!(scopes = count, "loaded context scopes");
        Ok(())
    }

    async fn mark_dirty(&self, scope: ContextScope, scope_id: &str) {
        self.inner
            .dirty
            .lock()
            .await
            .insert((scope, scope_id.to_string()));
    }
}

impl Inner {
    fn scope_file(&self, scope: ContextScope, scope_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}_{}.json", scope.as_str(), scope_id))
    }

    async fn flush_dirty(&self) -> Result<()> {
        let to_flush: Vec<ScopeKey> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain().collect()
        };
        if to_flush.is_empty() {
            return Ok(());
        }

        let scopes = self.scopes.read().await;
        for key in to_flush {
            let path = self.scope_file(key.0, &key.1);
            match scopes.get(&key) {
                Some(entries) if !entries.is_empty() => {
                    write_atomic(&path, entries)?;
                }
                _ => {
                    if path.exists() {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_file_stem(stem: &str) -> Option<ScopeKey> {
    let (scope, scope_id) = stem.split_once('_')?;
    let scope = match scope {
        "node" => ContextScope::Node,
        "flow" => ContextScope::Flow,
        "global" => ContextScope::Global,
        _ => return None,
    };
    Some((scope, scope_id.to_string()))
}

fn write_atomic(path: &PathBuf, entries: &HashMap<String, PersistedEntry>) -> Result<()> {
    let content = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn get(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<Value> {
        let scopes = self.inner.scopes.read().await;
        scopes
            .get(&(scope, scope_id.to_string()))
            .and_then(|m| m.get(key))
            .filter(|e| !e.expired())
            .map(|e| e.value.clone())
            .ok_or_else(|| RuntimeError::not_found("context key", key))
    }

    async fn set(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        {
            let mut scopes = self.inner.scopes.write().await;
            scopes
                .entry((scope, scope_id.to_string()))
                .or_default()
                .insert(
                    key.to_string(),
                    PersistedEntry {
                        value,
                        expires_at: ttl
                            .map(|t| Utc::now().timestamp_millis() + t.as_millis() as i64),
                    },
                );
        }
        self.mark_dirty(scope, scope_id).await;
        Ok(())
    }

    async fn delete(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<()> {
        {
            let mut scopes = self.inner.scopes.write().await;
            if let Some(m) = scopes.get_mut(&(scope, scope_id.to_string())) {
                m.remove(key);
            }
        }
        self.mark_dirty(scope, scope_id).await;
        Ok(())
    }

    async fn clear(&self, scope: ContextScope, scope_id: &str) -> Result<()> {
        self.inner
            .scopes
            .write()
            .await
            .remove(&(scope, scope_id.to_string()));
        self.mark_dirty(scope, scope_id).await;
        Ok(())
    }

    async fn keys(&self, scope: ContextScope, scope_id: &str) -> Result<Vec<String>> {
        let scopes = self.inner.scopes.read().await;
        Ok(scopes
            .get(&(scope, scope_id.to_string()))
            .map(|m| {
                m.iter()
                    .filter(|(_, e)| !e.expired())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<bool> {
        let scopes = self.inner.scopes.read().await;
        Ok(scopes
            .get(&(scope, scope_id.to_string()))
            .and_then(|m| m.get(key))
            .is_some_and(|e| !e.expired()))
    }

    async fn increment(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64> {
        let next = {
            let mut scopes = self.inner.scopes.write().await;
            let entries = scopes.entry((scope, scope_id.to_string())).or_default();
            let current = match entries.get(key).filter(|e| !e.expired()) {
                Some(e) => e.value.as_i64().ok_or_else(|| {
                    RuntimeError::Resource(format!("context key {key} is not numeric"))
                })?,
                None => 0,
            };
            let next = current + delta;
            entries.insert(
                key.to_string(),
                PersistedEntry {
                    value: Value::from(next),
                    expires_at: None,
                },
            );
            next
        };
        self.mark_dirty(scope, scope_id).await;
        Ok(next)
    }

    async fn ttl(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
    ) -> Result<Option<Duration>> {
        let scopes = self.inner.scopes.read().await;
        let entry = scopes
            .get(&(scope, scope_id.to_string()))
            .and_then(|m| m.get(key))
            .filter(|e| !e.expired())
            .ok_or_else(|| RuntimeError::not_found("context key", key))?;
        Ok(entry.expires_at.map(|at| {
            let remaining = at - Utc::now().timestamp_millis();
            Duration::from_millis(remaining.max(0) as u64)
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        // Everything in memory counts as dirty on close; flush it all.
        {
            let scopes = self.inner.scopes.read().await;
            let mut dirty = self.inner.dirty.lock().await;
            dirty.extend(scopes.keys().cloned());
        }
        self.inner.flush_dirty().await
    }
}

impl Drop for FileContextStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_get_before_any_flush() {
        let dir = tempdir().unwrap();
        let store = FileContextStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();

        store
            .set(ContextScope::Flow, "f1", "counter", json!(1), None)
            .await
            .unwrap();
        let v = store.get(ContextScope::Flow, "f1", "counter").await.unwrap();
        assert_eq!(v, json!(1));
    }

    #[tokio::test]
    async fn test_close_persists_across_restart() {
        let dir = tempdir().unwrap();
        let store = FileContextStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();
        store
            .set(ContextScope::Flow, "F", "counter", json!(1), None)
            .await
            .unwrap();
        store.close().await.unwrap();
        drop(store);

        let store2 = FileContextStore::new(dir.path().to_path_buf());
        store2.load().await.unwrap();
        let v = store2.get(ContextScope::Flow, "F", "counter").await.unwrap();
        assert_eq!(v, json!(1));
    }

    #[tokio::test]
    async fn test_debounced_flush_writes_file() {
        let dir = tempdir().unwrap();
        let store = FileContextStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();

        store
            .set(ContextScope::Global, "global", "k", json!("v"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(dir.path().join("global_global.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_skipped_on_load() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("flow_bad.json"), "{not json").unwrap();
        std::fs::write(
            dir.path().join("flow_good.json"),
            serde_json::to_string(&HashMap::from([(
                "k".to_string(),
                PersistedEntry {
                    value: json!(7),
                    expires_at: None,
                },
            )]))
            .unwrap(),
        )
        .unwrap();

        let store = FileContextStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();

        assert_eq!(
            store.get(ContextScope::Flow, "good", "k").await.unwrap(),
            json!(7)
        );
        assert!(store.get(ContextScope::Flow, "bad", "k").await.is_err());
        // The corrupt file is left in place, not overwritten.
        assert!(dir.path().join("flow_bad.json").exists());
    }

    #[tokio::test]
    async fn test_expired_entries_dropped_on_load() {
        let dir = tempdir().unwrap();
        let store = FileContextStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();
        store
            .set(
                ContextScope::Flow,
                "f1",
                "stale",
                json!(1),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        store
            .set(ContextScope::Flow, "f1", "fresh", json!(2), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.close().await.unwrap();

        let store2 = FileContextStore::new(dir.path().to_path_buf());
        store2.load().await.unwrap();
        assert!(store2.get(ContextScope::Flow, "f1", "stale").await.is_err());
        assert_eq!(
            store2.get(ContextScope::Flow, "f1", "fresh").await.unwrap(),
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_clear_removes_scope_file() {
        let dir = tempdir().unwrap();
        let store = FileContextStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();
        store
            .set(ContextScope::Node, "n1", "k", json!(1), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dir.path().join("node_n1.json").exists());

        store.clear(ContextScope::Node, "n1").await.unwrap();
        store.close().await.unwrap();
        assert!(!dir.path().join("node_n1.json").exists());
    }
}
