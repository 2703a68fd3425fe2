pub mod file;
pub mod memory;
pub mod redis;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Well-known scope id for the single global scope.
pub const GLOBAL_SCOPE_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Node,
    Flow,
    Global,
}

impl ContextScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextScope::Node => "node",
            ContextScope::Flow => "flow",
            ContextScope::Global => "global",
        }
    }
}

impl std::fmt::Display for ContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scoped key/value storage shared by every node in the runtime.
///
/// Entries are keyed by `(scope, scope_id, key)`. A `ttl` of `None` never
/// expires. `set` followed by `get` on the same task returns an equal value
/// (equal after JSON round-trip for persistent backends).
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<Value>;

    async fn set(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn delete(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<()>;

    async fn clear(&self, scope: ContextScope, scope_id: &str) -> Result<()>;

    async fn keys(&self, scope: ContextScope, scope_id: &str) -> Result<Vec<String>>;

    async fn exists(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<bool>;

    /// Atomic numeric increment; missing keys initialize to 0.
    async fn increment(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64>;

    /// Remaining time to live, for backends supporting expiry.
    async fn ttl(&self, scope: ContextScope, scope_id: &str, key: &str)
        -> Result<Option<Duration>>;

    /// Flush pending writes. The store is unusable afterwards.
    async fn close(&self) -> Result<()>;
}

/// Backend selection, decided at init time. Callers only ever see the
/// trait object.
#[derive(Debug, Clone)]
pub enum ContextStoreConfig {
    Memory,
    File { base_dir: PathBuf },
    Redis { url: String, prefix: String },
}

pub async fn build(config: ContextStoreConfig) -> Result<Arc<dyn ContextStore>> {
    match config {
        ContextStoreConfig::Memory => Ok(Arc::new(memory::MemoryContextStore::new())),
        ContextStoreConfig::File { base_dir } => {
            let store = file::FileContextStore::new(base_dir);
            store.load().await?;
            Ok(Arc::new(store))
        }
        ContextStoreConfig::Redis { url, prefix } => {
            let store = redis::RedisContextStore::connect(&url, prefix).await?;
            Ok(Arc::new(store))
        }
    }
}
