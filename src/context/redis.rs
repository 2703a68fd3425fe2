use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use super::{ContextScope, ContextStore};
use crate::error::{Result, RuntimeError};

/// Networked backend over redis. Keys are shaped
/// `{prefix}:{scope}:{scope_id}:{key}`; values are stored as JSON text,
/// falling back to a raw string when the stored text fails to parse.
/// TTL is native (`SET ... EX` / `TTL`).
pub struct RedisContextStore {
    manager: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisContextStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisContextStore {
    pub async fn connect(url: &str, prefix: String) -> Result<Self> {
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(RuntimeError::Validation(format!(
                "redis url must start with redis:// or rediss://: {url}"
            )));
        }
        let client = redis::Client::open(url)
            .map_err(|e| RuntimeError::Resource(format!("redis client: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RuntimeError::Resource(format!("redis connect: {e}")))?;
        Ok(RedisContextStore { manager, prefix })
    }

    fn key(&self, scope: ContextScope, scope_id: &str, key: &str) -> String {
        shape_key(&self.prefix, scope, scope_id, key)
    }

    fn scope_pattern(&self, scope: ContextScope, scope_id: &str) -> String {
        format!("{}:{}:{}:*", self.prefix, scope.as_str(), scope_id)
    }
}

fn shape_key(prefix: &str, scope: ContextScope, scope_id: &str, key: &str) -> String {
    format!("{}:{}:{}:{}", prefix, scope.as_str(), scope_id, key)
}

/// Stored text → value. Anything that is not valid JSON reads back as a
/// raw string.
fn decode(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn resource(op: &str, e: redis::RedisError) -> RuntimeError {
    RuntimeError::Resource(format!("redis {op}: {e}"))
}

#[async_trait]
impl ContextStore for RedisContextStore {
    async fn get(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<Value> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con
            .get(self.key(scope, scope_id, key))
            .await
            .map_err(|e| resource("get", e))?;
        raw.map(decode)
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
        let mut con = self.manager.clone();
        let redis_key = self.key(scope, scope_id, key);
        let encoded = serde_json::to_string(&value)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&redis_key).arg(encoded);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| resource("set", e))?;
        Ok(())
    }

    async fn delete(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(self.key(scope, scope_id, key))
            .await
            .map_err(|e| resource("del", e))?;
        Ok(())
    }

    async fn clear(&self, scope: ContextScope, scope_id: &str) -> Result<()> {
        let keys = self.scan_scope(scope, scope_id).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        con.del::<_, ()>(keys).await.map_err(|e| resource("del", e))?;
        Ok(())
    }

    async fn keys(&self, scope: ContextScope, scope_id: &str) -> Result<Vec<String>> {
        let full_keys = self.scan_scope(scope, scope_id).await?;
        let strip = format!("{}:{}:{}:", self.prefix, scope.as_str(), scope_id);
        Ok(full_keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&strip).map(str::to_string))
            .collect())
    }

    async fn exists(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        con.exists(self.key(scope, scope_id, key))
            .await
            .map_err(|e| resource("exists", e))
    }

    async fn increment(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64> {
        let mut con = self.manager.clone();
        con.incr(self.key(scope, scope_id, key), delta)
            .await
            .map_err(|e| resource("incrby", e))
    }

    async fn ttl(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
    ) -> Result<Option<Duration>> {
        let mut con = self.manager.clone();
        let secs: i64 = con
            .ttl(self.key(scope, scope_id, key))
            .await
            .map_err(|e| resource("ttl", e))?;
        match secs {
            -2 => Err(RuntimeError::not_found("context key", key)),
            -1 => Ok(None),
            s => Ok(Some(Duration::from_secs(s.max(0) as u64))),
        }
    }

    async fn close(&self) -> Result<()> {
        // Writes go straight through; nothing pending.
        Ok(())
    }
}

impl RedisContextStore {
    async fn scan_scope(&self, scope: ContextScope, scope_id: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let pattern = self.scope_pattern(scope, scope_id);
        let mut iter: redis::AsyncIter<String> = con
            .scan_match(pattern)
            .await
            .map_err(|e| resource("scan", e))?;
        let mut keys = Vec::new();
        while let Some(k) = iter.next_item().await {
            keys.push(k);
        }
        Ok(keys)
    }
}
