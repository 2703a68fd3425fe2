use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ContextScope, ContextStore};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

type ScopeKey = (ContextScope, String);

/// In-memory backend. Write-preferring lock, no persistence; expired
/// entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryContextStore {
    scopes: RwLock<HashMap<ScopeKey, HashMap<String, Entry>>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        MemoryContextStore::default()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<Value> {
        let scopes = self.scopes.read().await;
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
        let mut scopes = self.scopes.write().await;
        scopes
            .entry((scope, scope_id.to_string()))
            .or_default()
            .insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
        Ok(())
    }

    async fn delete(&self, scope: ContextScope, scope_id: &str, key: &str) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        if let Some(m) = scopes.get_mut(&(scope, scope_id.to_string())) {
            m.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, scope: ContextScope, scope_id: &str) -> Result<()> {
        self.scopes
            .write()
            .await
            .remove(&(scope, scope_id.to_string()));
        Ok(())
    }

    async fn keys(&self, scope: ContextScope, scope_id: &str) -> Result<Vec<String>> {
        let scopes = self.scopes.read().await;
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
        let scopes = self.scopes.read().await;
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
        let mut scopes = self.scopes.write().await;
        let entries = scopes.entry((scope, scope_id.to_string())).or_default();

        let current = match entries.get(key).filter(|e| !e.expired()) {
            Some(e) => e
                .value
                .as_i64()
                .ok_or_else(|| RuntimeError::Resource(format!("context key {key} is not numeric")))?,
            None => 0,
        };
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::from(next),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn ttl(
        &self,
        scope: ContextScope,
        scope_id: &str,
        key: &str,
    ) -> Result<Option<Duration>> {
        let scopes = self.scopes.read().await;
        let entry = scopes
            .get(&(scope, scope_id.to_string()))
            .and_then(|m| m.get(key))
            .filter(|e| !e.expired())
            .ok_or_else(|| RuntimeError::not_found("context key", key))?;
        Ok(entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
