use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{Result, RuntimeError};

/// Cloud-side mirror of desired vs reported device state.
///
/// `delta` always equals the desired leaves whose value differs from
/// reported, nested maps compared recursively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Shadow {
    pub device_id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub desired: Map<String, Value>,
    #[serde(default)]
    pub reported: Map<String, Value>,
    #[serde(default)]
    pub delta: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Desired leaves that differ from reported. A desired subtree missing
/// from reported appears whole; nested maps keep only the differing
/// leaves, with the path implied by nesting.
pub fn compute_delta(desired: &Map<String, Value>, reported: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();
    for (key, want) in desired {
        match reported.get(key) {
            None => {
                delta.insert(key.clone(), want.clone());
            }
            Some(have) => match (want.as_object(), have.as_object()) {
                (Some(want_map), Some(have_map)) => {
                    let nested = compute_delta(want_map, have_map);
                    if !nested.is_empty() {
                        delta.insert(key.clone(), Value::Object(nested));
                    }
                }
                _ => {
                    if want != have {
                        delta.insert(key.clone(), want.clone());
                    }
                }
            },
        }
    }
    delta
}

pub type DesiredCallback = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;

/// Local shadow copy plus the two REST endpoints that synchronize it.
pub struct ShadowManager {
    http: reqwest::Client,
    api_base: String,
    identity: std::sync::RwLock<(String, String)>,
    shadow: RwLock<Shadow>,
    on_desired: std::sync::RwLock<Option<DesiredCallback>>,
}

impl ShadowManager {
    pub fn new(http: reqwest::Client, api_base: String, device_id: String, api_key: String) -> Self {
        let shadow = Shadow {
            device_id: device_id.clone(),
            ..Shadow::default()
        };
        ShadowManager {
            http,
            api_base,
            identity: std::sync::RwLock::new((device_id, api_key)),
            shadow: RwLock::new(shadow),
            on_desired: std::sync::RwLock::new(None),
        }
    }

    /// Adopt credentials issued after a provisioning exchange.
    pub fn set_identity(&self, device_id: &str, api_key: &str) {
        *self.identity.write().expect("shadow lock poisoned") =
            (device_id.to_string(), api_key.to_string());
    }

    /// Callback invoked once per update whose delta is non-empty.
    pub fn on_desired_change(&self, cb: DesiredCallback) {
        *self.on_desired.write().expect("shadow lock poisoned") = Some(cb);
    }

    pub async fn current(&self) -> Shadow {
        self.shadow.read().await.clone()
    }

    fn shadow_url(&self) -> String {
        let identity = self.identity.read().expect("shadow lock poisoned");
        format!("{}/devices/{}/shadow", self.api_base, identity.0)
    }

    fn api_key(&self) -> String {
        self.identity.read().expect("shadow lock poisoned").1.clone()
    }

    /// `GET /devices/{id}/shadow`, replacing the local copy.
    pub async fn fetch(&self) -> Result<Shadow> {
        let response = self
            .http
            .get(self.shadow_url())
            .header("X-API-Key", self.api_key())
            .send()
            .await
            .map_err(|e| RuntimeError::Resource(format!("shadow fetch: {e}")))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Resource(format!(
                "shadow fetch: http {}",
                response.status()
            )));
        }
        let fetched: Shadow = response
            .json()
            .await
            .map_err(|e| RuntimeError::Resource(format!("shadow fetch body: {e}")))?;
        let delta = fetched.delta.clone();
        *self.shadow.write().await = fetched.clone();
        if !delta.is_empty() {
            self.notify_desired(&delta);
        }
        Ok(fetched)
    }

    /// `PUT /devices/{id}/shadow` with `{reported}`. The response shadow
    /// replaces the local copy; a non-empty delta fires the callback.
    pub async fn report(&self, reported: Map<String, Value>) -> Result<Shadow> {
        let response = self
            .http
            .put(self.shadow_url())
            .header("X-API-Key", self.api_key())
            .json(&serde_json::json!({ "reported": reported }))
            .send()
            .await
            .map_err(|e| RuntimeError::Resource(format!("shadow report: {e}")))?;
        if !response.status().is_success() {
            return Err(RuntimeError::Resource(format!(
                "shadow report: http {}",
                response.status()
            )));
        }
        let updated: Shadow = response
            .json()
            .await
            .map_err(|e| RuntimeError::Resource(format!("shadow report body: {e}")))?;
        let delta = updated.delta.clone();
        *self.shadow.write().await = updated.clone();
        if !delta.is_empty() {
            self.notify_desired(&delta);
        }
        Ok(updated)
    }

    /// Apply a desired update arriving over the tunnel; returns the new
    /// delta.
    pub async fn update_desired(&self, desired: Map<String, Value>) -> Map<String, Value> {
        let mut shadow = self.shadow.write().await;
        for (k, v) in desired {
            shadow.desired.insert(k, v);
        }
        shadow.delta = compute_delta(&shadow.desired, &shadow.reported);
        shadow.version += 1;
        shadow.updated_at = Some(Utc::now());
        let delta = shadow.delta.clone();
        drop(shadow);
        if !delta.is_empty() {
            self.notify_desired(&delta);
        }
        delta
    }

    /// Record locally-observed state and recompute the delta without a
    /// round-trip.
    pub async fn observe_reported(&self, reported: Map<String, Value>) {
        let mut shadow = self.shadow.write().await;
        for (k, v) in reported {
            shadow.reported.insert(k, v);
        }
        shadow.delta = compute_delta(&shadow.desired, &shadow.reported);
        shadow.updated_at = Some(Utc::now());
    }

    fn notify_desired(&self, delta: &Map<String, Value>) {
        if let Some(cb) = self.on_desired.read().expect("shadow lock poisoned").as_ref() {
            cb(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_delta_empty_when_in_sync() {
        let desired = map(json!({"led": "on", "rate": 5}));
        let reported = map(json!({"led": "on", "rate": 5, "extra": true}));
        assert!(compute_delta(&desired, &reported).is_empty());
    }

    #[test]
    fn test_delta_contains_only_differing_keys() {
        let desired = map(json!({"led": "on", "rate": 5}));
        let reported = map(json!({"led": "off", "rate": 5}));
        let delta = compute_delta(&desired, &reported);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["led"], json!("on"));
    }

    #[test]
    fn test_delta_missing_reported_key_included_whole() {
        let desired = map(json!({"net": {"ssid": "edge", "channel": 6}}));
        let reported = map(json!({}));
        let delta = compute_delta(&desired, &reported);
        assert_eq!(delta["net"], json!({"ssid": "edge", "channel": 6}));
    }

    #[test]
    fn test_delta_nested_keeps_only_differing_leaves() {
        let desired = map(json!({"net": {"ssid": "edge", "channel": 6}}));
        let reported = map(json!({"net": {"ssid": "edge", "channel": 11}}));
        let delta = compute_delta(&desired, &reported);
        assert_eq!(delta["net"], json!({"channel": 6}));
    }

    #[test]
    fn test_delta_type_change_counts_as_difference() {
        let desired = map(json!({"mode": {"auto": true}}));
        let reported = map(json!({"mode": "manual"}));
        let delta = compute_delta(&desired, &reported);
        assert_eq!(delta["mode"], json!({"auto": true}));
    }

    #[tokio::test]
    async fn test_update_desired_recomputes_delta_and_notifies() {
        let manager = ShadowManager::new(
            reqwest::Client::new(),
            "http://unused".into(),
            "dev-1".into(),
            "key".into(),
        );
        manager.observe_reported(map(json!({"led": "off"}))).await;

        let notified = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = notified.clone();
        manager.on_desired_change(Arc::new(move |delta| {
            sink.lock().unwrap().push(Value::Object(delta.clone()));
        }));

        let delta = manager.update_desired(map(json!({"led": "on"}))).await;
        assert_eq!(delta["led"], json!("on"));
        assert_eq!(notified.lock().unwrap().len(), 1);

        let shadow = manager.current().await;
        assert_eq!(shadow.version, 1);
        assert_eq!(shadow.delta["led"], json!("on"));
    }

    #[tokio::test]
    async fn test_reported_catching_up_clears_delta() {
        let manager = ShadowManager::new(
            reqwest::Client::new(),
            "http://unused".into(),
            "dev-1".into(),
            "key".into(),
        );
        manager.update_desired(map(json!({"led": "on"}))).await;
        manager.observe_reported(map(json!({"led": "on"}))).await;
        let shadow = manager.current().await;
        assert!(shadow.delta.is_empty());
    }
}
