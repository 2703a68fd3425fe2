use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::shadow::ShadowManager;
use crate::bus::{MessageBus, Topic};
use crate::error::{Result, RuntimeError};
use crate::manager::FlowManager;
use crate::recorder::ExecutionRecorder;

/// Dispatch table for commands arriving over the tunnel. Every command
/// resolves to a response envelope; unknown actions resolve to an error
/// response, never a dropped frame.
pub struct CommandHandler {
    manager: Arc<FlowManager>,
    recorder: Arc<ExecutionRecorder>,
    shadow: Arc<ShadowManager>,
    version: String,
    started_at: Instant,
    gpio_state: Arc<RwLock<Value>>,
}

impl CommandHandler {
    pub fn new(
        manager: Arc<FlowManager>,
        recorder: Arc<ExecutionRecorder>,
        shadow: Arc<ShadowManager>,
        version: String,
    ) -> Self {
        CommandHandler {
            manager,
            recorder,
            shadow,
            version,
            started_at: Instant::now(),
            gpio_state: Arc::new(RwLock::new(json!({}))),
        }
    }

    /// Keep the latest `gpio_state` bus payload for `get_gpio_state`.
    pub fn watch_gpio(&self, bus: &MessageBus) {
        let mut sub = bus.subscribe(Topic::GpioState);
        let cell = self.gpio_state.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                *cell.write().await = event.payload;
            }
        });
    }

    pub async fn handle(&self, action: &str, payload: &Value) -> Result<Value> {
        match action {
            "health_check" => Ok(json!({
                "status": "ok",
                "version": self.version,
                "uptime_secs": self.started_at.elapsed().as_secs(),
            })),
            "list_flows" => {
                let flows = self.manager.list().await;
                let summaries: Vec<Value> = flows
                    .iter()
                    .map(|f| {
                        json!({
                            "id": f.id,
                            "name": f.name,
                            "status": f.status,
                            "nodes": f.nodes.len(),
                        })
                    })
                    .collect();
                Ok(json!({ "flows": summaries }))
            }
            "get_flow" => {
                let flow_id = required_str(payload, "flow_id")?;
                let flow = self.manager.get(flow_id).await?;
                Ok(serde_json::to_value(flow)?)
            }
            "start_flow" => {
                let flow_id = required_str(payload, "flow_id")?;
                self.manager.start(flow_id).await?;
                Ok(json!({ "flow_id": flow_id, "status": "started" }))
            }
            "stop_flow" => {
                let flow_id = required_str(payload, "flow_id")?;
                self.manager.stop(flow_id).await?;
                Ok(json!({ "flow_id": flow_id, "status": "stopped" }))
            }
            "get_shadow" => Ok(serde_json::to_value(self.shadow.current().await)?),
            "update_desired" => {
                let desired = payload
                    .get("desired")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        RuntimeError::Validation("update_desired requires 'desired' object".into())
                    })?;
                let delta = self.shadow.update_desired(desired.clone()).await;
                Ok(json!({ "delta": delta }))
            }
            "get_system_metrics" => {
                let flows = self.manager.list().await;
                let running = self.manager.running_flow_ids().await;
                Ok(json!({
                    "uptime_secs": self.started_at.elapsed().as_secs(),
                    "flow_count": flows.len(),
                    "running_flows": running.len(),
                    "version": self.version,
                }))
            }
            "get_executions" => {
                let records = self.recorder.list(20).await;
                Ok(json!({ "executions": records }))
            }
            "get_gpio_state" => Ok(self.gpio_state.read().await.clone()),
            other => Err(RuntimeError::Validation(format!("unknown action: {other}"))),
        }
    }
}

fn required_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RuntimeError::Validation(format!("missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::context::memory::MemoryContextStore;
    use crate::engine::subflow::SubflowLibrary;
    use crate::manager::deploy::{ConnSpec, DeployMode, DeployRequest, FlowSpec, NodeSpec};
    use crate::registry::{self, NodeRegistry};
    use crate::scheduler::Scheduler;
    use crate::storage::FlowStorage;
    use serde_json::Map;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn handler_with_flow(dir: &std::path::Path) -> CommandHandler {
        let storage = Arc::new(FlowStorage::new(dir.to_path_buf()));
        storage.load_all().await.unwrap();
        let reg = NodeRegistry::new();
        registry::register_builtins(&reg).unwrap();
        let manager = Arc::new(FlowManager::new(
            storage,
            Arc::new(reg),
            Arc::new(SubflowLibrary::new()),
            Arc::new(MessageBus::new()),
            Arc::new(MemoryContextStore::new()),
            Arc::new(ExecutionRecorder::new()),
            Arc::new(Scheduler::new()),
            CancellationToken::new(),
        ));

        let spec = FlowSpec {
            id: "F".into(),
            name: "Flow F".into(),
            description: String::new(),
            disabled: true,
            config: Map::new(),
            nodes: vec![
                NodeSpec {
                    id: "inject-1".into(),
                    type_name: "inject".into(),
                    name: "Inject".into(),
                    config: Map::new(),
                },
                NodeSpec {
                    id: "debug-1".into(),
                    type_name: "debug".into(),
                    name: "Debug".into(),
                    config: Map::new(),
                },
            ],
            connections: vec![ConnSpec {
                id: "c1".into(),
                source_node: "inject-1".into(),
                source_port: 0,
                target_node: "debug-1".into(),
                target_port: 0,
            }],
        };
        manager
            .deploy(DeployRequest {
                mode: DeployMode::Full,
                flow_id: None,
                version: None,
                flows: vec![spec],
            })
            .await;

        let shadow = Arc::new(ShadowManager::new(
            reqwest::Client::new(),
            "http://unused".into(),
            "dev-1".into(),
            "key".into(),
        ));
        CommandHandler::new(
            manager,
            Arc::new(ExecutionRecorder::new()),
            shadow,
            "0.1.0".into(),
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;
        let data = handler.handle("health_check", &json!({})).await.unwrap();
        assert_eq!(data["status"], json!("ok"));
        assert_eq!(data["version"], json!("0.1.0"));
    }

    #[tokio::test]
    async fn test_start_and_stop_flow() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;

        let data = handler
            .handle("start_flow", &json!({"flow_id": "F"}))
            .await
            .unwrap();
        assert_eq!(data, json!({"flow_id": "F", "status": "started"}));
        assert!(handler.manager.is_running("F").await);

        let data = handler
            .handle("stop_flow", &json!({"flow_id": "F"}))
            .await
            .unwrap();
        assert_eq!(data["status"], json!("stopped"));
        assert!(!handler.manager.is_running("F").await);
    }

    #[tokio::test]
    async fn test_list_and_get_flow() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;
        let data = handler.handle("list_flows", &json!({})).await.unwrap();
        assert_eq!(data["flows"].as_array().unwrap().len(), 1);

        let flow = handler
            .handle("get_flow", &json!({"flow_id": "F"}))
            .await
            .unwrap();
        assert_eq!(flow["id"], json!("F"));
        assert_eq!(flow["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_flow_missing_id() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;
        let err = handler.handle("get_flow", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "validation");
        let err = handler
            .handle("get_flow", &json!({"flow_id": "ghost"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_update_desired_returns_delta() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;
        let data = handler
            .handle("update_desired", &json!({"desired": {"led": "on"}}))
            .await
            .unwrap();
        assert_eq!(data["delta"]["led"], json!("on"));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;
        let err = handler.handle("self_destruct", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("unknown action: self_destruct"));
    }

    #[tokio::test]
    async fn test_gpio_state_tracks_bus() {
        let dir = tempdir().unwrap();
        let handler = handler_with_flow(dir.path()).await;
        let bus = MessageBus::new();
        handler.watch_gpio(&bus);

        bus.publish(Topic::GpioState, json!({"pin4": "high"}));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let data = handler.handle("get_gpio_state", &json!({})).await.unwrap();
        assert_eq!(data, json!({"pin4": "high"}));
    }
}
