pub mod deploy;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::context::ContextStore;
use crate::engine::subflow::SubflowLibrary;
use crate::engine::FlowEngine;
use crate::error::{Result, RuntimeError};
use crate::message::{Message, Payload};
use crate::model::{Connection, Flow, FlowStatus, Node};
use crate::recorder::{ExecutionRecorder, RecordStatus};
use crate::registry::NodeRegistry;
use crate::scheduler::{parse_duration, Scheduler, TriggerTarget};
use crate::storage::FlowStorage;
use deploy::{spec_of, DeployMode, DeployRequest, DeployResponse};

pub const MAX_DEPLOY_LOG: usize = 100;

struct ActiveEngine {
    engine: Arc<FlowEngine>,
    record_id: String,
}

/// Owns every flow and the engines of the running ones.
///
/// All mutations to one flow serialize on its per-flow lock; `deploy` is
/// additionally serialized globally so two deploys never interleave.
pub struct FlowManager {
    storage: Arc<FlowStorage>,
    registry: Arc<NodeRegistry>,
    subflows: Arc<SubflowLibrary>,
    bus: Arc<MessageBus>,
    context: Arc<dyn ContextStore>,
    recorder: Arc<ExecutionRecorder>,
    scheduler: Arc<Scheduler>,
    engines: RwLock<HashMap<String, ActiveEngine>>,
    flow_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    deploy_lock: Mutex<()>,
    deploy_log: RwLock<VecDeque<DeployResponse>>,
    cancel: CancellationToken,
}

impl FlowManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<FlowStorage>,
        registry: Arc<NodeRegistry>,
        subflows: Arc<SubflowLibrary>,
        bus: Arc<MessageBus>,
        context: Arc<dyn ContextStore>,
        recorder: Arc<ExecutionRecorder>,
        scheduler: Arc<Scheduler>,
        cancel: CancellationToken,
    ) -> Self {
        FlowManager {
            storage,
            registry,
            subflows,
            bus,
            context,
            recorder,
            scheduler,
            engines: RwLock::new(HashMap::new()),
            flow_locks: Mutex::new(HashMap::new()),
            deploy_lock: Mutex::new(()),
            deploy_log: RwLock::new(VecDeque::new()),
            cancel,
        }
    }

    async fn flow_lock(&self, flow_id: &str) -> Arc<Mutex<()>> {
        self.flow_locks
            .lock()
            .await
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Flow CRUD ────────────────────────────────────────────────

    pub async fn create(&self, name: &str, description: &str) -> Result<Flow> {
        let flow = Flow::new(Uuid::new_v4().to_string(), name, description);
        self.storage.save(flow.clone()).await?;
        Ok(flow)
    }

    pub async fn update(&self, mut flow: Flow) -> Result<Flow> {
        let lock = self.flow_lock(&flow.id).await;
        let _guard = lock.lock().await;
        let existing = self
            .storage
            .get(&flow.id)
            .await
            .ok_or_else(|| RuntimeError::not_found("flow", &flow.id))?;
        flow.validate()?;
        flow.created_at = existing.created_at;
        flow.status = existing.status;
        flow.updated_at = Utc::now();
        self.storage.save(flow.clone()).await?;
        Ok(flow)
    }

    pub async fn delete(&self, flow_id: &str) -> Result<()> {
        let lock = self.flow_lock(flow_id).await;
        let _guard = lock.lock().await;
        self.stop_locked(flow_id).await?;
        if !self.storage.delete(flow_id).await? {
            return Err(RuntimeError::not_found("flow", flow_id));
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<Flow> {
        self.storage.list().await
    }

    pub async fn get(&self, flow_id: &str) -> Result<Flow> {
        self.storage
            .get(flow_id)
            .await
            .ok_or_else(|| RuntimeError::not_found("flow", flow_id))
    }

    // ── Graph editing ────────────────────────────────────────────

    pub async fn add_node(
        &self,
        flow_id: &str,
        type_name: &str,
        name: &str,
        config: Map<String, Value>,
    ) -> Result<Node> {
        let lock = self.flow_lock(flow_id).await;
        let _guard = lock.lock().await;
        let mut flow = self.get(flow_id).await?;
        let mut node = self.registry.create(type_name, name)?;
        node.config = config;
        flow.nodes.push(node.clone());
        flow.updated_at = Utc::now();
        self.storage.save(flow).await?;
        Ok(node)
    }

    /// Removes a node and every connection touching it.
    pub async fn remove_node(&self, flow_id: &str, node_id: &str) -> Result<()> {
        let lock = self.flow_lock(flow_id).await;
        let _guard = lock.lock().await;
        let mut flow = self.get(flow_id).await?;
        let before = flow.nodes.len();
        flow.nodes.retain(|n| n.id != node_id);
        if flow.nodes.len() == before {
            return Err(RuntimeError::not_found("node", node_id));
        }
        flow.connections
            .retain(|c| c.source_node != node_id && c.target_node != node_id);
        flow.updated_at = Utc::now();
        self.storage.save(flow).await?;
        Ok(())
    }

    pub async fn connect(
        &self,
        flow_id: &str,
        source_node: &str,
        source_port: usize,
        target_node: &str,
        target_port: usize,
    ) -> Result<Connection> {
        let lock = self.flow_lock(flow_id).await;
        let _guard = lock.lock().await;
        let mut flow = self.get(flow_id).await?;
        let conn = Connection {
            id: Uuid::new_v4().to_string(),
            source_node: source_node.to_string(),
            source_port,
            target_node: target_node.to_string(),
            target_port,
        };
        flow.connections.push(conn.clone());
        flow.validate()?;
        flow.updated_at = Utc::now();
        self.storage.save(flow).await?;
        Ok(conn)
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        for flow in self.storage.list().await {
            if flow.connections.iter().any(|c| c.id == connection_id) {
                let lock = self.flow_lock(&flow.id).await;
                let _guard = lock.lock().await;
                let mut flow = self.get(&flow.id).await?;
                flow.connections.retain(|c| c.id != connection_id);
                flow.updated_at = Utc::now();
                self.storage.save(flow).await?;
                return Ok(());
            }
        }
        Err(RuntimeError::not_found("connection", connection_id))
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub async fn start(&self, flow_id: &str) -> Result<()> {
        let lock = self.flow_lock(flow_id).await;
        let _guard = lock.lock().await;
        self.start_locked(flow_id).await
    }

    pub async fn stop(&self, flow_id: &str) -> Result<()> {
        let lock = self.flow_lock(flow_id).await;
        let _guard = lock.lock().await;
        self.get(flow_id).await?;
        self.stop_locked(flow_id).await
    }

    pub async fn is_running(&self, flow_id: &str) -> bool {
        self.engines.read().await.contains_key(flow_id)
    }

    pub async fn running_flow_ids(&self) -> Vec<String> {
        self.engines.read().await.keys().cloned().collect()
    }

    async fn start_locked(&self, flow_id: &str) -> Result<()> {
        if self.engines.read().await.contains_key(flow_id) {
            return Err(RuntimeError::AlreadyRunning(flow_id.to_string()));
        }
        let flow = self.get(flow_id).await?;

        let engine = Arc::new(FlowEngine::assemble(
            &flow,
            &self.registry,
            &self.subflows,
            self.bus.clone(),
            self.context.clone(),
            &self.cancel,
        )?);

        if let Err(e) = engine.start().await {
            self.persist_status(&flow, FlowStatus::Error).await;
            return Err(e);
        }

        self.register_triggers(&flow);

        let record_id = self
            .recorder
            .begin(&flow.id, &flow.name, flow.nodes.len())
            .await;
        self.engines.write().await.insert(
            flow_id.to_string(),
            ActiveEngine { engine, record_id },
        );
        self.persist_status(&flow, FlowStatus::Running).await;
        Ok(())
    }

    async fn stop_locked(&self, flow_id: &str) -> Result<()> {
        let Some(active) = self.engines.write().await.remove(flow_id) else {
            return Ok(());
        };
        self.scheduler.remove_all(flow_id);
        active.engine.stop().await;
        self.recorder
            .finish(&active.record_id, RecordStatus::Completed)
            .await;
        if let Some(flow) = self.storage.get(flow_id).await {
            self.persist_status(&flow, FlowStatus::Stopped).await;
        }
        Ok(())
    }

    async fn persist_status(&self, flow: &Flow, status: FlowStatus) {
        let mut updated = flow.clone();
        updated.status = status;
        updated.updated_at = Utc::now();
        if let Err(e) = self.storage.save(updated).await {
            tracing::warn!(flow = %flow.id, error = %e, "failed to persist flow status");
        }
    }

    /// Read cron/interval props off the flow's source nodes and register
    /// them with the scheduler. A bad schedule is logged, not fatal: the
    /// flow still runs for manual triggers.
    fn register_triggers(&self, flow: &Flow) {
        let utc = flow
            .config
            .get("timezone")
            .and_then(Value::as_str)
            .is_some_and(|tz| tz.eq_ignore_ascii_case("utc"));

        for node in &flow.nodes {
            if let Some(expr) = node.config.get("cron").and_then(Value::as_str) {
                if let Err(e) = self.scheduler.add_cron(&flow.id, &node.id, expr, utc) {
                    tracing::warn!(flow = %flow.id, node = %node.id, error = %e, "cron trigger rejected");
                }
            }
            match node.config.get("interval") {
                Some(Value::Number(n)) => {
                    let secs = n.as_f64().unwrap_or(0.0);
                    if secs > 0.0 {
                        let every = std::time::Duration::from_millis((secs * 1000.0) as u64);
                        if let Err(e) = self.scheduler.add_interval(&flow.id, &node.id, every) {
                            tracing::warn!(flow = %flow.id, node = %node.id, error = %e, "interval trigger rejected");
                        }
                    }
                }
                Some(Value::String(s)) if !s.is_empty() => match parse_duration(s) {
                    Ok(every) => {
                        if let Err(e) = self.scheduler.add_interval(&flow.id, &node.id, every) {
                            tracing::warn!(flow = %flow.id, node = %node.id, error = %e, "interval trigger rejected");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(flow = %flow.id, node = %node.id, error = %e, "bad interval");
                    }
                },
                _ => {}
            }
        }
    }

    // ── Message entry points ─────────────────────────────────────

    /// Manual trigger: deliver a seed message into a source node of a
    /// running flow.
    pub async fn inject(&self, flow_id: &str, node_id: &str) -> Result<()> {
        let engine = {
            let engines = self.engines.read().await;
            engines
                .get(flow_id)
                .map(|a| a.engine.clone())
                .ok_or_else(|| {
                    RuntimeError::Execution(format!("flow {flow_id} is not running"))
                })?
        };
        engine.inject(node_id).await
    }

    pub async fn inject_message(&self, flow_id: &str, node_id: &str, msg: Message) -> Result<()> {
        let engine = {
            let engines = self.engines.read().await;
            engines
                .get(flow_id)
                .map(|a| a.engine.clone())
                .ok_or_else(|| {
                    RuntimeError::Execution(format!("flow {flow_id} is not running"))
                })?
        };
        engine.inject_message(node_id, msg).await
    }

    // ── Deploy ───────────────────────────────────────────────────

    pub async fn deploy(&self, request: DeployRequest) -> DeployResponse {
        let started = Instant::now();
        if let Err(e) = request.validate() {
            return DeployResponse {
                success: false,
                message: e.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
                deployed_flows: vec![],
                stopped_flows: vec![],
                errors: HashMap::new(),
            };
        }

        let _guard = self.deploy_lock.lock().await;
        let mut deployed = Vec::new();
        let mut stopped = Vec::new();
        let mut errors = HashMap::new();

        match request.mode {
            DeployMode::Full => {
                let requested: HashSet<&str> =
                    request.flows.iter().map(|f| f.id.as_str()).collect();
                for flow_id in self.running_flow_ids().await {
                    if !requested.contains(flow_id.as_str()) {
                        if let Err(e) = self.stop(&flow_id).await {
                            errors.insert(flow_id.clone(), e.to_string());
                        } else {
                            stopped.push(flow_id);
                        }
                    }
                }
                for spec in request.flows {
                    self.deploy_one(spec, &mut deployed, &mut stopped, &mut errors)
                        .await;
                }
            }
            DeployMode::Modified => {
                for spec in request.flows {
                    let existing = self.storage.get(&spec.id).await;
                    let unchanged = existing
                        .as_ref()
                        .is_some_and(|f| spec_of(f).content_hash() == spec.content_hash());
                    if unchanged {
                        tracing::debug!(flow = %spec.id, "unchanged, leaving as is");
                        continue;
                    }
                    self.deploy_one(spec, &mut deployed, &mut stopped, &mut errors)
                        .await;
                }
            }
            DeployMode::Flow => {
                // validate() guarantees flow_id is present.
                let flow_id = request.flow_id.unwrap_or_default();
                match request.flows.into_iter().find(|f| f.id == flow_id) {
                    Some(spec) => {
                        self.deploy_one(spec, &mut deployed, &mut stopped, &mut errors)
                            .await;
                    }
                    None => {
                        errors.insert(
                            flow_id.clone(),
                            format!("flow {flow_id} not present in request"),
                        );
                    }
                }
            }
        }

        let response = DeployResponse {
            success: errors.is_empty(),
            message: if errors.is_empty() {
                format!("deployed {} flow(s)", deployed.len())
            } else {
                format!("deploy finished with {} error(s)", errors.len())
            },
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            deployed_flows: deployed,
            stopped_flows: stopped,
            errors,
        };

        let mut log = self.deploy_log.write().await;
        log.push_back(response.clone());
        while log.len() > MAX_DEPLOY_LOG {
            log.pop_front();
        }
        response
    }

    /// Save one flow spec and stop/start it per its disabled flag. One
    /// flow's failure lands in `errors` and never aborts the batch.
    async fn deploy_one(
        &self,
        spec: deploy::FlowSpec,
        deployed: &mut Vec<String>,
        stopped: &mut Vec<String>,
        errors: &mut HashMap<String, String>,
    ) {
        let flow_id = spec.id.clone();
        let disabled = spec.disabled;
        let was_running = self.is_running(&flow_id).await;

        let existing = self.storage.get(&flow_id).await;
        let flow = spec.into_flow(existing.as_ref());
        if let Err(e) = flow.validate() {
            errors.insert(flow_id, e.to_string());
            return;
        }
        if let Err(e) = self.storage.save(flow).await {
            errors.insert(flow_id, e.to_string());
            return;
        }

        // Stop-then-start; two engines for one flow never coexist.
        if was_running {
            if let Err(e) = self.stop(&flow_id).await {
                errors.insert(flow_id, e.to_string());
                return;
            }
            if disabled {
                stopped.push(flow_id.clone());
            }
        }
        if disabled {
            return;
        }
        match self.start(&flow_id).await {
            Ok(()) => deployed.push(flow_id),
            Err(e) => {
                errors.insert(flow_id, e.to_string());
            }
        }
    }

    pub async fn deploy_log(&self) -> Vec<DeployResponse> {
        self.deploy_log.read().await.iter().cloned().collect()
    }

    /// Stop every running flow. Used at shutdown.
    pub async fn stop_all(&self) {
        for flow_id in self.running_flow_ids().await {
            if let Err(e) = self.stop(&flow_id).await {
                tracing::warn!(flow = %flow_id, error = %e, "failed to stop flow at shutdown");
            }
        }
    }
}

/// Scheduler ticks: deliver a seed message if the flow is running, drop
/// the tick otherwise.
#[async_trait]
impl TriggerTarget for FlowManager {
    async fn fire(&self, flow_id: &str, node_id: &str) {
        let engine = {
            let engines = self.engines.read().await;
            engines.get(flow_id).map(|a| a.engine.clone())
        };
        let Some(engine) = engine else {
            tracing::debug!(flow = %flow_id, node = %node_id, "tick for non-running flow dropped");
            return;
        };
        let msg = Message::new(Payload::null(), flow_id.to_string(), node_id.to_string());
        if let Err(e) = engine.inject_message(node_id, msg).await {
            tracing::warn!(flow = %flow_id, node = %node_id, error = %e, "scheduled trigger failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::memory::MemoryContextStore;
    use crate::registry;
    use deploy::{ConnSpec, FlowSpec, NodeSpec};
    use serde_json::json;
    use tempfile::tempdir;

    async fn test_manager(dir: &std::path::Path) -> Arc<FlowManager> {
        let storage = Arc::new(FlowStorage::new(dir.to_path_buf()));
        storage.load_all().await.unwrap();
        let reg = NodeRegistry::new();
        registry::register_builtins(&reg).unwrap();
        Arc::new(FlowManager::new(
            storage,
            Arc::new(reg),
            Arc::new(SubflowLibrary::new()),
            Arc::new(MessageBus::new()),
            Arc::new(MemoryContextStore::new()),
            Arc::new(ExecutionRecorder::new()),
            Arc::new(Scheduler::new()),
            CancellationToken::new(),
        ))
    }

    fn ping_spec(id: &str) -> FlowSpec {
        FlowSpec {
            id: id.into(),
            name: format!("flow {id}"),
            description: String::new(),
            disabled: false,
            config: Map::new(),
            nodes: vec![
                NodeSpec {
                    id: "inject-1".into(),
                    type_name: "inject".into(),
                    name: "Inject".into(),
                    config: json!({"payload": "ping"}).as_object().cloned().unwrap(),
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
        }
    }

    fn deploy_request(mode: DeployMode, flows: Vec<FlowSpec>) -> DeployRequest {
        DeployRequest {
            mode,
            flow_id: None,
            version: None,
            flows,
        }
    }

    #[tokio::test]
    async fn test_create_and_crud() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;

        let flow = manager.create("My Flow", "desc").await.unwrap();
        assert!(!flow.id.is_empty());

        let node = manager
            .add_node(&flow.id, "inject", "Inject", Map::new())
            .await
            .unwrap();
        let node2 = manager
            .add_node(&flow.id, "debug", "Debug", Map::new())
            .await
            .unwrap();
        manager
            .connect(&flow.id, &node.id, 0, &node2.id, 0)
            .await
            .unwrap();

        let stored = manager.get(&flow.id).await.unwrap();
        assert_eq!(stored.nodes.len(), 2);
        assert_eq!(stored.connections.len(), 1);

        manager.remove_node(&flow.id, &node.id).await.unwrap();
        let stored = manager.get(&flow.id).await.unwrap();
        assert_eq!(stored.nodes.len(), 1);
        // Incident connection went with the node.
        assert!(stored.connections.is_empty());
    }

    #[tokio::test]
    async fn test_add_node_unknown_type() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        let flow = manager.create("f", "").await.unwrap();
        let err = manager
            .add_node(&flow.id, "warp-drive", "x", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_type");
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle_and_status() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        let response = manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;
        assert!(response.success, "{}", response.message);
        assert_eq!(response.deployed_flows, vec!["f1"]);

        assert!(manager.is_running("f1").await);
        assert_eq!(manager.get("f1").await.unwrap().status, FlowStatus::Running);

        manager.stop("f1").await.unwrap();
        assert!(!manager.is_running("f1").await);
        assert_eq!(manager.get("f1").await.unwrap().status, FlowStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;
        let err = manager.start("f1").await.unwrap_err();
        assert_eq!(err.code(), "already_running");
    }

    #[tokio::test]
    async fn test_inject_runs_cascade_and_records() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager.recorder.start(&manager.bus);
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;

        manager.inject("f1", "inject-1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let records = manager.recorder.for_flow("f1", 10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].completed_nodes, 2);
        assert_eq!(records[0].error_nodes, 0);
        manager.recorder.stop();
    }

    #[tokio::test]
    async fn test_inject_into_stopped_flow_fails() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;
        manager.stop("f1").await.unwrap();
        let err = manager.inject("f1", "inject-1").await.unwrap_err();
        assert_eq!(err.code(), "execution");
    }

    #[tokio::test]
    async fn test_fire_drops_tick_for_stopped_flow() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager.recorder.start(&manager.bus);
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;
        manager.stop("f1").await.unwrap();

        manager.fire("f1", "inject-1").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The stop finalized one record with zero node events; no new
        // record or events appear from the dropped tick.
        let records = manager.recorder.for_flow("f1", 10).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].node_events.is_empty());
        manager.recorder.stop();
    }

    #[tokio::test]
    async fn test_modified_deploy_identical_content_is_noop() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;

        let response = manager
            .deploy(deploy_request(DeployMode::Modified, vec![ping_spec("f1")]))
            .await;
        assert!(response.success);
        assert!(response.deployed_flows.is_empty());
        assert!(response.stopped_flows.is_empty());
        assert!(manager.is_running("f1").await);
    }

    #[tokio::test]
    async fn test_modified_deploy_restarts_changed_flow() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;

        let mut changed = ping_spec("f1");
        changed.nodes[0]
            .config
            .insert("payload".into(), json!("pong"));
        let response = manager
            .deploy(deploy_request(DeployMode::Modified, vec![changed]))
            .await;
        assert_eq!(response.deployed_flows, vec!["f1"]);
        assert!(manager.is_running("f1").await);
    }

    #[tokio::test]
    async fn test_full_deploy_stops_flows_not_in_request() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(
                DeployMode::Full,
                vec![ping_spec("f1"), ping_spec("f2")],
            ))
            .await;
        assert!(manager.is_running("f1").await);
        assert!(manager.is_running("f2").await);

        let response = manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f2")]))
            .await;
        assert_eq!(response.stopped_flows, vec!["f1"]);
        assert!(!manager.is_running("f1").await);
        assert!(manager.is_running("f2").await);
    }

    #[tokio::test]
    async fn test_flow_mode_restarts_only_target() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(
                DeployMode::Full,
                vec![ping_spec("f1"), ping_spec("f2")],
            ))
            .await;

        let request = DeployRequest {
            mode: DeployMode::Flow,
            flow_id: Some("f1".into()),
            version: None,
            flows: vec![ping_spec("f1")],
        };
        let response = manager.deploy(request).await;
        assert_eq!(response.deployed_flows, vec!["f1"]);
        assert!(manager.is_running("f1").await);
        assert!(manager.is_running("f2").await);
    }

    #[tokio::test]
    async fn test_disabled_spec_saved_but_not_started() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        let mut spec = ping_spec("f1");
        spec.disabled = true;
        let response = manager
            .deploy(deploy_request(DeployMode::Full, vec![spec]))
            .await;
        assert!(response.success);
        assert!(response.deployed_flows.is_empty());
        assert!(!manager.is_running("f1").await);
        assert!(manager.get("f1").await.is_ok());
    }

    #[tokio::test]
    async fn test_one_bad_flow_does_not_block_others() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        let mut bad = ping_spec("bad");
        bad.nodes[0].type_name = "nonexistent".into();

        let response = manager
            .deploy(deploy_request(DeployMode::Full, vec![bad, ping_spec("ok")]))
            .await;
        assert!(!response.success);
        assert_eq!(response.deployed_flows, vec!["ok"]);
        assert!(response.errors.contains_key("bad"));
        assert!(manager.is_running("ok").await);
    }

    #[tokio::test]
    async fn test_deploy_log_capped() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        let mut disabled = ping_spec("f1");
        disabled.disabled = true;
        for _ in 0..(MAX_DEPLOY_LOG + 10) {
            manager
                .deploy(deploy_request(DeployMode::Full, vec![disabled.clone()]))
                .await;
        }
        assert_eq!(manager.deploy_log().await.len(), MAX_DEPLOY_LOG);
    }

    #[tokio::test]
    async fn test_delete_stops_running_flow() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path()).await;
        manager
            .deploy(deploy_request(DeployMode::Full, vec![ping_spec("f1")]))
            .await;
        manager.delete("f1").await.unwrap();
        assert!(!manager.is_running("f1").await);
        assert!(manager.get("f1").await.is_err());
    }
}
