use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::MAX_CASCADE_DEPTH;
use crate::error::{Result, RuntimeError};
use crate::message::Message;
use crate::model::{Connection, Node};
use crate::nodes::{catch, Executor, NodeContext, Outgoing};
use crate::registry::NodeRegistry;

/// Recursion bound for subflows instantiating subflows.
pub const MAX_SUBFLOW_DEPTH: usize = 16;

const PORT_INPUT_PREFIX: &str = "port-input-";
const PORT_OUTPUT_PREFIX: &str = "port-output-";

/// A reusable inner graph with explicit ports. Inner connections may
/// reference internal node ids or the synthetic `port-input-N` /
/// `port-output-N` endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub inputs: usize,
    #[serde(default)]
    pub outputs: usize,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// Subflow definitions by id. Instances reference them as node type
/// `subflow:{id}`.
#[derive(Default)]
pub struct SubflowLibrary {
    defs: RwLock<HashMap<String, SubflowDef>>,
}

impl SubflowLibrary {
    pub fn new() -> Self {
        SubflowLibrary::default()
    }

    pub fn insert(&self, def: SubflowDef) {
        self.defs
            .write()
            .expect("subflow lock poisoned")
            .insert(def.id.clone(), def);
    }

    pub fn get(&self, id: &str) -> Option<SubflowDef> {
        self.defs
            .read()
            .expect("subflow lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.defs
            .write()
            .expect("subflow lock poisoned")
            .remove(id)
            .is_some()
    }

    pub fn list(&self) -> Vec<SubflowDef> {
        self.defs
            .read()
            .expect("subflow lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Resolve a node type to an executor: `subflow:{id}` expands through the
/// library, everything else goes to the registry.
pub fn materialize(
    type_name: &str,
    registry: &Arc<NodeRegistry>,
    subflows: &Arc<SubflowLibrary>,
    depth: usize,
) -> Result<Box<dyn Executor>> {
    match type_name.strip_prefix("subflow:") {
        Some(subflow_id) => {
            if depth >= MAX_SUBFLOW_DEPTH {
                return Err(RuntimeError::DepthExceeded(depth));
            }
            let def = subflows
                .get(subflow_id)
                .ok_or_else(|| RuntimeError::not_found("subflow", subflow_id))?;
            Ok(Box::new(SubflowExecutor::new(
                def,
                registry.clone(),
                subflows.clone(),
                depth,
            )))
        }
        None => registry.instantiate(type_name),
    }
}

struct InnerNode {
    executor: Arc<dyn Executor>,
    ctx: NodeContext,
    type_name: String,
}

/// One instance of a subflow, living as a regular node in an outer flow.
///
/// Messages arriving at instance port k enter the inner graph at
/// `port-input-k`; whatever reaches `port-output-N` leaves the instance on
/// port N. The instance's config is merged into every inner message's
/// variables.
pub struct SubflowExecutor {
    def: SubflowDef,
    registry: Arc<NodeRegistry>,
    subflows: Arc<SubflowLibrary>,
    depth: usize,
    config: Map<String, Value>,
    routes: HashMap<(String, usize), Vec<(String, usize)>>,
    catch_nodes: Vec<(String, Option<Value>)>,
    inner: tokio::sync::RwLock<HashMap<String, InnerNode>>,
    start_order: std::sync::Mutex<Vec<String>>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl SubflowExecutor {
    fn new(
        def: SubflowDef,
        registry: Arc<NodeRegistry>,
        subflows: Arc<SubflowLibrary>,
        depth: usize,
    ) -> Self {
        let mut routes: HashMap<(String, usize), Vec<(String, usize)>> = HashMap::new();
        for conn in &def.connections {
            routes
                .entry((conn.source_node.clone(), conn.source_port))
                .or_default()
                .push((conn.target_node.clone(), conn.target_port));
        }
        let catch_nodes = def
            .nodes
            .iter()
            .filter(|n| n.type_name == "catch")
            .map(|n| (n.id.clone(), n.config.get("scope").cloned()))
            .collect();
        SubflowExecutor {
            def,
            registry,
            subflows,
            depth,
            config: Map::new(),
            routes,
            catch_nodes,
            inner: tokio::sync::RwLock::new(HashMap::new()),
            start_order: std::sync::Mutex::new(Vec::new()),
            cancel: std::sync::Mutex::new(None),
        }
    }

    /// Instance config and its `env` map, merged into inner variables.
    fn merged_variables(&self) -> Vec<(String, Value)> {
        let mut vars = Vec::new();
        for (k, v) in &self.config {
            if k == "env" {
                if let Some(env) = v.as_object() {
                    for (ek, ev) in env {
                        vars.push((ek.clone(), ev.clone()));
                    }
                }
                continue;
            }
            vars.push((k.clone(), v.clone()));
        }
        vars
    }
}

#[async_trait]
impl Executor for SubflowExecutor {
    fn configure(&mut self, config: &Map<String, Value>) -> Result<()> {
        self.config = config.clone();
        Ok(())
    }

    async fn start(&self, ctx: &NodeContext) -> Result<()> {
        let cancel = ctx.cancel.child_token();
        *self.cancel.lock().expect("subflow lock poisoned") = Some(cancel.clone());

        let mut built = HashMap::new();
        let mut order = Vec::new();
        for node in &self.def.nodes {
            let mut executor =
                materialize(&node.type_name, &self.registry, &self.subflows, self.depth + 1)?;
            executor.configure(&node.config)?;
            let inner_ctx = NodeContext::new(
                format!("{}/{}", ctx.node_id, node.id),
                if node.name.is_empty() { node.id.clone() } else { node.name.clone() },
                ctx.flow_id.clone(),
                ctx.context.clone(),
                ctx.bus.clone(),
                cancel.child_token(),
            );
            built.insert(
                node.id.clone(),
                InnerNode {
                    executor: Arc::from(executor),
                    ctx: inner_ctx,
                    type_name: node.type_name.clone(),
                },
            );
            order.push(node.id.clone());
        }

        let mut started: Vec<&str> = Vec::new();
        for node_id in &order {
            let node = &built[node_id];
            if let Err(e) = node.executor.start(&node.ctx).await {
                for prev in started.iter().rev() {
                    let _ = built[*prev].executor.stop().await;
                }
                return Err(RuntimeError::Lifecycle {
                    node_id: node.ctx.node_id.clone(),
                    message: e.to_string(),
                });
            }
            started.push(node_id);
        }

        *self.start_order.lock().expect("subflow lock poisoned") = order;
        *self.inner.write().await = built;
        Ok(())
    }

    async fn execute(&self, ctx: &NodeContext, port: usize, mut msg: Message) -> Result<Vec<Outgoing>> {
        msg.context.subflow_id = Some(self.def.id.clone());
        msg.context.instance_id = Some(ctx.node_id.clone());
        for (k, v) in self.merged_variables() {
            msg.context.variables.insert(k, v);
        }

        let inner = self.inner.read().await;
        let entry = format!("{PORT_INPUT_PREFIX}{port}");
        let mut queue = VecDeque::new();
        if let Some(targets) = self.routes.get(&(entry, 0)) {
            for (target, target_port) in targets {
                queue.push_back((target.clone(), *target_port, msg.fork(), 1usize));
            }
        }

        let mut outputs: Vec<Outgoing> = Vec::new();
        while let Some((node_id, in_port, item_msg, depth)) = queue.pop_front() {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if depth >= MAX_CASCADE_DEPTH {
                return Err(RuntimeError::DepthExceeded(depth));
            }

            if let Some(out_port) = node_id.strip_prefix(PORT_OUTPUT_PREFIX) {
                let out_port: usize = out_port.parse().map_err(|_| {
                    RuntimeError::Validation(format!("bad output port id: {node_id}"))
                })?;
                outputs.push((out_port, item_msg));
                continue;
            }

            let Some(node) = inner.get(&node_id) else {
                tracing::warn!(
                    subflow = %self.def.id,
                    node = %node_id,
                    "inner message routed to unknown node"
                );
                continue;
            };

            match node.executor.execute(&node.ctx, in_port, item_msg.clone()).await {
                Ok(results) => {
                    for (out_port, out_msg) in results {
                        if let Some(targets) = self.routes.get(&(node_id.clone(), out_port)) {
                            for (target, target_port) in targets {
                                queue.push_back((
                                    target.clone(),
                                    *target_port,
                                    out_msg.fork(),
                                    depth + 1,
                                ));
                            }
                        }
                    }
                }
                Err(e) => {
                    let mut handled = false;
                    for (catch_id, scope) in &self.catch_nodes {
                        if catch_id == &node_id || !catch::covers(scope.as_ref(), &node_id) {
                            continue;
                        }
                        let mut err_msg = item_msg.fork();
                        err_msg.metadata.insert(
                            "error".into(),
                            json!({"message": e.to_string(), "source": node_id}),
                        );
                        queue.push_back((catch_id.clone(), 0, err_msg, depth + 1));
                        handled = true;
                    }
                    if !handled {
                        return Err(RuntimeError::Execution(format!(
                            "subflow {} node {node_id}: {e}",
                            self.def.id
                        )));
                    }
                }
            }
        }

        Ok(outputs)
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().expect("subflow lock poisoned").take() {
            cancel.cancel();
        }
        let inner = self.inner.read().await;
        let order = self.start_order.lock().expect("subflow lock poisoned").clone();
        for node_id in order.iter().rev() {
            if let Some(node) = inner.get(node_id) {
                if let Err(e) = node.executor.stop().await {
                    tracing::warn!(
                        subflow = %self.def.id,
                        node = %node_id,
                        node_type = %node.type_name,
                        error = %e,
                        "inner node stop failed"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::memory::MemoryContextStore;
    use crate::message::Payload;
    use crate::registry;

    fn test_env() -> (Arc<NodeRegistry>, Arc<SubflowLibrary>) {
        let registry = NodeRegistry::new();
        registry::register_builtins(&registry).unwrap();
        (Arc::new(registry), Arc::new(SubflowLibrary::new()))
    }

    fn node(id: &str, type_name: &str, config: Value) -> Node {
        Node {
            id: id.into(),
            type_name: type_name.into(),
            name: id.into(),
            config: config.as_object().cloned().unwrap_or_default(),
        }
    }

    fn conn(id: &str, source: &str, source_port: usize, target: &str) -> Connection {
        Connection {
            id: id.into(),
            source_node: source.into(),
            source_port,
            target_node: target.into(),
            target_port: 0,
        }
    }

    fn tagger_def() -> SubflowDef {
        // port-input-0 → change(set payload.tag) → port-output-0
        SubflowDef {
            id: "sf1".into(),
            name: "tagger".into(),
            inputs: 1,
            outputs: 1,
            nodes: vec![node(
                "change-1",
                "change",
                json!({"rules": [{"action": "set", "target": "payload.tag", "value": "inner"}]}),
            )],
            connections: vec![
                conn("c1", "port-input-0", 0, "change-1"),
                conn("c2", "change-1", 0, "port-output-0"),
            ],
        }
    }

    fn instance_ctx(node_id: &str) -> NodeContext {
        NodeContext::new(
            node_id,
            node_id,
            "outer-flow",
            Arc::new(MemoryContextStore::new()),
            Arc::new(crate::bus::MessageBus::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_instance_routes_through_inner_graph() {
        let (registry, subflows) = test_env();
        subflows.insert(tagger_def());

        let mut executor = materialize("subflow:sf1", &registry, &subflows, 0).unwrap();
        executor.configure(json!({}).as_object().unwrap()).unwrap();
        let ctx = instance_ctx("instance-1");
        executor.start(&ctx).await.unwrap();

        let msg = Message::new(Payload::new(json!({"temp": 20})), "outer-flow", "prev");
        let out = executor.execute(&ctx, 0, msg).await.unwrap();

        assert_eq!(out.len(), 1);
        let (port, result) = &out[0];
        assert_eq!(*port, 0);
        assert_eq!(result.payload.get("tag"), Some(&json!("inner")));
        assert_eq!(result.payload.get("temp"), Some(&json!(20)));
        assert_eq!(result.context.subflow_id.as_deref(), Some("sf1"));
        assert_eq!(result.context.instance_id.as_deref(), Some("instance-1"));

        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_instance_config_and_env_merge_into_variables() {
        let (registry, subflows) = test_env();
        subflows.insert(tagger_def());

        let mut executor = materialize("subflow:sf1", &registry, &subflows, 0).unwrap();
        executor
            .configure(
                json!({"region": "eu", "env": {"API_BASE": "https://api.example"}})
                    .as_object()
                    .unwrap(),
            )
            .unwrap();
        let ctx = instance_ctx("instance-1");
        executor.start(&ctx).await.unwrap();

        let msg = Message::new(Payload::null(), "outer-flow", "prev");
        let out = executor.execute(&ctx, 0, msg).await.unwrap();
        let vars = &out[0].1.context.variables;
        assert_eq!(vars["region"], json!("eu"));
        assert_eq!(vars["API_BASE"], json!("https://api.example"));
    }

    #[tokio::test]
    async fn test_unknown_subflow_id() {
        let (registry, subflows) = test_env();
        let err = materialize("subflow:missing", &registry, &subflows, 0).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_nesting_depth_bound() {
        let (registry, subflows) = test_env();
        // A subflow whose inner graph instantiates itself.
        subflows.insert(SubflowDef {
            id: "recursive".into(),
            name: "recursive".into(),
            inputs: 1,
            outputs: 1,
            nodes: vec![node("self-1", "subflow:recursive", json!({}))],
            connections: vec![
                conn("c1", "port-input-0", 0, "self-1"),
                conn("c2", "self-1", 0, "port-output-0"),
            ],
        });

        let mut executor = materialize("subflow:recursive", &registry, &subflows, 0).unwrap();
        executor.configure(json!({}).as_object().unwrap()).unwrap();
        let ctx = instance_ctx("instance-1");
        // Instantiation recurses through start(); the depth bound cuts it.
        let err = executor.start(&ctx).await.unwrap_err();
        assert_eq!(err.code(), "lifecycle");
        assert!(err.to_string().contains("depth"));
    }

    #[tokio::test]
    async fn test_message_reaching_no_output_produces_nothing() {
        let (registry, subflows) = test_env();
        subflows.insert(SubflowDef {
            id: "sink".into(),
            name: "sink".into(),
            inputs: 1,
            outputs: 0,
            nodes: vec![node("debug-1", "debug", json!({}))],
            connections: vec![conn("c1", "port-input-0", 0, "debug-1")],
        });

        let mut executor = materialize("subflow:sink", &registry, &subflows, 0).unwrap();
        executor.configure(json!({}).as_object().unwrap()).unwrap();
        let ctx = instance_ctx("instance-1");
        executor.start(&ctx).await.unwrap();

        let msg = Message::new(Payload::from_str("x"), "outer-flow", "prev");
        let out = executor.execute(&ctx, 0, msg).await.unwrap();
        assert!(out.is_empty());
    }
}
