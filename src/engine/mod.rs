pub mod events;
pub mod subflow;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, Topic};
use crate::context::ContextStore;
use crate::error::{Result, RuntimeError};
use crate::message::{Message, Payload};
use crate::model::{Flow, Node};
use crate::nodes::{Executor, NodeContext};
use crate::registry::NodeRegistry;
use events::{ExecutionEvent, NodeExecutionEvent, NodeStatus};
use subflow::SubflowLibrary;

/// Hop bound per cascade; a graph that keeps producing past this is cut off
/// and the flow keeps running.
pub const MAX_CASCADE_DEPTH: usize = 256;

/// Upper bound on concurrently processed cascades per engine.
pub const MAX_CONCURRENT_CASCADES: usize = 16;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub type ExecutionCallback = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Running,
    Stopped,
    Error,
}

struct EngineNode {
    model: Node,
    executor: Arc<dyn Executor>,
    ctx: NodeContext,
}

struct WorkItem {
    node_id: String,
    port: usize,
    msg: Message,
    depth: usize,
}

/// Per-flow DAG evaluator.
///
/// Owns the bound executors for one deployed flow, routes messages along
/// the flow's connections, and broadcasts execution events. One engine
/// instance serves one `start`..`stop` lifetime; a stopped or errored
/// engine is never restarted.
pub struct FlowEngine {
    flow_id: String,
    flow_name: String,
    nodes: HashMap<String, EngineNode>,
    start_order: Vec<String>,
    routes: HashMap<(String, usize), Vec<(String, usize)>>,
    catch_nodes: Vec<(String, Option<Value>)>,
    state: RwLock<EngineState>,
    cancel: CancellationToken,
    bus: Arc<MessageBus>,
    callback: RwLock<Option<ExecutionCallback>>,
    cascades: Semaphore,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl FlowEngine {
    /// Build an engine for a validated flow: materialize and configure one
    /// executor per node, index the connections in insertion order.
    pub fn assemble(
        flow: &Flow,
        registry: &Arc<NodeRegistry>,
        subflows: &Arc<SubflowLibrary>,
        bus: Arc<MessageBus>,
        context: Arc<dyn ContextStore>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        flow.validate()?;
        let cancel = parent.child_token();

        let mut nodes = HashMap::new();
        let mut start_order = Vec::with_capacity(flow.nodes.len());
        for node in &flow.nodes {
            let mut executor = subflow::materialize(&node.type_name, registry, subflows, 0)?;
            executor.configure(&node.config)?;
            let ctx = NodeContext::new(
                node.id.clone(),
                if node.name.is_empty() { node.id.clone() } else { node.name.clone() },
                flow.id.clone(),
                context.clone(),
                bus.clone(),
                cancel.child_token(),
            );
            start_order.push(node.id.clone());
            nodes.insert(
                node.id.clone(),
                EngineNode {
                    model: node.clone(),
                    executor: Arc::from(executor),
                    ctx,
                },
            );
        }

        let mut routes: HashMap<(String, usize), Vec<(String, usize)>> = HashMap::new();
        for conn in &flow.connections {
            routes
                .entry((conn.source_node.clone(), conn.source_port))
                .or_default()
                .push((conn.target_node.clone(), conn.target_port));
        }

        let catch_nodes = flow
            .nodes
            .iter()
            .filter(|n| n.type_name == "catch")
            .map(|n| (n.id.clone(), n.config.get("scope").cloned()))
            .collect();

        let permits = flow.nodes.len().clamp(1, MAX_CONCURRENT_CASCADES);

        Ok(FlowEngine {
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            nodes,
            start_order,
            routes,
            catch_nodes,
            state: RwLock::new(EngineState::Idle),
            cancel,
            bus,
            callback: RwLock::new(None),
            cascades: Semaphore::new(permits),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn is_running(&self) -> bool {
        *self.state.read().expect("engine state poisoned") == EngineState::Running
    }

    /// Install the engine callback. Safe in any state; replaces a previous
    /// callback.
    pub fn set_callback(&self, cb: ExecutionCallback) {
        *self.callback.write().expect("engine state poisoned") = Some(cb);
    }

    fn detach_callback(&self) {
        *self.callback.write().expect("engine state poisoned") = None;
    }

    /// Start every node. A node failing to start rolls back the ones
    /// already started and leaves the engine in its terminal error state.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().expect("engine state poisoned");
            match *state {
                EngineState::Idle => *state = EngineState::Running,
                EngineState::Running => {
                    return Err(RuntimeError::AlreadyRunning(self.flow_id.clone()));
                }
                EngineState::Stopped | EngineState::Error => {
                    return Err(RuntimeError::Terminal(self.flow_id.clone()));
                }
            }
        }

        let mut started: Vec<&str> = Vec::new();
        for node_id in &self.start_order {
            let node = &self.nodes[node_id];
            if let Err(e) = node.executor.start(&node.ctx).await {
                tracing::error!(
                    flow = %self.flow_name,
                    node = %node_id,
                    error = %e,
                    "node failed to start"
                );
                for prev in started.iter().rev() {
                    if let Err(stop_err) = self.nodes[*prev].executor.stop().await {
                        tracing::warn!(node = %prev, error = %stop_err, "rollback stop failed");
                    }
                }
                *self.state.write().expect("engine state poisoned") = EngineState::Error;
                self.publish_flow_status("error");
                return Err(RuntimeError::Lifecycle {
                    node_id: node_id.clone(),
                    message: e.to_string(),
                });
            }
            started.push(node_id);
        }

        tracing::info!(flow = %self.flow_name, nodes = self.nodes.len(), "flow started");
        self.publish_flow_status("running");
        Ok(())
    }

    /// Stop the engine: detach the callback first so no event outlives this
    /// call, cancel in-flight work, then stop every node.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().expect("engine state poisoned");
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::Stopped;
        }

        self.detach_callback();
        self.cancel.cancel();

        let deadline = Instant::now() + STOP_TIMEOUT;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    flow = %self.flow_name,
                    stragglers = self.in_flight.load(Ordering::Acquire),
                    "stop timeout reached, detaching in-flight executions"
                );
                break;
            }
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }

        for node_id in self.start_order.iter().rev() {
            if let Err(e) = self.nodes[node_id].executor.stop().await {
                tracing::warn!(flow = %self.flow_name, node = %node_id, error = %e, "node stop failed");
            }
        }

        tracing::info!(flow = %self.flow_name, "flow stopped");
        self.publish_flow_status("stopped");
    }

    /// Deliver a seed message into a source node and drive the resulting
    /// cascade to completion.
    pub async fn inject(&self, node_id: &str) -> Result<()> {
        let msg = Message::new(Payload::null(), self.flow_id.clone(), node_id);
        self.inject_message(node_id, msg).await
    }

    pub async fn inject_message(&self, node_id: &str, msg: Message) -> Result<()> {
        if !self.is_running() {
            return Err(RuntimeError::Execution(format!(
                "flow {} is not running",
                self.flow_id
            )));
        }
        if !self.nodes.contains_key(node_id) {
            return Err(RuntimeError::not_found("node", node_id));
        }

        let _permit = self
            .cascades
            .acquire()
            .await
            .map_err(|_| RuntimeError::Execution("engine shutting down".into()))?;

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let result = self.run_cascade(node_id, msg).await;
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
        result
    }

    /// FIFO work-queue evaluation of one cascade. Side effects at a node
    /// complete before any of that message's downstream deliveries begin.
    async fn run_cascade(&self, start_node: &str, seed: Message) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back(WorkItem {
            node_id: start_node.to_string(),
            port: 0,
            msg: seed,
            depth: 0,
        });

        while let Some(item) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if item.depth >= MAX_CASCADE_DEPTH {
                self.bus.publish(
                    Topic::Log,
                    json!({
                        "level": "error",
                        "flow_id": self.flow_id,
                        "message": format!("cascade depth limit reached at node {}", item.node_id),
                    }),
                );
                return Err(RuntimeError::DepthExceeded(item.depth));
            }

            let Some(node) = self.nodes.get(&item.node_id) else {
                tracing::warn!(flow = %self.flow_name, node = %item.node_id, "message routed to unknown node");
                continue;
            };

            let outputs = match self.execute_node(node, item.port, item.msg).await {
                Ok(outputs) => outputs,
                Err((failed_input, error)) => {
                    // The failed message is never re-routed; covering catch
                    // nodes get a synthesized error message instead.
                    self.enqueue_catch(&mut queue, &item.node_id, &failed_input, &error, item.depth);
                    continue;
                }
            };

            for (out_port, out_msg) in outputs {
                if let Some(targets) = self.routes.get(&(item.node_id.clone(), out_port)) {
                    for (target, target_port) in targets {
                        queue.push_back(WorkItem {
                            node_id: target.clone(),
                            port: *target_port,
                            msg: out_msg.fork(),
                            depth: item.depth + 1,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute_node(
        &self,
        node: &EngineNode,
        port: usize,
        msg: Message,
    ) -> std::result::Result<Vec<(usize, Message)>, (Message, RuntimeError)> {
        let input = json!({
            "payload": msg.payload.to_value(),
            "topic": msg.topic,
        });
        self.emit(ExecutionEvent::NodeStarted {
            flow_id: self.flow_id.clone(),
            node_id: node.model.id.clone(),
            node_name: node.ctx.node_name.clone(),
            node_type: node.model.type_name.clone(),
            timestamp: Utc::now(),
            input: input.clone(),
        });

        let input_msg = msg.clone();
        let started = Instant::now();
        let result = node.executor.execute(&node.ctx, port, msg).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outputs) => {
                let output = outputs.first().map(|(p, m)| {
                    json!({
                        "payload": m.payload.to_value(),
                        "topic": m.topic,
                        "port": p,
                    })
                });
                self.emit(ExecutionEvent::NodeFinished {
                    flow_id: self.flow_id.clone(),
                    event: NodeExecutionEvent {
                        node_id: node.model.id.clone(),
                        node_name: node.ctx.node_name.clone(),
                        node_type: node.model.type_name.clone(),
                        status: NodeStatus::Success,
                        execution_time_ms: elapsed_ms,
                        timestamp: Utc::now(),
                        input: Some(input),
                        output,
                        error: None,
                    },
                });
                Ok(outputs)
            }
            Err(e) => {
                tracing::warn!(
                    flow = %self.flow_name,
                    node = %node.model.id,
                    error = %e,
                    "node execution failed"
                );
                self.emit(ExecutionEvent::NodeFinished {
                    flow_id: self.flow_id.clone(),
                    event: NodeExecutionEvent {
                        node_id: node.model.id.clone(),
                        node_name: node.ctx.node_name.clone(),
                        node_type: node.model.type_name.clone(),
                        status: NodeStatus::Error,
                        execution_time_ms: elapsed_ms,
                        timestamp: Utc::now(),
                        input: Some(input),
                        output: None,
                        error: Some(e.to_string()),
                    },
                });
                Err((input_msg, e))
            }
        }
    }

    fn enqueue_catch(
        &self,
        queue: &mut VecDeque<WorkItem>,
        failed_node: &str,
        failed_input: &Message,
        error: &RuntimeError,
        depth: usize,
    ) {
        for (catch_id, scope) in &self.catch_nodes {
            if catch_id == failed_node {
                continue;
            }
            if !crate::nodes::catch::covers(scope.as_ref(), failed_node) {
                continue;
            }
            let mut err_msg = failed_input.fork();
            err_msg.metadata.insert(
                "error".into(),
                json!({
                    "message": error.to_string(),
                    "source": failed_node,
                }),
            );
            err_msg.context.source_node_id = failed_node.to_string();
            queue.push_back(WorkItem {
                node_id: catch_id.clone(),
                port: 0,
                msg: err_msg,
                depth: depth + 1,
            });
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(cb) = self.callback.read().expect("engine state poisoned").as_ref() {
            cb(&event);
        }
        match serde_json::to_value(&event) {
            Ok(payload) => self.bus.publish(Topic::Execution, payload),
            Err(e) => tracing::debug!(error = %e, "failed to serialize execution event"),
        }
    }

    fn publish_flow_status(&self, status: &str) {
        self.bus.publish(
            Topic::FlowStatus,
            json!({
                "flow_id": self.flow_id,
                "flow_name": self.flow_name,
                "status": status,
            }),
        );
    }
}
