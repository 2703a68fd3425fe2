pub mod catch;
pub mod change;
pub mod debug;
pub mod if_node;
pub mod inject;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::context::ContextStore;
use crate::error::Result;
use crate::message::Message;

/// A message produced by an executor, tagged with the output port it
/// leaves on. Port 0 is the default route.
pub type Outgoing = (usize, Message);

/// The behavior behind a node type.
///
/// Lifecycle: `configure` once after creation, `start` when the owning flow
/// starts, `execute` per inbound message, `stop` on flow stop or removal.
/// The engine never calls `execute` outside `[start, stop)`. `port` is the
/// input port the message arrived on. Long-running `execute` bodies are
/// expected to observe `ctx.cancel`.
#[async_trait]
pub trait Executor: Send + Sync {
    fn configure(&mut self, config: &Map<String, Value>) -> Result<()> {
        let _ = config;
        Ok(())
    }

    async fn start(&self, ctx: &NodeContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn execute(&self, ctx: &NodeContext, port: usize, msg: Message) -> Result<Vec<Outgoing>>;

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn Executor>")
    }
}

/// Per-node runtime handle passed into every lifecycle call.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub node_name: String,
    pub flow_id: String,
    pub context: Arc<dyn ContextStore>,
    pub bus: Arc<MessageBus>,
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        flow_id: impl Into<String>,
        context: Arc<dyn ContextStore>,
        bus: Arc<MessageBus>,
        cancel: CancellationToken,
    ) -> Self {
        NodeContext {
            node_id: node_id.into(),
            node_name: node_name.into(),
            flow_id: flow_id.into(),
            context,
            bus,
            cancel,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::context::memory::MemoryContextStore;

    /// Context wired to a throwaway in-memory store and bus.
    pub fn node_ctx(node_id: &str, flow_id: &str) -> NodeContext {
        node_ctx_with_bus(node_id, flow_id, Arc::new(MessageBus::new()))
    }

    pub fn node_ctx_with_bus(node_id: &str, flow_id: &str, bus: Arc<MessageBus>) -> NodeContext {
        NodeContext::new(
            node_id,
            node_id,
            flow_id,
            Arc::new(MemoryContextStore::new()),
            bus,
            CancellationToken::new(),
        )
    }
}
