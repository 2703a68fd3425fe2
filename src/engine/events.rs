use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Error,
}

/// Completed node invocation, as recorded in execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionEvent {
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the engine broadcasts: one event as a node begins (input snapshot)
/// and one as it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ExecutionEvent {
    NodeStarted {
        flow_id: String,
        node_id: String,
        node_name: String,
        node_type: String,
        timestamp: DateTime<Utc>,
        input: Value,
    },
    NodeFinished {
        flow_id: String,
        #[serde(flatten)]
        event: NodeExecutionEvent,
    },
}

impl ExecutionEvent {
    pub fn flow_id(&self) -> &str {
        match self {
            ExecutionEvent::NodeStarted { flow_id, .. } => flow_id,
            ExecutionEvent::NodeFinished { flow_id, .. } => flow_id,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            ExecutionEvent::NodeStarted { node_id, .. } => node_id,
            ExecutionEvent::NodeFinished { event, .. } => &event.node_id,
        }
    }
}
