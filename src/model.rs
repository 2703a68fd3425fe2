use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RuntimeError;

/// A named DAG of nodes, deployed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub config: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Idle,
    Running,
    Stopped,
    Error,
}

/// A configured instance of a registered node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Directed edge with typed ports. Multiple edges from one `(node, port)`
/// broadcast; multiple edges into one `(node, port)` multiplex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source_node: String,
    #[serde(default)]
    pub source_port: usize,
    pub target_node: String,
    #[serde(default)]
    pub target_port: usize,
}

impl Flow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Flow {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: FlowStatus::Idle,
            nodes: Vec::new(),
            connections: Vec::new(),
            config: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Node ids must be unique and every connection endpoint must refer to
    /// a node present in the flow.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(RuntimeError::Validation(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }
        for conn in &self.connections {
            if self.node(&conn.source_node).is_none() {
                return Err(RuntimeError::Validation(format!(
                    "connection {} references missing source node {}",
                    conn.id, conn.source_node
                )));
            }
            if self.node(&conn.target_node).is_none() {
                return Err(RuntimeError::Validation(format!(
                    "connection {} references missing target node {}",
                    conn.id, conn.target_node
                )));
            }
        }
        Ok(())
    }
}
