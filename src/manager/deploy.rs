use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::{Result, RuntimeError};
use crate::model::{Connection, Flow, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Stop everything not in the request, (re)start everything in it.
    Full,
    /// Restart only the flows whose content hash changed.
    Modified,
    /// Restart the single flow named by `flow_id`.
    Flow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub mode: DeployMode,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<ConnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnSpec {
    pub id: String,
    pub source_node: String,
    #[serde(default)]
    pub source_port: usize,
    pub target_node: String,
    #[serde(default)]
    pub target_port: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResponse {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub deployed_flows: Vec<String>,
    pub stopped_flows: Vec<String>,
    pub errors: HashMap<String, String>,
}

impl DeployRequest {
    pub fn validate(&self) -> Result<()> {
        if self.mode == DeployMode::Flow && self.flow_id.is_none() {
            return Err(RuntimeError::Validation(
                "deploy mode 'flow' requires flow_id".into(),
            ));
        }
        if self.flows.is_empty() {
            return Err(RuntimeError::Validation("deploy request has no flows".into()));
        }
        for flow in &self.flows {
            if flow.id.is_empty() {
                return Err(RuntimeError::Validation("flow spec missing id".into()));
            }
            if flow.name.is_empty() {
                return Err(RuntimeError::Validation(format!(
                    "flow {} missing name",
                    flow.id
                )));
            }
            for node in &flow.nodes {
                if node.id.is_empty() || node.type_name.is_empty() {
                    return Err(RuntimeError::Validation(format!(
                        "flow {}: every node needs id and type",
                        flow.id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FlowSpec {
    /// Content hash over everything that affects runtime behavior. Two
    /// specs with equal hashes deploy identically.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "name": self.name,
            "description": self.description,
            "config": self.config,
            "nodes": self.nodes.iter().map(|n| serde_json::json!({
                "id": n.id,
                "type": n.type_name,
                "name": n.name,
                "config": n.config,
            })).collect::<Vec<_>>(),
            "connections": self.connections.iter().map(|c| serde_json::json!({
                "source_node": c.source_node,
                "source_port": c.source_port,
                "target_node": c.target_node,
                "target_port": c.target_port,
            })).collect::<Vec<_>>(),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Materialize a full flow document, preserving `created_at` when the
    /// flow already exists.
    pub fn into_flow(self, existing: Option<&Flow>) -> Flow {
        let now = Utc::now();
        let mut flow = Flow::new(self.id, self.name, self.description);
        flow.config = self.config;
        flow.nodes = self
            .nodes
            .into_iter()
            .map(|n| Node {
                id: n.id,
                type_name: n.type_name,
                name: n.name,
                config: n.config,
            })
            .collect();
        flow.connections = self
            .connections
            .into_iter()
            .map(|c| Connection {
                id: c.id,
                source_node: c.source_node,
                source_port: c.source_port,
                target_node: c.target_node,
                target_port: c.target_port,
            })
            .collect();
        if let Some(existing) = existing {
            flow.created_at = existing.created_at;
        }
        flow.updated_at = now;
        flow
    }
}

/// Spec view of a stored flow, for content comparison on redeploy.
pub fn spec_of(flow: &Flow) -> FlowSpec {
    FlowSpec {
        id: flow.id.clone(),
        name: flow.name.clone(),
        description: flow.description.clone(),
        disabled: false,
        config: flow.config.clone(),
        nodes: flow
            .nodes
            .iter()
            .map(|n| NodeSpec {
                id: n.id.clone(),
                type_name: n.type_name.clone(),
                name: n.name.clone(),
                config: n.config.clone(),
            })
            .collect(),
        connections: flow
            .connections
            .iter()
            .map(|c| ConnSpec {
                id: c.id.clone(),
                source_node: c.source_node.clone(),
                source_port: c.source_port,
                target_node: c.target_node.clone(),
                target_port: c.target_port,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(id: &str) -> FlowSpec {
        FlowSpec {
            id: id.into(),
            name: "Flow".into(),
            description: String::new(),
            disabled: false,
            config: Map::new(),
            nodes: vec![NodeSpec {
                id: "n1".into(),
                type_name: "inject".into(),
                name: "Inject".into(),
                config: json!({"payload": "ping"}).as_object().cloned().unwrap(),
            }],
            connections: vec![],
        }
    }

    #[test]
    fn test_validate_flow_mode_needs_flow_id() {
        let request = DeployRequest {
            mode: DeployMode::Flow,
            flow_id: None,
            version: None,
            flows: vec![spec("f1")],
        };
        assert_eq!(request.validate().unwrap_err().code(), "validation");
    }

    #[test]
    fn test_validate_rejects_empty_flows() {
        let request = DeployRequest {
            mode: DeployMode::Full,
            flow_id: None,
            version: None,
            flows: vec![],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_node_without_type() {
        let mut s = spec("f1");
        s.nodes[0].type_name = String::new();
        let request = DeployRequest {
            mode: DeployMode::Full,
            flow_id: None,
            version: None,
            flows: vec![s],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_content_hash_stable_and_sensitive() {
        let a = spec("f1");
        let b = spec("f1");
        assert_eq!(a.content_hash(), b.content_hash());

        let mut c = spec("f1");
        c.nodes[0].config.insert("payload".into(), json!("pong"));
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_hash_ignores_disabled_flag() {
        let a = spec("f1");
        let mut b = spec("f1");
        b.disabled = true;
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_roundtrip_spec_flow_spec_same_hash() {
        let original = spec("f1");
        let flow = original.clone().into_flow(None);
        let back = spec_of(&flow);
        assert_eq!(original.content_hash(), back.content_hash());
    }

    #[test]
    fn test_request_parses_from_json() {
        let request: DeployRequest = serde_json::from_value(json!({
            "mode": "modified",
            "flows": [{
                "id": "f1",
                "name": "Test",
                "nodes": [{"id": "n1", "type": "inject"}],
                "connections": [
                    {"id": "c1", "source_node": "n1", "target_node": "n2"}
                ]
            }]
        }))
        .unwrap();
        assert_eq!(request.mode, DeployMode::Modified);
        assert_eq!(request.flows[0].connections[0].target_node, "n2");
    }
}
