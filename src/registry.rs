use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Map;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::model::Node;
use crate::nodes::Executor;

pub type NodeFactory = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

/// Declared property of a node type, for the editor palette.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSchema {
    pub label: String,
}

/// Catalog entry: display metadata, schemas, and the factory producing
/// executors for this type.
#[derive(Clone)]
pub struct NodeInfo {
    pub type_name: String,
    pub category: String,
    pub label: String,
    pub description: String,
    pub properties: Vec<PropertySchema>,
    pub inputs: Vec<PortSchema>,
    pub outputs: Vec<PortSchema>,
    pub factory: Option<NodeFactory>,
}

impl NodeInfo {
    pub fn new(type_name: impl Into<String>, category: impl Into<String>) -> Self {
        NodeInfo {
            type_name: type_name.into(),
            category: category.into(),
            label: String::new(),
            description: String::new(),
            properties: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            factory: None,
        }
    }

    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }
}

/// Catalog of node types. Append-only after boot; duplicate registration is
/// an error, not a silent overwrite.
#[derive(Default)]
pub struct NodeRegistry {
    types: RwLock<HashMap<String, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry::default()
    }

    pub fn register(&self, info: NodeInfo) -> Result<()> {
        if info.factory.is_none() {
            return Err(RuntimeError::Validation(format!(
                "node type {} has no factory",
                info.type_name
            )));
        }
        let mut types = self.types.write().expect("registry lock poisoned");
        if types.contains_key(&info.type_name) {
            return Err(RuntimeError::DuplicateType(info.type_name));
        }
        types.insert(info.type_name.clone(), info);
        Ok(())
    }

    /// New configured-node document for the given type. The executor is
    /// bound later, at flow assembly.
    pub fn create(&self, type_name: &str, name: &str) -> Result<Node> {
        let types = self.types.read().expect("registry lock poisoned");
        if !types.contains_key(type_name) {
            return Err(RuntimeError::UnknownType(type_name.to_string()));
        }
        Ok(Node {
            id: Uuid::new_v4().to_string(),
            type_name: type_name.to_string(),
            name: name.to_string(),
            config: Map::new(),
        })
    }

    /// Materialize an executor for flow assembly.
    pub fn instantiate(&self, type_name: &str) -> Result<Box<dyn Executor>> {
        let types = self.types.read().expect("registry lock poisoned");
        let info = types
            .get(type_name)
            .ok_or_else(|| RuntimeError::UnknownType(type_name.to_string()))?;
        let factory = info
            .factory
            .as_ref()
            .ok_or_else(|| RuntimeError::Validation(format!("node type {type_name} has no factory")))?;
        Ok(factory())
    }

    pub fn get(&self, type_name: &str) -> Option<NodeInfo> {
        self.types
            .read()
            .expect("registry lock poisoned")
            .get(type_name)
            .cloned()
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        let mut infos: Vec<_> = self
            .types
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        infos
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types
            .read()
            .expect("registry lock poisoned")
            .contains_key(type_name)
    }
}

/// Register the base palette. Called once from `Runtime::init`.
pub fn register_builtins(registry: &NodeRegistry) -> Result<()> {
    registry.register(
        NodeInfo {
            label: "Inject".into(),
            description: "Seeds a message, manually or on a schedule".into(),
            properties: vec![
                PropertySchema {
                    name: "payload".into(),
                    kind: "any".into(),
                    required: false,
                    default: None,
                },
                PropertySchema {
                    name: "topic".into(),
                    kind: "string".into(),
                    required: false,
                    default: None,
                },
                PropertySchema {
                    name: "cron".into(),
                    kind: "string".into(),
                    required: false,
                    default: None,
                },
                PropertySchema {
                    name: "interval".into(),
                    kind: "number".into(),
                    required: false,
                    default: None,
                },
            ],
            outputs: vec![PortSchema { label: "out".into() }],
            ..NodeInfo::new("inject", "input")
        }
        .with_factory(|| Box::new(crate::nodes::inject::InjectNode::default())),
    )?;

    registry.register(
        NodeInfo {
            label: "Debug".into(),
            description: "Logs the message payload, optionally to the log topic".into(),
            properties: vec![
                PropertySchema {
                    name: "complete".into(),
                    kind: "boolean".into(),
                    required: false,
                    default: Some(serde_json::json!(false)),
                },
                PropertySchema {
                    name: "to_log".into(),
                    kind: "boolean".into(),
                    required: false,
                    default: Some(serde_json::json!(false)),
                },
            ],
            inputs: vec![PortSchema { label: "in".into() }],
            ..NodeInfo::new("debug", "output")
        }
        .with_factory(|| Box::new(crate::nodes::debug::DebugNode::default())),
    )?;

    registry.register(
        NodeInfo {
            label: "If".into(),
            description: "Routes by condition: port 0 = true, port 1 = false".into(),
            properties: vec![
                PropertySchema {
                    name: "property".into(),
                    kind: "string".into(),
                    required: false,
                    default: Some(serde_json::json!("payload")),
                },
                PropertySchema {
                    name: "operator".into(),
                    kind: "string".into(),
                    required: true,
                    default: None,
                },
                PropertySchema {
                    name: "value".into(),
                    kind: "any".into(),
                    required: false,
                    default: None,
                },
            ],
            inputs: vec![PortSchema { label: "in".into() }],
            outputs: vec![
                PortSchema { label: "true".into() },
                PortSchema { label: "false".into() },
            ],
            ..NodeInfo::new("if", "logic")
        }
        .with_factory(|| Box::new(crate::nodes::if_node::IfNode::default())),
    )?;

    registry.register(
        NodeInfo {
            label: "Change".into(),
            description: "Sets or deletes payload fields and variables".into(),
            properties: vec![PropertySchema {
                name: "rules".into(),
                kind: "array".into(),
                required: true,
                default: None,
            }],
            inputs: vec![PortSchema { label: "in".into() }],
            outputs: vec![PortSchema { label: "out".into() }],
            ..NodeInfo::new("change", "transform")
        }
        .with_factory(|| Box::new(crate::nodes::change::ChangeNode::default())),
    )?;

    registry.register(
        NodeInfo {
            label: "Catch".into(),
            description: "Receives errors raised by covered nodes".into(),
            properties: vec![PropertySchema {
                name: "scope".into(),
                kind: "any".into(),
                required: false,
                default: Some(serde_json::json!("all")),
            }],
            outputs: vec![PortSchema { label: "out".into() }],
            ..NodeInfo::new("catch", "logic")
        }
        .with_factory(|| Box::new(crate::nodes::catch::CatchNode::default())),
    )?;

    Ok(())
}
