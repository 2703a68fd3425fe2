use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::RuntimeError;

pub const MSGID_KEY: &str = "msgid";

/// The unit of dataflow between nodes.
///
/// `metadata` always carries a unique `msgid`. Forking a message for a new
/// delivery deep-copies everything and assigns a fresh msgid; the variables
/// map is copied, never aliased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub context: MessageContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub source_node_id: String,
    #[serde(default)]
    pub source_port: usize,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl Message {
    pub fn new(payload: Payload, flow_id: impl Into<String>, source_node_id: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(MSGID_KEY.into(), Value::String(Uuid::new_v4().to_string()));
        Message {
            payload,
            topic: String::new(),
            metadata,
            context: MessageContext {
                flow_id: flow_id.into(),
                subflow_id: None,
                instance_id: None,
                source_node_id: source_node_id.into(),
                source_port: 0,
                variables: HashMap::new(),
            },
        }
    }

    pub fn msgid(&self) -> &str {
        self.metadata
            .get(MSGID_KEY)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Deep copy with a fresh msgid. Used for every routed delivery so two
    /// downstream nodes never observe each other's mutations.
    pub fn fork(&self) -> Self {
        let mut copy = self.clone();
        copy.metadata.insert(
            MSGID_KEY.into(),
            Value::String(Uuid::new_v4().to_string()),
        );
        copy
    }
}

/// Opaque structured payload.
///
/// Executors read it through the typed accessors; the underlying JSON value
/// never appears in other components' signatures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub fn new(value: Value) -> Self {
        Payload(value)
    }

    pub fn null() -> Self {
        Payload(Value::Null)
    }

    pub fn from_str(s: impl Into<String>) -> Self {
        Payload(Value::String(s.into()))
    }

    pub fn as_str(&self) -> Result<&str, RuntimeError> {
        self.0.as_str().ok_or(RuntimeError::TypeMismatch {
            expected: "string",
            actual: json_type(&self.0),
        })
    }

    pub fn as_f64(&self) -> Result<f64, RuntimeError> {
        self.0.as_f64().ok_or(RuntimeError::TypeMismatch {
            expected: "number",
            actual: json_type(&self.0),
        })
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        self.0.as_bool().ok_or(RuntimeError::TypeMismatch {
            expected: "boolean",
            actual: json_type(&self.0),
        })
    }

    pub fn as_object(&self) -> Result<&Map<String, Value>, RuntimeError> {
        self.0.as_object().ok_or(RuntimeError::TypeMismatch {
            expected: "object",
            actual: json_type(&self.0),
        })
    }

    pub fn as_array(&self) -> Result<&Vec<Value>, RuntimeError> {
        self.0.as_array().ok_or(RuntimeError::TypeMismatch {
            expected: "array",
            actual: json_type(&self.0),
        })
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Raw value, for serialization boundaries only (events, wire frames).
    pub fn to_value(&self) -> Value {
        self.0.clone()
    }

    /// Fetch a field of an object payload. Null payloads read as empty.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.as_object().and_then(|m| m.get(key))
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        if let Some(map) = self.0.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(map) = self.0.as_object_mut() {
            map.remove(key);
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload(value)
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_has_msgid() {
        let msg = Message::new(Payload::from_str("ping"), "f1", "n1");
        assert!(!msg.msgid().is_empty());
        assert_eq!(msg.context.flow_id, "f1");
        assert_eq!(msg.context.source_node_id, "n1");
    }

    #[test]
    fn test_fork_assigns_fresh_msgid() {
        let mut msg = Message::new(Payload::new(json!({"a": 1})), "f1", "n1");
        msg.context
            .variables
            .insert("k".into(), json!("v"));

        let fork = msg.fork();
        assert_ne!(msg.msgid(), fork.msgid());
        assert_eq!(fork.payload.to_value(), json!({"a": 1}));
        assert_eq!(fork.context.variables["k"], json!("v"));
    }

    #[test]
    fn test_fork_copies_variables_not_aliases() {
        let msg = Message::new(Payload::null(), "f1", "n1");
        let mut fork = msg.fork();
        fork.context.variables.insert("only-fork".into(), json!(1));
        assert!(!msg.context.variables.contains_key("only-fork"));
    }

    #[test]
    fn test_payload_typed_accessors() {
        let p = Payload::new(json!(42.5));
        assert_eq!(p.as_f64().unwrap(), 42.5);
        let err = p.as_str().unwrap_err();
        assert_eq!(err.code(), "type_mismatch");
        assert!(err.to_string().contains("expected string, got number"));
    }

    #[test]
    fn test_payload_object_set_get() {
        let mut p = Payload::null();
        p.set("count", json!(3));
        assert_eq!(p.get("count"), Some(&json!(3)));
        p.remove("count");
        assert!(p.get("count").is_none());
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::new(Payload::new(json!({"temp": 21.5})), "f1", "inject-1");
        let s = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed.msgid(), msg.msgid());
        assert_eq!(parsed.payload.get("temp"), Some(&json!(21.5)));
    }
}
