use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Executor, NodeContext, Outgoing};
use crate::error::{Result, RuntimeError};
use crate::message::Message;

/// Conditional router: evaluates `property <operator> value` against the
/// message and emits on port 0 when true, port 1 when false.
///
/// `property` is `payload`, `payload.<field>`, `topic`, or
/// `variables.<name>`.
#[derive(Default)]
pub struct IfNode {
    property: String,
    operator: String,
    value: Value,
}

#[async_trait]
impl Executor for IfNode {
    fn configure(&mut self, config: &Map<String, Value>) -> Result<()> {
        self.property = config
            .get("property")
            .and_then(Value::as_str)
            .unwrap_or("payload")
            .to_string();
        self.operator = config
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::Validation("if node missing 'operator'".into()))?
            .to_string();
        self.value = config.get("value").cloned().unwrap_or(Value::Null);
        match self.operator.as_str() {
            "eq" | "neq" | "gt" | "gte" | "lt" | "lte" | "contains" => Ok(()),
            other => Err(RuntimeError::Validation(format!(
                "if node: unknown operator '{other}'"
            ))),
        }
    }

    async fn execute(&self, _ctx: &NodeContext, _port: usize, msg: Message) -> Result<Vec<Outgoing>> {
        let subject = resolve_property(&self.property, &msg);
        let port = if compare(&self.operator, subject.as_ref(), &self.value) {
            0
        } else {
            1
        };
        Ok(vec![(port, msg)])
    }
}

fn resolve_property(property: &str, msg: &Message) -> Option<Value> {
    match property {
        "payload" => Some(msg.payload.to_value()),
        "topic" => Some(Value::String(msg.topic.clone())),
        _ => {
            if let Some(field) = property.strip_prefix("payload.") {
                msg.payload.get(field).cloned()
            } else if let Some(name) = property.strip_prefix("variables.") {
                msg.context.variables.get(name).cloned()
            } else {
                None
            }
        }
    }
}

fn compare(operator: &str, subject: Option<&Value>, value: &Value) -> bool {
    let Some(subject) = subject else {
        // A missing property only satisfies `neq`.
        return operator == "neq";
    };
    match operator {
        "eq" => subject == value,
        "neq" => subject != value,
        "contains" => match (subject.as_str(), value.as_str()) {
            (Some(s), Some(needle)) => s.contains(needle),
            _ => subject
                .as_array()
                .is_some_and(|arr| arr.contains(value)),
        },
        _ => match (subject.as_f64(), value.as_f64()) {
            (Some(a), Some(b)) => match operator {
                "gt" => a > b,
                "gte" => a >= b,
                "lt" => a < b,
                "lte" => a <= b,
                _ => false,
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::nodes::testing::node_ctx;
    use serde_json::json;

    fn configured(config: Value) -> IfNode {
        let mut node = IfNode::default();
        node.configure(config.as_object().unwrap()).unwrap();
        node
    }

    async fn route(node: &IfNode, payload: Value) -> usize {
        let ctx = node_ctx("if-1", "f1");
        let msg = Message::new(Payload::new(payload), "f1", "n0");
        let out = node.execute(&ctx, 0, msg).await.unwrap();
        assert_eq!(out.len(), 1);
        out[0].0
    }

    #[tokio::test]
    async fn test_numeric_gt_routes_true_branch() {
        let node = configured(json!({"operator": "gt", "value": 50}));
        assert_eq!(route(&node, json!(100)).await, 0);
        assert_eq!(route(&node, json!(10)).await, 1);
    }

    #[tokio::test]
    async fn test_eq_on_payload_field() {
        let node = configured(json!({
            "property": "payload.state",
            "operator": "eq",
            "value": "on"
        }));
        assert_eq!(route(&node, json!({"state": "on"})).await, 0);
        assert_eq!(route(&node, json!({"state": "off"})).await, 1);
    }

    #[tokio::test]
    async fn test_contains_on_string() {
        let node = configured(json!({"operator": "contains", "value": "err"}));
        assert_eq!(route(&node, json!("an error occurred")).await, 0);
        assert_eq!(route(&node, json!("all good")).await, 1);
    }

    #[tokio::test]
    async fn test_missing_property_only_matches_neq() {
        let eq = configured(json!({
            "property": "payload.ghost",
            "operator": "eq",
            "value": 1
        }));
        assert_eq!(route(&eq, json!({})).await, 1);

        let neq = configured(json!({
            "property": "payload.ghost",
            "operator": "neq",
            "value": 1
        }));
        assert_eq!(route(&neq, json!({})).await, 0);
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let mut node = IfNode::default();
        let err = node
            .configure(json!({"operator": "like"}).as_object().unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn test_missing_operator_rejected() {
        let mut node = IfNode::default();
        let err = node
            .configure(json!({}).as_object().unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
