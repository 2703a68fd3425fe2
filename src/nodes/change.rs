use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Executor, NodeContext, Outgoing};
use crate::error::{Result, RuntimeError};
use crate::message::Message;

/// Transform node: applies set/delete rules to payload fields, the topic,
/// or message variables, then forwards on port 0.
#[derive(Default)]
pub struct ChangeNode {
    rules: Vec<Rule>,
}

enum Rule {
    SetPayloadField { field: String, value: Value },
    SetPayload { value: Value },
    SetTopic { value: String },
    SetVariable { name: String, value: Value },
    DeletePayloadField { field: String },
    DeleteVariable { name: String },
}

#[async_trait]
impl Executor for ChangeNode {
    fn configure(&mut self, config: &Map<String, Value>) -> Result<()> {
        let rules = config
            .get("rules")
            .and_then(Value::as_array)
            .ok_or_else(|| RuntimeError::Validation("change node missing 'rules'".into()))?;

        self.rules = rules.iter().map(parse_rule).collect::<Result<_>>()?;
        Ok(())
    }

    async fn execute(&self, _ctx: &NodeContext, _port: usize, mut msg: Message) -> Result<Vec<Outgoing>> {
        for rule in &self.rules {
            match rule {
                Rule::SetPayloadField { field, value } => msg.payload.set(field, value.clone()),
                Rule::SetPayload { value } => msg.payload = value.clone().into(),
                Rule::SetTopic { value } => msg.topic = value.clone(),
                Rule::SetVariable { name, value } => {
                    msg.context.variables.insert(name.clone(), value.clone());
                }
                Rule::DeletePayloadField { field } => msg.payload.remove(field),
                Rule::DeleteVariable { name } => {
                    msg.context.variables.remove(name);
                }
            }
        }
        Ok(vec![(0, msg)])
    }
}

fn parse_rule(raw: &Value) -> Result<Rule> {
    let action = raw["action"].as_str().unwrap_or("set");
    let target = raw["target"]
        .as_str()
        .ok_or_else(|| RuntimeError::Validation("change rule missing 'target'".into()))?;

    match action {
        "set" => {
            let value = raw["value"].clone();
            if target == "payload" {
                Ok(Rule::SetPayload { value })
            } else if target == "topic" {
                let value = value
                    .as_str()
                    .ok_or_else(|| RuntimeError::Validation("topic value must be a string".into()))?
                    .to_string();
                Ok(Rule::SetTopic { value })
            } else if let Some(field) = target.strip_prefix("payload.") {
                Ok(Rule::SetPayloadField {
                    field: field.to_string(),
                    value,
                })
            } else if let Some(name) = target.strip_prefix("variables.") {
                Ok(Rule::SetVariable {
                    name: name.to_string(),
                    value,
                })
            } else {
                Err(RuntimeError::Validation(format!(
                    "change rule: unknown target '{target}'"
                )))
            }
        }
        "delete" => {
            if let Some(field) = target.strip_prefix("payload.") {
                Ok(Rule::DeletePayloadField {
                    field: field.to_string(),
                })
            } else if let Some(name) = target.strip_prefix("variables.") {
                Ok(Rule::DeleteVariable {
                    name: name.to_string(),
                })
            } else {
                Err(RuntimeError::Validation(format!(
                    "change rule: cannot delete '{target}'"
                )))
            }
        }
        other => Err(RuntimeError::Validation(format!(
            "change rule: unknown action '{other}'"
        ))),
    }
}
