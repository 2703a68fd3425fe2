use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Executor, NodeContext, Outgoing};
use crate::error::Result;
use crate::message::Message;

/// Error handler node. The engine synthesizes a message carrying
/// `metadata.error = {message, source_node_id}` when a covered node fails;
/// this executor simply forwards it so downstream nodes can react.
///
/// Coverage is decided by the engine from the node's `scope` config:
/// `"all"` (default) or an array of node ids.
#[derive(Default)]
pub struct CatchNode;

/// Whether a catch node with the given `scope` config covers `node_id`.
pub fn covers(scope: Option<&Value>, node_id: &str) -> bool {
    match scope {
        None => true,
        Some(Value::String(s)) => s == "all",
        Some(Value::Array(ids)) => ids.iter().any(|v| v.as_str() == Some(node_id)),
        Some(_) => false,
    }
}

#[async_trait]
impl Executor for CatchNode {
    fn configure(&mut self, _config: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &NodeContext, _port: usize, msg: Message) -> Result<Vec<Outgoing>> {
        Ok(vec![(0, msg)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_scope_covers_everything() {
        assert!(covers(None, "any-node"));
        assert!(covers(Some(&json!("all")), "any-node"));
    }

    #[test]
    fn test_scoped_to_node_list() {
        let scope = json!(["n1", "n2"]);
        assert!(covers(Some(&scope), "n1"));
        assert!(!covers(Some(&scope), "n3"));
    }

    #[test]
    fn test_unrecognized_scope_covers_nothing() {
        assert!(!covers(Some(&json!(42)), "n1"));
        assert!(!covers(Some(&json!("self")), "n1"));
    }
}
