use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Executor, NodeContext, Outgoing};
use crate::bus::Topic;
use crate::error::Result;
use crate::message::Message;

/// Sink node: logs the payload of every message it receives, and
/// republishes it on the bus `log` topic when `to_log` is set. Consumes
/// the message; nothing is routed onward.
#[derive(Default)]
pub struct DebugNode {
    complete: bool,
    to_log: bool,
}

#[async_trait]
impl Executor for DebugNode {
    fn configure(&mut self, config: &Map<String, Value>) -> Result<()> {
        // complete=true logs the whole message, not just the payload
        self.complete = config
            .get("complete")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.to_log = config
            .get("to_log")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(())
    }

    async fn execute(&self, ctx: &NodeContext, _port: usize, msg: Message) -> Result<Vec<Outgoing>> {
        if self.complete {
            tracing::info!(
                node = %ctx.node_name,
                flow = %ctx.flow_id,
                msgid = %msg.msgid(),
                topic = %msg.topic,
                payload = %msg.payload.to_value(),
                "debug"
            );
        } else {
            tracing::info!(
                node = %ctx.node_name,
                flow = %ctx.flow_id,
                payload = %msg.payload.to_value(),
                "debug"
            );
        }
        if self.to_log {
            ctx.bus.publish(
                Topic::Log,
                json!({
                    "node": ctx.node_name,
                    "flow": ctx.flow_id,
                    "payload": msg.payload.to_value(),
                }),
            );
        }
        Ok(vec![])
    }
}
