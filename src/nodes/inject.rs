use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use super::{Executor, NodeContext, Outgoing};
use crate::error::Result;
use crate::message::{Message, Payload};

/// Source node: emits its configured payload when triggered, either
/// manually or by a scheduler tick. `cron` / `interval` config keys are
/// read by the manager at flow start to register triggers; the executor
/// itself only shapes the outgoing message.
#[derive(Default)]
pub struct InjectNode {
    payload: Option<Value>,
    topic: String,
}

#[async_trait]
impl Executor for InjectNode {
    fn configure(&mut self, config: &Map<String, Value>) -> Result<()> {
        self.payload = config.get("payload").cloned();
        self.topic = config
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(())
    }

    async fn execute(&self, _ctx: &NodeContext, _port: usize, mut msg: Message) -> Result<Vec<Outgoing>> {
        let payload = match &self.payload {
            Some(v) => Payload::new(v.clone()),
            // No configured payload: emit the trigger time in epoch millis.
            None => Payload::new(Value::from(Utc::now().timestamp_millis())),
        };
        msg.payload = payload;
        if !self.topic.is_empty() {
            msg.topic = self.topic.clone();
        }
        Ok(vec![(0, msg)])
    }
}
