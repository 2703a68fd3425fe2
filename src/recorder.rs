use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{MessageBus, Topic};
use crate::engine::events::{ExecutionEvent, NodeExecutionEvent, NodeStatus};

pub const MAX_RECORDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Running,
    Completed,
    Failed,
}

/// One flow run: opened on flow start, appended to per node event, closed
/// on flow stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub status: RecordStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub node_events: Vec<NodeExecutionEvent>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub error_nodes: usize,
}

#[derive(Default)]
struct RecorderState {
    records: VecDeque<ExecutionRecord>,
}

impl RecorderState {
    fn open_record_mut(&mut self, flow_id: &str) -> Option<&mut ExecutionRecord> {
        self.records
            .iter_mut()
            .rev()
            .find(|r| r.flow_id == flow_id && r.status == RecordStatus::Running)
    }
}

/// Ring-buffered history of flow runs, fed by execution events on the bus.
pub struct ExecutionRecorder {
    state: Arc<RwLock<RecorderState>>,
    consumer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for ExecutionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionRecorder {
    pub fn new() -> Self {
        ExecutionRecorder {
            state: Arc::new(RwLock::new(RecorderState::default())),
            consumer: std::sync::Mutex::new(None),
        }
    }

    /// Subscribe to the execution topic and start aggregating node events
    /// into the open record of their flow.
    pub fn start(&self, bus: &MessageBus) {
        let mut sub = bus.subscribe(Topic::Execution);
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let parsed: ExecutionEvent = match serde_json::from_value(event.payload) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring malformed execution event");
                        continue;
                    }
                };
                let ExecutionEvent::NodeFinished { flow_id, event } = parsed else {
                    continue;
                };
                let mut state = state.write().await;
                if let Some(record) = state.open_record_mut(&flow_id) {
                    match event.status {
                        NodeStatus::Success => record.completed_nodes += 1,
                        NodeStatus::Error => record.error_nodes += 1,
                    }
                    record.node_events.push(event);
                }
            }
        });
        *self.consumer.lock().expect("recorder lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.consumer.lock().expect("recorder lock poisoned").take() {
            handle.abort();
        }
    }

    /// Open a new running record for a flow. Ring-buffered: the oldest
    /// record falls off past the cap.
    pub async fn begin(&self, flow_id: &str, flow_name: &str, total_nodes: usize) -> String {
        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            flow_name: flow_name.to_string(),
            status: RecordStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            node_events: Vec::new(),
            total_nodes,
            completed_nodes: 0,
            error_nodes: 0,
        };
        let id = record.id.clone();
        let mut state = self.state.write().await;
        state.records.push_back(record);
        while state.records.len() > MAX_RECORDS {
            state.records.pop_front();
        }
        id
    }

    pub async fn finish(&self, record_id: &str, status: RecordStatus) {
        let mut state = self.state.write().await;
        if let Some(record) = state.records.iter_mut().find(|r| r.id == record_id) {
            let ended = Utc::now();
            record.status = status;
            record.ended_at = Some(ended);
            record.duration_ms =
                Some((ended - record.started_at).num_milliseconds().max(0) as u64);
        }
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Vec<ExecutionRecord> {
        let state = self.state.read().await;
        state.records.iter().rev().take(limit).cloned().collect()
    }

    pub async fn get(&self, record_id: &str) -> Option<ExecutionRecord> {
        let state = self.state.read().await;
        state.records.iter().find(|r| r.id == record_id).cloned()
    }

    pub async fn for_flow(&self, flow_id: &str, limit: usize) -> Vec<ExecutionRecord> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .rev()
            .filter(|r| r.flow_id == flow_id)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished_event(flow_id: &str, node_id: &str, status: NodeStatus) -> serde_json::Value {
        serde_json::to_value(ExecutionEvent::NodeFinished {
            flow_id: flow_id.into(),
            event: NodeExecutionEvent {
                node_id: node_id.into(),
                node_name: node_id.into(),
                node_type: "debug".into(),
                status,
                execution_time_ms: 1,
                timestamp: Utc::now(),
                input: None,
                output: Some(json!("out")),
                error: None,
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_begin_finish_lifecycle() {
        let recorder = ExecutionRecorder::new();
        let id = recorder.begin("f1", "Flow One", 2).await;

        let open = recorder.get(&id).await.unwrap();
        assert_eq!(open.status, RecordStatus::Running);
        assert_eq!(open.total_nodes, 2);

        recorder.finish(&id, RecordStatus::Completed).await;
        let done = recorder.get(&id).await.unwrap();
        assert_eq!(done.status, RecordStatus::Completed);
        assert!(done.ended_at.is_some());
        assert!(done.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_bus_events_aggregate_into_open_record() {
        let bus = MessageBus::new();
        let recorder = ExecutionRecorder::new();
        recorder.start(&bus);
        let id = recorder.begin("f1", "Flow One", 2).await;

        bus.publish(Topic::Execution, finished_event("f1", "n1", NodeStatus::Success));
        bus.publish(Topic::Execution, finished_event("f1", "n2", NodeStatus::Error));
        // Another flow's event must not land in f1's record.
        bus.publish(Topic::Execution, finished_event("f2", "x", NodeStatus::Success));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let record = recorder.get(&id).await.unwrap();
        assert_eq!(record.completed_nodes, 1);
        assert_eq!(record.error_nodes, 1);
        assert_eq!(record.node_events.len(), 2);
        recorder.stop();
    }

    #[tokio::test]
    async fn test_ring_buffer_cap() {
        let recorder = ExecutionRecorder::new();
        for i in 0..(MAX_RECORDS + 20) {
            recorder.begin("f1", &format!("run {i}"), 0).await;
        }
        let all = recorder.list(usize::MAX).await;
        assert_eq!(all.len(), MAX_RECORDS);
        // Newest first
        assert_eq!(all[0].flow_name, format!("run {}", MAX_RECORDS + 19));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let recorder = ExecutionRecorder::new();
        let a = recorder.begin("f1", "a", 0).await;
        let b = recorder.begin("f1", "b", 0).await;
        let list = recorder.list(10).await;
        assert_eq!(list[0].id, b);
        assert_eq!(list[1].id, a);
    }
}
