use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON frame envelope on the tunnel. `command` / `response` pairs are
/// correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Connect,
    Connected,
    Ping,
    Pong,
    Command,
    Response,
}

impl TunnelMessage {
    fn base(kind: FrameKind) -> Self {
        TunnelMessage {
            kind,
            id: None,
            device_id: None,
            api_key: None,
            version: None,
            action: None,
            payload: None,
            status: None,
            data: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn connect(device_id: &str, api_key: &str, version: &str) -> Self {
        TunnelMessage {
            device_id: Some(device_id.to_string()),
            api_key: Some(api_key.to_string()),
            version: Some(version.to_string()),
            ..Self::base(FrameKind::Connect)
        }
    }

    pub fn ping() -> Self {
        Self::base(FrameKind::Ping)
    }

    pub fn pong() -> Self {
        Self::base(FrameKind::Pong)
    }

    pub fn command(id: &str, action: &str, payload: Value) -> Self {
        TunnelMessage {
            id: Some(id.to_string()),
            action: Some(action.to_string()),
            payload: Some(payload),
            ..Self::base(FrameKind::Command)
        }
    }

    pub fn response_success(id: &str, data: Value) -> Self {
        TunnelMessage {
            id: Some(id.to_string()),
            status: Some("success".to_string()),
            data: Some(data),
            ..Self::base(FrameKind::Response)
        }
    }

    pub fn response_error(id: &str, error: &str) -> Self {
        TunnelMessage {
            id: Some(id.to_string()),
            status: Some("error".to_string()),
            error: Some(error.to_string()),
            ..Self::base(FrameKind::Response)
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
