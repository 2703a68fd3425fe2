use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, RuntimeError};

/// Credentials issued by the control plane, persisted after a successful
/// provisioning exchange so the one-time code is never needed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub api_key: String,
}

/// `POST /devices/provision` with the one-time code and a hardware
/// summary. Any non-2xx reply is a provisioning failure.
pub async fn provision(
    http: &reqwest::Client,
    api_base: &str,
    provisioning_code: &str,
) -> Result<DeviceCredentials> {
    let body = json!({
        "provisioning_code": provisioning_code,
        "hardware_info": hardware_info(),
        "network_info": network_info(),
    });

    let response = http
        .post(format!("{api_base}/devices/provision"))
        .json(&body)
        .send()
        .await
        .map_err(|e| RuntimeError::ProvisioningFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(RuntimeError::ProvisioningFailed(format!(
            "http {}",
            response.status()
        )));
    }

    response
        .json::<DeviceCredentials>()
        .await
        .map_err(|e| RuntimeError::ProvisioningFailed(format!("bad response: {e}")))
}

pub fn load_credentials(path: &Path) -> Option<DeviceCredentials> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(creds) => Some(creds),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable credentials file");
            None
        }
    }
}

pub fn save_credentials(path: &Path, creds: &DeviceCredentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(creds)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn hardware_info() -> serde_json::Value {
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": std::thread::available_parallelism().map(usize::from).unwrap_or(1),
    })
}

fn network_info() -> serde_json::Value {
    json!({
        "hostname": hostname(),
    })
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
