use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::Flow;

/// Flow definitions on disk: one `{flow_id}.json` per flow under
/// `DATA_DIR/flows/`, mirrored in memory.
///
/// Writes are atomic (temp file + rename). Corrupt files are skipped with
/// a warning on load and never overwritten during a read failure.
pub struct FlowStorage {
    base_dir: PathBuf,
    flows: RwLock<HashMap<String, Flow>>,
}

impl FlowStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        FlowStorage {
            base_dir,
            flows: RwLock::new(HashMap::new()),
        }
    }

    fn flows_dir(&self) -> PathBuf {
        self.base_dir.join("flows")
    }

    fn flow_file(&self, id: &str) -> PathBuf {
        self.flows_dir().join(format!("{id}.json"))
    }

    pub async fn load_all(&self) -> Result<()> {
        let dir = self.flows_dir();
        std::fs::create_dir_all(&dir)?;

        let mut loaded = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Flow>(&content) {
                Ok(flow) => {
                    tracing::info!(flow_id = %flow.id, name = %flow.name, "loaded flow");
                    loaded.insert(flow.id.clone(), flow);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt flow file");
                }
            }
        }

        let count = loaded.len();
        *self.flows.write().await = loaded;
        tracing::info!(count, "loaded all flows");
        Ok(())
    }

    pub async fn list(&self) -> Vec<Flow> {
        self.flows.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Flow> {
        self.flows.read().await.get(id).cloned()
    }

    pub async fn save(&self, flow: Flow) -> Result<()> {
        let dir = self.flows_dir();
        std::fs::create_dir_all(&dir)?;

        let path = self.flow_file(&flow.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&flow)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;

        self.flows.write().await.insert(flow.id.clone(), flow);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.flows.write().await.remove(id).is_some();
        let path = self.flow_file(id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(existed)
    }
}
