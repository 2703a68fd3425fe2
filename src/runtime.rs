use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::cloud::commands::CommandHandler;
use crate::cloud::shadow::ShadowManager;
use crate::cloud::tunnel::{CloudTunnel, TunnelConfig};
use crate::config::Config;
use crate::context::{self, ContextStore, ContextStoreConfig};
use crate::engine::subflow::SubflowLibrary;
use crate::error::Result;
use crate::manager::FlowManager;
use crate::model::FlowStatus;
use crate::recorder::ExecutionRecorder;
use crate::registry::{self, NodeRegistry};
use crate::scheduler::Scheduler;
use crate::storage::FlowStorage;

/// Root of the runtime: owns every subsystem and tears them down in
/// reverse dependency order.
pub struct Runtime {
    pub config: Config,
    pub bus: Arc<MessageBus>,
    pub context: Arc<dyn ContextStore>,
    pub registry: Arc<NodeRegistry>,
    pub subflows: Arc<SubflowLibrary>,
    pub storage: Arc<FlowStorage>,
    pub recorder: Arc<ExecutionRecorder>,
    pub scheduler: Arc<Scheduler>,
    pub manager: Arc<FlowManager>,
    pub tunnel: Option<Arc<CloudTunnel>>,
    cancel: CancellationToken,
}

impl Runtime {
    pub async fn init(config: Config) -> Result<Runtime> {
        let cancel = CancellationToken::new();
        let bus = Arc::new(MessageBus::new());

        let context_config = match config.context_backend.as_str() {
            "memory" => ContextStoreConfig::Memory,
            "redis" => match &config.redis_url {
                Some(url) => ContextStoreConfig::Redis {
                    url: url.clone(),
                    prefix: "edgeflow".to_string(),
                },
                None => {
                    tracing::warn!("CONTEXT_BACKEND=redis without REDIS_URL, falling back to file");
                    ContextStoreConfig::File {
                        base_dir: config.data_dir.join("context"),
                    }
                }
            },
            _ => ContextStoreConfig::File {
                base_dir: config.data_dir.join("context"),
            },
        };
        let context = context::build(context_config).await?;

        let registry = Arc::new(NodeRegistry::new());
        registry::register_builtins(&registry)?;

        let subflows = Arc::new(SubflowLibrary::new());

        let storage = Arc::new(FlowStorage::new(config.data_dir.clone()));
        storage.load_all().await?;

        let recorder = Arc::new(ExecutionRecorder::new());
        recorder.start(&bus);

        let scheduler = Arc::new(Scheduler::new());

        let manager = Arc::new(FlowManager::new(
            storage.clone(),
            registry.clone(),
            subflows.clone(),
            bus.clone(),
            context.clone(),
            recorder.clone(),
            scheduler.clone(),
            cancel.child_token(),
        ));

        let tunnel = if config.saas_enabled {
            match (config.saas_ws_url(), config.saas_api_base()) {
                (Some(ws_url), Some(api_base)) => {
                    let shadow = Arc::new(ShadowManager::new(
                        reqwest::Client::new(),
                        api_base.clone(),
                        config.device_id.clone().unwrap_or_default(),
                        config.api_key.clone().unwrap_or_default(),
                    ));
                    let handler = Arc::new(CommandHandler::new(
                        manager.clone(),
                        recorder.clone(),
                        shadow.clone(),
                        env!("CARGO_PKG_VERSION").to_string(),
                    ));
                    handler.watch_gpio(&bus);

                    let mut tunnel_config = TunnelConfig::new(
                        ws_url,
                        api_base,
                        config.data_dir.join("device.json"),
                    );
                    tunnel_config.device_id = config.device_id.clone();
                    tunnel_config.api_key = config.api_key.clone();
                    tunnel_config.provisioning_code = config.provisioning_code.clone();

                    Some(CloudTunnel::new(tunnel_config, handler, shadow, bus.clone()))
                }
                _ => {
                    tracing::warn!("SAAS_ENABLED set but SAAS_URL missing, tunnel disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Runtime {
            config,
            bus,
            context,
            registry,
            subflows,
            storage,
            recorder,
            scheduler,
            manager,
            tunnel,
            cancel,
        })
    }

    /// Start the long-lived pieces: scheduler driver, tunnel, and every
    /// flow that was running when the process last stopped.
    pub async fn run(&self) -> Result<()> {
        self.scheduler.start(self.manager.clone());
        if let Some(tunnel) = &self.tunnel {
            tunnel.start();
        }

        for flow in self.storage.list().await {
            if flow.status == FlowStatus::Running {
                match self.manager.start(&flow.id).await {
                    Ok(()) => tracing::info!(flow = %flow.name, "resumed flow"),
                    Err(e) => {
                        tracing::error!(flow = %flow.name, error = %e, "failed to resume flow");
                    }
                }
            }
        }
        Ok(())
    }

    /// Reverse-dependency teardown: tunnel, scheduler, flows, recorder,
    /// context store.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        if let Some(tunnel) = &self.tunnel {
            tunnel.stop().await;
        }
        self.scheduler.stop();
        self.manager.stop_all().await;
        self.recorder.stop();
        if let Err(e) = self.context.close().await {
            tracing::warn!(error = %e, "context store close failed");
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config::from_lookup(|key| match key {
            "DATA_DIR" => Some(dir.to_string_lossy().into_owned()),
            "CONTEXT_BACKEND" => Some("memory".into()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_init_run_shutdown() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::init(test_config(dir.path())).await.unwrap();
        assert!(runtime.tunnel.is_none());
        assert!(runtime.registry.contains("inject"));

        runtime.run().await.unwrap();
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_resumes_previously_running_flows() {
        let dir = tempdir().unwrap();

        {
            let runtime = Runtime::init(test_config(dir.path())).await.unwrap();
            runtime.run().await.unwrap();
            let flow = runtime.manager.create("resumable", "").await.unwrap();
            runtime
                .manager
                .add_node(&flow.id, "inject", "Inject", serde_json::Map::new())
                .await
                .unwrap();
            runtime.manager.start(&flow.id).await.unwrap();
            // Simulate a crash: no shutdown, flows stay marked running.
        }

        let runtime = Runtime::init(test_config(dir.path())).await.unwrap();
        runtime.run().await.unwrap();
        let flows = runtime.manager.list().await;
        assert_eq!(flows.len(), 1);
        assert!(runtime.manager.is_running(&flows[0].id).await);
        runtime.shutdown().await;
    }
}
