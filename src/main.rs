mod bus;
mod cloud;
mod config;
mod context;
mod engine;
mod error;
mod manager;
mod message;
mod model;
mod nodes;
mod recorder;
mod registry;
mod runtime;
mod scheduler;
mod storage;

use dotenvy::dotenv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::runtime::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        saas = config.saas_enabled,
        "edgeflow starting"
    );

    let runtime = Runtime::init(config).await?;
    runtime.run().await?;

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}

/// Console layer always; a daily-rolling file layer when LOG_DIR is set.
/// The returned guard keeps the file writer flushing until exit.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("edgeflow={},hyper=warn,reqwest=warn", config.log_level))
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "edgeflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}
