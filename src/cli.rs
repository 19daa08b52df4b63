//! Command-line entry point: settings, logging and the stdio server loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::runtime::Handle;

use crate::backend::MemoryConnector;
use crate::config::ProviderConfig;
use crate::dispatcher::{Dispatcher, ProviderHandler};
use crate::jsonrpc::JsonRpcStdioAdapter;

/// Time given to the writer to flush the shutdown acknowledgement
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// docbridge - document and key-value provider served over JSON-RPC on stdio
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bucket readiness wait on attach, in milliseconds
    #[arg(long)]
    pub readiness_timeout_ms: Option<u64>,

    /// Drop async results nobody fetched after this many seconds
    #[arg(long)]
    pub result_ttl_secs: Option<u64>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl Cli {
    /// Settings file (if any) with command-line overrides applied
    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let mut config = match &self.config {
            Some(path) => ProviderConfig::load(path)?,
            None => ProviderConfig::default(),
        };
        if let Some(timeout) = self.readiness_timeout_ms {
            config.readiness_timeout_ms = timeout;
        }
        if let Some(ttl) = self.result_ttl_secs {
            config.async_result_ttl_secs = Some(ttl);
        }
        Ok(config)
    }
}

/// CLI実行エントリーポイント
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    let config = cli.provider_config().context("Failed to load provider settings")?;
    info!("Starting docbridge provider");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(MemoryConnector::new()),
        config,
        Handle::current(),
    ));
    let shutdown = dispatcher.shutdown_token();
    let adapter = JsonRpcStdioAdapter::new(ProviderHandler::new(dispatcher.clone()));

    tokio::select! {
        result = adapter.run() => {
            let reason = result.context("stdio transport failed")?;
            info!("Transport closed: {:?}", reason);
            dispatcher.router().shutdown();
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested by host");
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Unable to listen for ctrl-c: {}", e);
            }
            info!("Interrupted, shutting down");
            dispatcher.shutdown();
        }
    }

    info!("docbridge provider stopped");
    Ok(())
}
