//! docbridge provider process
//!
//! Speaks Content-Length framed JSON-RPC on stdin/stdout:
//!   docbridge [--config settings.json] [--readiness-timeout-ms N] [--result-ttl-secs N]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docbridge::cli::run_cli().await
}
