use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod middleware;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "etl-workflow-server")]
#[command(about = "HTTP gateway for the ETL workflow execution engine", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "etl-workflow.toml")]
    config: PathBuf,

    /// Directory for the workflow index, event log, and metrics store.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on.
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "etl_workflow_server=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("starting ETL workflow server");
    tracing::info!("data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
