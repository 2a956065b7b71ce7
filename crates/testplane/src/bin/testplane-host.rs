use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use libtestplane::{
    ConnectionRole, Endpoint, Engines, HandlerConfig, SettingsDataCollectionGate,
    TestRequestHandler, TestplaneConfig,
};
use testplane::{ProcessEngine, TracingTestCaseEvents, logging};
use tracing::info;

#[derive(Parser)]
#[command(name = "testplane-host", about = "Test host process driven by a testplane controller")]
struct Cli {
    /// Controller endpoint, `unix:<path>` or `tcp:<addr>`
    #[arg(long)]
    endpoint: Endpoint,

    /// Listen on the endpoint instead of connecting to it
    #[arg(long)]
    listen: bool,

    /// Config file (defaults to the per-user config path)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    diag: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => TestplaneConfig::load_from(path)?,
        None => TestplaneConfig::load()?,
    };
    if let Some(diag) = cli.diag {
        config.diagnostics_log = Some(diag);
    }
    logging::init(config.diagnostics_log.as_deref())?;

    let role = if cli.listen {
        ConnectionRole::Host
    } else {
        ConnectionRole::Client
    };
    info!(pid = std::process::id(), endpoint = %cli.endpoint, "test host starting");

    let handler = TestRequestHandler::new(HandlerConfig::from(&config));
    handler.connect(&cli.endpoint, role).await?;

    let engine = Arc::new(ProcessEngine::new());
    handler
        .process_requests(Engines {
            discovery: engine.clone(),
            execution: engine,
            data_collection: Arc::new(SettingsDataCollectionGate::new(Arc::new(
                TracingTestCaseEvents,
            ))),
        })
        .await;
    info!("test host exiting");
    Ok(())
}
