mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use stagecast_core::service::auth::JwtIdentityService;
use stagecast_core::service::broadcast::EventBroadcaster;
use stagecast_core::service::registry::StageRegistry;
use stagecast_core::service::store::InMemoryStageStore;
use stagecast_core::sfu::{InProcessSfuEngine, SfuEngine};
use stagecast_core::{logging, Config};
use stagecast_signaling::GatewayServices;

#[derive(Debug, Parser)]
#[command(name = "stagecast", about = "Real-time stage session orchestrator")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "STAGECAST_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Stagecast server starting...");
    info!("Listen address: {}", config.listen_address());

    // 4. Wire services. The in-process SFU engine and in-memory stage store
    // stand in for the external engine and persistence service.
    let engine = Arc::new(InProcessSfuEngine::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let registry = Arc::new(StageRegistry::new(
        Arc::clone(&engine) as Arc<dyn SfuEngine>,
        Arc::clone(&broadcaster),
    ));
    let verifier = Arc::new(JwtIdentityService::new(
        config.auth.token_secret.as_bytes(),
        config.auth.token_leeway_seconds,
    ));

    let services = Arc::new(GatewayServices {
        registry,
        store: Arc::new(InMemoryStageStore::new()),
        verifier,
        broadcaster,
        sfu_timeout: config.sfu.request_timeout(),
        event_queue_capacity: config.server.event_queue_capacity,
    });

    // 5. Serve until shutdown
    let state = server::signaling_state(&config, services);
    server::serve(&config, state).await
}
