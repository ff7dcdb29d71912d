//! Agora - federated social index node

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agora::{
    config::Args,
    directory::WellKnownDirectory,
    methods::HttpNotifier,
    server::{self, AppState},
    store::MemoryNetwork,
    Node,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agora={},info", log_level).into()),
        )
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Agora - federated social index node");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Domain: {}", args.domain);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Federation: {}", args.federation_scheme());
    info!(
        "Method results: poll {}ms, timeout {}-{}ms",
        args.method_poll_interval_ms, args.method_timeout_min_ms, args.method_timeout_max_ms
    );
    info!("======================================");

    let directory = Arc::new(WellKnownDirectory::with_config(args.well_known_config()));
    let notifier = Arc::new(HttpNotifier::new(
        &args.domain,
        args.federation_scheme(),
        args.request_timeout(),
    ));
    let network = Arc::new(MemoryNetwork::new());

    let node = Node::start(args.node_config(), network, directory, notifier).await?;

    if args.dev_mode {
        match node.create_citizen("demo", Some("Demo Citizen")).await {
            Ok(citizen) => info!("Demo citizen {} at {}", citizen.user_id, citizen.public.url()),
            Err(e) => warn!("Failed to create demo citizen: {}", e),
        }
    }

    let state = Arc::new(AppState::new(args, Arc::clone(&node)));

    tokio::select! {
        result = server::run(state) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                node.shutdown();
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    node.shutdown();
    Ok(())
}
