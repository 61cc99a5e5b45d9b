use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use peer_manager::{PeerManager, WsConnector};
use tracing::error;
use tracing_subscriber::EnvFilter;
use transport_webrtc::WebRtcFactory;

use convoy_cockpit::app::{CockpitApp, CockpitError};
use convoy_cockpit::config::CockpitConfig;
use convoy_cockpit::frontend::HeadlessFrontend;

#[derive(Parser)]
#[command(name = "convoy-cockpit", about = "Convoy cockpit node")]
struct Cli {
    /// Path to the cockpit configuration document.
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match CockpitConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(target: "cockpit", error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let factory = Arc::new(WebRtcFactory::new(config.webrtc_config()));
    let connector = Arc::new(WsConnector::new(
        config.signaling.uri.clone(),
        config.signaling.token.clone(),
    ));
    let manager = PeerManager::new(config.manager_config(), factory, connector);

    let app = CockpitApp::new(
        manager,
        Arc::new(HeadlessFrontend),
        config.target(),
        config.channels.control.clone(),
        config.channels.telemetry.clone(),
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match app.run(shutdown).await {
        Ok(()) => {}
        Err(CockpitError::Startup(err)) => {
            error!(target: "cockpit", error = %err, "startup failed");
            std::process::exit(1);
        }
    }
}
