use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use drive_proto::{DriveCommand, EmergencyDirective};
use peer_manager::{PeerManager, WsConnector};
use tracing::error;
use tracing_subscriber::EnvFilter;
use transport_webrtc::WebRtcFactory;

use convoy_vehicle::app::{VehicleApp, VehicleError};
use convoy_vehicle::config::VehicleConfig;
use convoy_vehicle::controller::{Controller, LatchingController};
use convoy_vehicle::sensors::{NullCamera, SimulatedChassis};

#[derive(Parser)]
#[command(name = "convoy-vehicle", about = "Convoy vehicle node")]
struct Cli {
    /// Path to the vehicle configuration document.
    config: PathBuf,
}

/// Couples the actuator to the simulated chassis so telemetry reflects the
/// commands the operator sends.
struct SimCoupledController {
    inner: LatchingController,
    chassis: Arc<SimulatedChassis>,
}

impl Controller for SimCoupledController {
    fn apply_drive(&self, command: DriveCommand) {
        self.inner.apply_drive(command);
        if let Some(applied) = self.inner.last_drive() {
            self.chassis.apply_command(applied);
        }
    }

    fn apply_emergency(&self, directive: EmergencyDirective, reason: &str) {
        self.inner.apply_emergency(directive, reason);
        self.chassis.apply_command(DriveCommand::halt());
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match VehicleConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(target: "vehicle", error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let chassis = Arc::new(SimulatedChassis::new(Duration::from_millis(100)));
    let controller = Arc::new(SimCoupledController {
        inner: LatchingController::new(),
        chassis: chassis.clone(),
    });

    let factory = Arc::new(WebRtcFactory::new(config.webrtc_config()));
    let connector = Arc::new(WsConnector::new(
        config.signaling.uri.clone(),
        config.signaling.token.clone(),
    ));
    let manager = PeerManager::new(config.manager_config(), factory, connector);

    let app = VehicleApp::new(
        manager,
        controller,
        chassis,
        Arc::new(NullCamera),
        config.channels.control.clone(),
        config.channels.telemetry.clone(),
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match app.run(shutdown).await {
        Ok(()) => {}
        Err(VehicleError::Startup(err)) => {
            error!(target: "vehicle", error = %err, "startup failed");
            std::process::exit(1);
        }
        Err(VehicleError::Fatal(reason)) => {
            error!(target: "vehicle", %reason, "unrecoverable failure");
            std::process::exit(2);
        }
    }
}
