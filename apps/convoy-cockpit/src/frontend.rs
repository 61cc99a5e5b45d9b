//! Operator frontend seam.
//!
//! The web UI that renders video and telemetry and produces steering input
//! is an external collaborator; the cockpit node only defines the contract
//! and ships a headless implementation for tests and bring-up.

use drive_proto::TelemetryFrame;
use tracing::info;

/// Connection status as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// The vehicle link degraded; outbound commands are disabled.
    Degraded(String),
    Disconnected(String),
}

pub trait OperatorFrontend: Send + Sync {
    fn telemetry(&self, frame: &TelemetryFrame);
    fn connection(&self, status: &ConnectionStatus);
}

/// Logs what a real frontend would render.
pub struct HeadlessFrontend;

impl OperatorFrontend for HeadlessFrontend {
    fn telemetry(&self, frame: &TelemetryFrame) {
        tracing::debug!(
            target: "cockpit",
            speed_mps = frame.speed_mps,
            steering = frame.steering_angle,
            gear = ?frame.gear,
            "telemetry"
        );
    }

    fn connection(&self, status: &ConnectionStatus) {
        info!(target: "cockpit", ?status, "connection status");
    }
}
