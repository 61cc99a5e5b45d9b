//! Vehicle node wiring: manager events into the controller and sensors,
//! sensor output onto the telemetry channel, and the mandatory coupling of
//! lost connectivity to the emergency actuator.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drive_proto::{EmergencyDirective, TelemetryFrame};
use peer_manager::{ManagerError, PeerManager};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::controller::{dispatch_control_frame, Controller};
use crate::sensors::{CameraSource, ChassisSource, ChassisState};

#[derive(Debug, Error)]
pub enum VehicleError {
    #[error("startup failed: {0}")]
    Startup(#[from] ManagerError),
    #[error("unrecoverable runtime failure: {0}")]
    Fatal(String),
}

pub struct VehicleApp {
    manager: PeerManager,
    controller: Arc<dyn Controller>,
    chassis: Arc<dyn ChassisSource>,
    camera: Arc<dyn CameraSource>,
    control_label: String,
    telemetry_label: String,
}

pub(crate) fn telemetry_frame(state: ChassisState, uptime: Duration) -> TelemetryFrame {
    TelemetryFrame {
        speed_mps: state.speed_mps,
        steering_angle: state.steering_angle,
        gear: state.gear,
        uptime_ms: uptime.as_millis() as u64,
    }
}

impl VehicleApp {
    pub fn new(
        manager: PeerManager,
        controller: Arc<dyn Controller>,
        chassis: Arc<dyn ChassisSource>,
        camera: Arc<dyn CameraSource>,
        control_label: String,
        telemetry_label: String,
    ) -> Self {
        Self {
            manager,
            controller,
            chassis,
            camera,
            control_label,
            telemetry_label,
        }
    }

    /// Run until `shutdown` resolves or the relay link is permanently lost.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), VehicleError> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
        let started = Instant::now();
        let sensors_started = Arc::new(AtomicBool::new(false));

        {
            let controller = self.controller.clone();
            let control_label = self.control_label.clone();
            self.manager.on_channel_message(move |peer, label, payload| {
                if label == control_label {
                    dispatch_control_frame(controller.as_ref(), &payload);
                } else {
                    tracing::debug!(target: "vehicle", %peer, %label, "message on non-control channel");
                }
            });
        }

        {
            // Lost heartbeat means the operator may no longer be in control
            // of the vehicle. Stop first, diagnose later.
            let controller = self.controller.clone();
            self.manager.on_heartbeat_lost(move |peer| {
                warn!(target: "vehicle", %peer, "heartbeat lost");
                controller.apply_emergency(EmergencyDirective::Stop, "Heartbeat lost");
            });
        }

        {
            let controller = self.controller.clone();
            self.manager.on_peer_disconnected(move |peer, reason| {
                info!(target: "vehicle", %peer, %reason, "peer disconnected");
                if reason != "local shutdown" {
                    controller.apply_emergency(EmergencyDirective::Stop, &reason);
                }
            });
        }

        {
            let chassis = self.chassis.clone();
            let camera = self.camera.clone();
            let manager = self.manager.clone();
            let telemetry_label = self.telemetry_label.clone();
            let sensors_started = sensors_started.clone();
            self.manager.on_peer_connected(move |peer| {
                info!(target: "vehicle", %peer, "peer connected");
                if sensors_started.swap(true, Ordering::SeqCst) {
                    return;
                }
                camera.start();
                let manager = manager.clone();
                let telemetry_label = telemetry_label.clone();
                chassis.start(Arc::new(move |state: ChassisState| {
                    let frame = telemetry_frame(state, started.elapsed());
                    match manager.broadcast(&telemetry_label, frame.encode()) {
                        Ok(_) | Err(ManagerError::NotRunning) => {}
                        Err(err) => {
                            tracing::debug!(target: "vehicle", error = %err, "telemetry broadcast failed");
                        }
                    }
                }));
            });
        }

        self.manager.on_peer_error(|peer, reason| {
            warn!(target: "vehicle", %peer, %reason, "peer error");
        });

        self.manager.on_signaling_error(move |reason| {
            warn!(target: "vehicle", %reason, "signaling error");
            if reason.starts_with("relay link permanently lost") {
                let _ = fatal_tx.send(reason);
            }
        });

        self.manager.start().await?;
        info!(target: "vehicle", id = %self.manager.local_id(), "vehicle node up, awaiting cockpit");

        let outcome = tokio::select! {
            _ = shutdown => {
                info!(target: "vehicle", "shutdown requested");
                Ok(())
            }
            reason = fatal_rx.recv() => {
                let reason = reason.unwrap_or_else(|| "fatal channel closed".to_string());
                self.controller
                    .apply_emergency(EmergencyDirective::Stop, &reason);
                Err(VehicleError::Fatal(reason))
            }
        };

        self.chassis.stop();
        self.camera.stop();
        self.manager.stop().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_proto::Gear;

    #[test]
    fn telemetry_frame_mirrors_chassis_state() {
        let state = ChassisState {
            speed_mps: 4.2,
            steering_angle: -0.1,
            gear: Gear::Reverse,
        };
        let frame = telemetry_frame(state, Duration::from_millis(1_500));
        assert_eq!(frame.speed_mps, 4.2);
        assert_eq!(frame.steering_angle, -0.1);
        assert_eq!(frame.gear, Gear::Reverse);
        assert_eq!(frame.uptime_ms, 1_500);
    }
}
