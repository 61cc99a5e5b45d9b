//! Cockpit node wiring: operator commands toward the vehicle, telemetry and
//! connection status toward the frontend. On lost connectivity the cockpit
//! disables its outbound command path and stays alive in degraded mode; the
//! emergency path is never gated.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drive_proto::{CommandFrame, TelemetryFrame};
use peer_manager::{ManagerError, PeerManager};
use signal_proto::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frontend::{ConnectionStatus, OperatorFrontend};

#[derive(Debug, Error)]
pub enum CockpitError {
    #[error("startup failed: {0}")]
    Startup(#[from] ManagerError),
}

/// Gates the drive-command path. Emergency directives always pass; they are
/// the operator's last word regardless of what the link looks like.
#[derive(Default)]
pub struct CommandGate {
    enabled: AtomicBool,
}

impl CommandGate {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn should_forward(&self, frame: &CommandFrame) -> bool {
        match frame {
            CommandFrame::Drive(_) => self.is_enabled(),
            CommandFrame::Emergency { .. } => true,
        }
    }
}

pub struct CockpitApp {
    manager: PeerManager,
    frontend: Arc<dyn OperatorFrontend>,
    target: PeerId,
    control_label: String,
    telemetry_label: String,
    gate: Arc<CommandGate>,
    commands_tx: mpsc::UnboundedSender<CommandFrame>,
    commands_rx: mpsc::UnboundedReceiver<CommandFrame>,
}

impl CockpitApp {
    pub fn new(
        manager: PeerManager,
        frontend: Arc<dyn OperatorFrontend>,
        target: PeerId,
        control_label: String,
        telemetry_label: String,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            manager,
            frontend,
            target,
            control_label,
            telemetry_label,
            gate: Arc::new(CommandGate::default()),
            commands_tx,
            commands_rx,
        }
    }

    /// Where the frontend pushes operator input.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<CommandFrame> {
        self.commands_tx.clone()
    }

    pub fn gate(&self) -> Arc<CommandGate> {
        self.gate.clone()
    }

    /// Run until `shutdown` resolves. The cockpit does not terminate on a
    /// lost vehicle or relay link; it degrades and keeps the operator
    /// informed.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), CockpitError> {
        let CockpitApp {
            manager,
            frontend,
            target,
            control_label,
            telemetry_label,
            gate,
            commands_tx,
            mut commands_rx,
        } = self;
        drop(commands_tx);

        {
            let frontend = frontend.clone();
            manager.on_channel_message(move |peer, label, payload| {
                if label == telemetry_label {
                    match TelemetryFrame::decode(&payload) {
                        Ok(frame) => frontend.telemetry(&frame),
                        Err(err) => {
                            debug!(target: "cockpit", %peer, error = %err, "undecodable telemetry frame");
                        }
                    }
                }
            });
        }

        {
            let frontend = frontend.clone();
            let gate = gate.clone();
            manager.on_peer_connected(move |peer| {
                info!(target: "cockpit", %peer, "vehicle connected");
                gate.enable();
                frontend.connection(&ConnectionStatus::Connected);
            });
        }

        {
            let frontend = frontend.clone();
            let gate = gate.clone();
            manager.on_heartbeat_lost(move |peer| {
                warn!(target: "cockpit", %peer, "heartbeat lost");
                gate.disable();
                frontend.connection(&ConnectionStatus::Degraded("Heartbeat lost".into()));
            });
        }

        {
            let frontend = frontend.clone();
            let gate = gate.clone();
            manager.on_peer_disconnected(move |peer, reason| {
                info!(target: "cockpit", %peer, %reason, "vehicle disconnected");
                gate.disable();
                frontend.connection(&ConnectionStatus::Disconnected(reason));
            });
        }

        {
            let frontend = frontend.clone();
            manager.on_signaling_error(move |reason| {
                warn!(target: "cockpit", %reason, "signaling error");
                if reason.starts_with("relay link permanently lost") {
                    frontend.connection(&ConnectionStatus::Degraded(reason));
                }
            });
        }

        manager.on_video_track(|peer, info| {
            info!(target: "cockpit", %peer, track = %info.id, mime = %info.mime_type, "inbound video track");
        });

        manager.start().await?;
        manager.connect_peer(target.clone()).await?;
        info!(target: "cockpit", id = %manager.local_id(), target = %target, "cockpit node up");

        let pump_manager = manager.clone();
        let pump_gate = gate.clone();
        let pump_target = target.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = commands_rx.recv().await {
                if !pump_gate.should_forward(&frame) {
                    debug!(target: "cockpit", "drive command dropped, command path disabled");
                    continue;
                }
                match pump_manager.send(pump_target.clone(), &control_label, frame.encode()) {
                    Ok(()) => {}
                    Err(ManagerError::ChannelNotOpen(_))
                    | Err(ManagerError::UnknownPeer(_))
                    | Err(ManagerError::NotRunning) => {
                        debug!(target: "cockpit", "command dropped, no usable path to vehicle");
                    }
                    Err(err) => {
                        warn!(target: "cockpit", error = %err, "command send failed");
                    }
                }
            }
        });

        shutdown.await;
        info!(target: "cockpit", "shutdown requested");
        pump.abort();
        manager.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_proto::{DriveCommand, EmergencyDirective};

    fn drive_frame() -> CommandFrame {
        CommandFrame::Drive(DriveCommand::halt())
    }

    fn emergency_frame() -> CommandFrame {
        CommandFrame::Emergency {
            directive: EmergencyDirective::Stop,
            reason: "operator".into(),
        }
    }

    #[test]
    fn gate_blocks_drive_until_enabled() {
        let gate = CommandGate::default();
        assert!(!gate.should_forward(&drive_frame()));
        gate.enable();
        assert!(gate.should_forward(&drive_frame()));
        gate.disable();
        assert!(!gate.should_forward(&drive_frame()));
    }

    #[test]
    fn gate_never_blocks_emergency_directives() {
        let gate = CommandGate::default();
        assert!(gate.should_forward(&emergency_frame()));
        gate.enable();
        gate.disable();
        assert!(gate.should_forward(&emergency_frame()));
    }
}
