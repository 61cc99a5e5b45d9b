//! Control seam toward the chassis.
//!
//! The connectivity core hands decoded frames to a [`Controller`]; the real
//! actuator (drive-by-wire bus adapter) is an injected collaborator. An
//! emergency directive always wins over whatever drive command preceded it.

use std::sync::Mutex;

use drive_proto::{CommandFrame, DriveCommand, EmergencyDirective};
use tracing::{info, warn};

pub trait Controller: Send + Sync {
    fn apply_drive(&self, command: DriveCommand);
    fn apply_emergency(&self, directive: EmergencyDirective, reason: &str);
}

/// Decode a control-channel payload and dispatch it. Undecodable frames are
/// dropped with a warning; the vehicle must not act on garbage.
pub fn dispatch_control_frame(controller: &dyn Controller, payload: &[u8]) {
    match CommandFrame::decode(payload) {
        Ok(CommandFrame::Drive(command)) => controller.apply_drive(command),
        Ok(CommandFrame::Emergency { directive, reason }) => {
            controller.apply_emergency(directive, &reason)
        }
        Err(err) => {
            warn!(target: "vehicle", error = %err, "dropping undecodable control frame");
        }
    }
}

/// Default actuator: records the latest command and refuses further drive
/// input once an emergency directive latched.
#[derive(Default)]
pub struct LatchingController {
    state: Mutex<ControllerState>,
}

#[derive(Default)]
struct ControllerState {
    last_drive: Option<DriveCommand>,
    emergency: Option<(EmergencyDirective, String)>,
}

impl LatchingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_drive(&self) -> Option<DriveCommand> {
        self.state.lock().unwrap().last_drive
    }

    pub fn emergency(&self) -> Option<(EmergencyDirective, String)> {
        self.state.lock().unwrap().emergency.clone()
    }

    /// Operator acknowledgement clears the latch.
    pub fn clear_emergency(&self) {
        self.state.lock().unwrap().emergency = None;
    }
}

impl Controller for LatchingController {
    fn apply_drive(&self, command: DriveCommand) {
        let mut state = self.state.lock().unwrap();
        if state.emergency.is_some() {
            warn!(target: "vehicle", "ignoring drive command while emergency is latched");
            return;
        }
        state.last_drive = Some(command);
    }

    fn apply_emergency(&self, directive: EmergencyDirective, reason: &str) {
        info!(target: "vehicle", ?directive, reason, "emergency directive engaged");
        let mut state = self.state.lock().unwrap();
        state.emergency = Some((directive, reason.to_string()));
        state.last_drive = Some(DriveCommand::halt());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_proto::Gear;

    fn drive(throttle: f64) -> DriveCommand {
        DriveCommand {
            throttle,
            brake: 0.0,
            steering: 0.0,
            gear: Gear::Drive,
        }
    }

    #[test]
    fn dispatch_routes_drive_and_emergency() {
        let controller = LatchingController::new();
        dispatch_control_frame(&controller, &CommandFrame::Drive(drive(0.5)).encode());
        assert_eq!(controller.last_drive().unwrap().throttle, 0.5);

        dispatch_control_frame(
            &controller,
            &CommandFrame::Emergency {
                directive: EmergencyDirective::PullOver,
                reason: "operator".into(),
            }
            .encode(),
        );
        let (directive, reason) = controller.emergency().unwrap();
        assert_eq!(directive, EmergencyDirective::PullOver);
        assert_eq!(reason, "operator");
    }

    #[test]
    fn garbage_frames_do_not_reach_the_actuator() {
        let controller = LatchingController::new();
        dispatch_control_frame(&controller, b"not json");
        assert!(controller.last_drive().is_none());
        assert!(controller.emergency().is_none());
    }

    #[test]
    fn emergency_latches_out_drive_commands() {
        let controller = LatchingController::new();
        controller.apply_emergency(EmergencyDirective::Stop, "Heartbeat lost");
        assert_eq!(controller.last_drive().unwrap(), DriveCommand::halt());

        controller.apply_drive(drive(0.9));
        assert_eq!(controller.last_drive().unwrap(), DriveCommand::halt());

        controller.clear_emergency();
        controller.apply_drive(drive(0.2));
        assert_eq!(controller.last_drive().unwrap().throttle, 0.2);
    }
}
