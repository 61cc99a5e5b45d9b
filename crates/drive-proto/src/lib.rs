//! Application payloads exchanged between cockpit and vehicle.
//!
//! The core treats data-channel payloads as opaque bytes; these are the
//! framings layered on top. Drive commands and emergency directives travel on
//! the control channel, telemetry frames on the telemetry channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gear {
    Park,
    Reverse,
    Neutral,
    Drive,
}

/// Continuous operator input. Throttle and brake are normalized to `0..=1`,
/// steering to `-1..=1` (negative is left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    pub throttle: f64,
    pub brake: f64,
    pub steering: f64,
    pub gear: Gear,
}

impl DriveCommand {
    /// Full-brake neutral command used when the command path degrades.
    pub fn halt() -> Self {
        Self {
            throttle: 0.0,
            brake: 1.0,
            steering: 0.0,
            gear: Gear::Neutral,
        }
    }

    pub fn is_within_limits(&self) -> bool {
        (0.0..=1.0).contains(&self.throttle)
            && (0.0..=1.0).contains(&self.brake)
            && (-1.0..=1.0).contains(&self.steering)
    }
}

/// Discrete safety directive. Always honored regardless of drive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyDirective {
    Stop,
    PullOver,
}

/// Everything the cockpit puts on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandFrame {
    Drive(DriveCommand),
    Emergency {
        directive: EmergencyDirective,
        reason: String,
    },
}

/// Vehicle status published on the telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub speed_mps: f64,
    pub steering_angle: f64,
    pub gear: Gear,
    /// Milliseconds since the vehicle node started.
    pub uptime_ms: u64,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("drive command out of range")]
    OutOfRange,
}

impl CommandFrame {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("command frame serialization is infallible"))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let frame: CommandFrame = serde_json::from_slice(raw)?;
        if let CommandFrame::Drive(cmd) = &frame {
            if !cmd.is_within_limits() {
                return Err(FrameError::OutOfRange);
            }
        }
        Ok(frame)
    }
}

impl TelemetryFrame {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("telemetry frame serialization is infallible"))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames_round_trip() {
        let drive = CommandFrame::Drive(DriveCommand {
            throttle: 0.4,
            brake: 0.0,
            steering: -0.1,
            gear: Gear::Drive,
        });
        assert_eq!(CommandFrame::decode(&drive.encode()).unwrap(), drive);

        let stop = CommandFrame::Emergency {
            directive: EmergencyDirective::Stop,
            reason: "operator".into(),
        };
        let raw = stop.encode();
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.contains("\"type\":\"emergency\""));
        assert!(text.contains("\"directive\":\"stop\""));
        assert_eq!(CommandFrame::decode(&raw).unwrap(), stop);
    }

    #[test]
    fn out_of_range_drive_commands_are_rejected() {
        let raw = serde_json::json!({
            "type": "drive",
            "throttle": 1.8,
            "brake": 0.0,
            "steering": 0.0,
            "gear": "drive",
        });
        let err = CommandFrame::decode(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, FrameError::OutOfRange));
    }

    #[test]
    fn telemetry_round_trips() {
        let frame = TelemetryFrame {
            speed_mps: 12.5,
            steering_angle: 0.04,
            gear: Gear::Drive,
            uptime_ms: 9_000,
        };
        assert_eq!(TelemetryFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn halt_command_is_in_limits() {
        assert!(DriveCommand::halt().is_within_limits());
    }
}
