//! Vehicle node configuration, loaded from the JSON document named on the
//! command line.

use std::path::Path;

use peer_manager::{ChannelLabels, ManagerConfig};
use serde::Deserialize;
use signal_proto::PeerId;
use thiserror::Error;
use transport_webrtc::{IceServerConfig, WebRtcConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("local_id must not be empty")]
    MissingLocalId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalingConfig {
    pub uri: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IceServerEntry {
    pub uri: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    pub control: String,
    pub telemetry: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            control: "control".into(),
            telemetry: "telemetry".into(),
        }
    }
}

/// Sensor device descriptors. Opaque to the connectivity core; the drivers
/// behind them are injected collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorsConfig {
    #[serde(default)]
    pub camera_device: String,
    #[serde(default = "default_camera_width")]
    pub camera_width: u32,
    #[serde(default = "default_camera_height")]
    pub camera_height: u32,
    #[serde(default = "default_camera_fps")]
    pub camera_fps: u32,
    #[serde(default)]
    pub can_interface: String,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            camera_device: String::new(),
            camera_width: default_camera_width(),
            camera_height: default_camera_height(),
            camera_fps: default_camera_fps(),
            can_interface: String::new(),
        }
    }
}

fn default_camera_width() -> u32 {
    1280
}

fn default_camera_height() -> u32 {
    720
}

fn default_camera_fps() -> u32 {
    30
}

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub signaling: SignalingConfig,
    pub local_id: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServerEntry>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default)]
    pub sensors: SensorsConfig,
}

impl VehicleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: VehicleConfig = serde_json::from_str(&raw)?;
        if config.local_id.is_empty() {
            return Err(ConfigError::MissingLocalId);
        }
        Ok(config)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            local_id: PeerId::from(self.local_id.as_str()),
            signaling_uri: self.signaling.uri.clone(),
            signaling_token: self.signaling.token.clone(),
            channels: ChannelLabels {
                control: self.channels.control.clone(),
                telemetry: self.channels.telemetry.clone(),
            },
            heartbeat_ms: self.heartbeat_ms,
            reconnect_max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn webrtc_config(&self) -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| IceServerConfig {
                    uri: server.uri.clone(),
                    username: server.username.clone(),
                    password: server.password.clone(),
                })
                .collect(),
        }
    }
}
