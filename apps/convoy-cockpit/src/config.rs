//! Cockpit node configuration, loaded from the JSON document named on the
//! command line.

use std::path::{Path, PathBuf};

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
    #[error("target_id must not be empty")]
    MissingTargetId,
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

/// Where the operator-facing web frontend is served from. The frontend
/// itself is an external collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_ui_address")]
    pub address: String,
    #[serde(default = "default_ui_port")]
    pub port: u16,
    #[serde(default)]
    pub assets_path: PathBuf,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            address: default_ui_address(),
            port: default_ui_port(),
            assets_path: PathBuf::new(),
        }
    }
}

fn default_ui_address() -> String {
    "127.0.0.1".into()
}

fn default_ui_port() -> u16 {
    8080
}

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CockpitConfig {
    pub signaling: SignalingConfig,
    pub local_id: String,
    pub target_id: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServerEntry>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default)]
    pub ui: UiConfig,
}

impl CockpitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: CockpitConfig = serde_json::from_str(&raw)?;
        if config.local_id.is_empty() {
            return Err(ConfigError::MissingLocalId);
        }
        if config.target_id.is_empty() {
            return Err(ConfigError::MissingTargetId);
        }
        Ok(config)
    }

    pub fn target(&self) -> PeerId {
        PeerId::from(self.target_id.as_str())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document_parses() {
        let raw = r#"{
            "signaling": { "uri": "wss://relay.example/ws", "token": "jwt" },
            "local_id": "cockpit-1",
            "target_id": "vehicle-1",
            "ice_servers": [{ "uri": "stun:stun.example:3478" }],
            "heartbeat_ms": 1000,
            "ui": { "address": "0.0.0.0", "port": 9000, "assets_path": "display/public" }
        }"#;
        let config: CockpitConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.target(), PeerId::from("vehicle-1"));
        assert_eq!(config.ui.port, 9000);
        assert_eq!(config.ui.assets_path, PathBuf::from("display/public"));
        assert_eq!(config.manager_config().heartbeat_ms, 1000);
    }

    #[test]
    fn defaults_fill_in_ui_and_channels() {
        let raw = r#"{
            "signaling": { "uri": "ws://127.0.0.1:8080/ws" },
            "local_id": "cockpit-1",
            "target_id": "vehicle-1"
        }"#;
        let config: CockpitConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.ui.address, "127.0.0.1");
        assert_eq!(config.ui.port, 8080);
        assert_eq!(config.channels.telemetry, "telemetry");
        assert_eq!(config.reconnect_max_attempts, 5);
    }
}
