use signal_proto::PeerId;

/// Labels of the two application data channels. Must match between paired
/// nodes; the heartbeat channel label is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLabels {
    pub control: String,
    pub telemetry: String,
}

impl Default for ChannelLabels {
    fn default() -> Self {
        Self {
            control: "control".into(),
            telemetry: "telemetry".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub local_id: PeerId,
    pub signaling_uri: String,
    pub signaling_token: String,
    pub channels: ChannelLabels,
    /// Liveness tick period in milliseconds. 0 disables heartbeats entirely.
    pub heartbeat_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl ManagerConfig {
    pub fn new(local_id: impl Into<PeerId>, signaling_uri: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            signaling_uri: signaling_uri.into(),
            signaling_token: String::new(),
            channels: ChannelLabels::default(),
            heartbeat_ms: 5_000,
            reconnect_max_attempts: 5,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.signaling_token = token.into();
        self
    }

    pub fn heartbeat_period(&self) -> Option<std::time::Duration> {
        (self.heartbeat_ms > 0).then(|| std::time::Duration::from_millis(self.heartbeat_ms))
    }
}
