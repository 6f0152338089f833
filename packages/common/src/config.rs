use serde::Deserialize;
use std::time::Duration;

fn default_handshake_timeout_secs() -> u64 {
    15
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_ack_timeout_secs() -> u64 {
    20
}
fn default_ping_interval_secs() -> u64 {
    10
}
fn default_update_rate_limit() -> u32 {
    5
}
fn default_update_rate_window_ms() -> u64 {
    500
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

/// Tunables for the judge bridge, shared by the framed transport, the
/// session state machine and the event publisher. Recognized options mirror
/// §6 of the bridge protocol: handshake/idle/ack timeouts, ping interval,
/// the testcase-event rate limit and window, whether to trust a worker's
/// self-reported problem set, and the maximum accepted frame size.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_update_rate_limit")]
    pub update_rate_limit: u32,
    #[serde(default = "default_update_rate_window_ms")]
    pub update_rate_window_ms: u64,
    /// When true, a worker's `supported-problems` / handshake problem list is
    /// ignored in favor of the platform-wide problem set.
    #[serde(default)]
    pub ignore_problems_packet: bool,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// CIDRs of reverse proxies trusted to supply a PROXY-protocol header.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl BridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
    pub fn update_rate_window(&self) -> Duration {
        Duration::from_millis(self.update_rate_window_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            update_rate_limit: default_update_rate_limit(),
            update_rate_window_ms: default_update_rate_window_ms(),
            ignore_problems_packet: false,
            max_frame_bytes: default_max_frame_bytes(),
            trusted_proxies: Vec::new(),
        }
    }
}
