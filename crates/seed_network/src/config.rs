//! Network configuration for an agent node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the agent networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// This node's identity. A fresh UUID is generated when absent.
    pub node_id: Option<String>,

    /// Address to listen on for incoming connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Host announced to peers when `listen_addr` is unspecified (0.0.0.0).
    pub advertise_host: String,

    /// Bootstrap peer addresses (`host:port`) that receive discovery
    /// announcements before any node is known.
    pub seed_peers: Vec<String>,

    /// Interval between discovery broadcasts.
    #[serde(with = "duration_serde")]
    pub broadcast_interval: Duration,

    /// Interval between health-check sweeps.
    #[serde(with = "duration_serde")]
    pub health_check_interval: Duration,

    /// Number of missed health-check intervals before a node is evicted.
    pub missed_checks_before_eviction: u32,

    /// Timeout for a single health probe.
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,

    /// Delivery attempts per target before surfacing a delivery error.
    pub max_delivery_attempts: u32,

    /// Linear backoff base: the delay after attempt `n` is `base * n`.
    pub retry_base_delay_ms: u64,

    /// Timeout for one delivery attempt (connect, send, reply).
    #[serde(with = "duration_serde")]
    pub attempt_timeout: Duration,

    /// How long to wait for a sync acknowledgment.
    #[serde(with = "duration_serde")]
    pub sync_ack_timeout: Duration,

    /// How long an accepted-but-uncommitted sync stays ready on the responder.
    #[serde(with = "duration_serde")]
    pub sync_ready_ttl: Duration,

    /// Number of latency samples kept for averaging.
    pub latency_window: usize,

    /// Interval between health score evaluations.
    #[serde(with = "duration_serde")]
    pub monitor_interval: Duration,

    /// Health scores below this value fire alert callbacks.
    pub alert_threshold: f64,

    /// Pause after a background loop error before the loop resumes.
    #[serde(with = "duration_serde")]
    pub loop_error_backoff: Duration,

    /// Lifetime of issued auth tokens. `None` disables expiry.
    pub token_ttl_secs: Option<u64>,

    /// Base64 AES-256 key shared by the cluster. Generated per process when absent.
    pub shared_key: Option<String>,

    /// Token this node presents to peers that require authentication.
    pub auth_token: Option<String>,

    /// Reject inbound frames whose token does not verify for their sender.
    pub require_auth: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9470)),
            advertise_host: "127.0.0.1".to_string(),
            seed_peers: Vec::new(),
            broadcast_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            missed_checks_before_eviction: 3,
            probe_timeout: Duration::from_secs(5),
            max_delivery_attempts: 3,
            retry_base_delay_ms: 1000,
            attempt_timeout: Duration::from_secs(10),
            sync_ack_timeout: Duration::from_secs(30),
            sync_ready_ttl: Duration::from_secs(60),
            latency_window: 100,
            monitor_interval: Duration::from_secs(60),
            alert_threshold: 0.7,
            loop_error_backoff: Duration::from_secs(5),
            token_ttl_secs: Some(24 * 60 * 60),
            shared_key: None,
            auth_token: None,
            require_auth: false,
        }
    }
}

impl NetworkConfig {
    /// A config bound to an ephemeral loopback port with short timings.
    /// Intended for tests and local experiments.
    pub fn local() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            retry_base_delay_ms: 10,
            attempt_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            sync_ack_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Linear backoff base delay.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Token lifetime, if expiry is enabled.
    pub fn token_ttl(&self) -> Option<Duration> {
        self.token_ttl_secs.map(Duration::from_secs)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Durations as (fractional) seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(dur.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
