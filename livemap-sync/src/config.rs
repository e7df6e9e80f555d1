//! Client and relay configuration.

use std::time::Duration;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor applied after every failed attempt
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

/// Presence client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint without query (room and uid are appended)
    pub relay_url: String,
    /// Location polling period while sharing
    pub poll_interval: Duration,
    /// A cached fix younger than this is reused instead of asking again
    pub position_max_age: Duration,
    /// Upper bound for waiting on a single position fix
    pub position_timeout: Duration,
    /// Half-width of the fuzzy offset window, in degrees
    pub fuzz_radius_deg: f64,
    /// Upper bound for a single connect and WebSocket handshake
    pub connect_timeout: Duration,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
    /// Command channel capacity for `ClientHandle`
    pub command_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/stream".to_string(),
            poll_interval: Duration::from_secs(5),
            position_max_age: Duration::from_secs(1),
            position_timeout: Duration::from_secs(10),
            fuzz_radius_deg: 0.016,
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            command_capacity: 64,
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path clients connect to
    pub path: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path: "/stream".to_string(),
            broadcast_capacity: 256,
        }
    }
}
