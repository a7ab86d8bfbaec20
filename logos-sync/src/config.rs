//! Session configuration.

use std::time::Duration;

/// Sync session configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket URL of the ordering server (room already encoded in it)
    pub server_url: String,
    /// How long a connection attempt may take before it counts as failed
    pub connect_timeout: Duration,
    /// Minimum spacing between effective connect (and disconnect) calls
    pub rate_limit_interval: Duration,
    /// Buffered application events
    pub event_capacity: usize,
    /// Buffered handle commands
    pub command_capacity: usize,
    /// Buffered outgoing frames per connection
    pub outgoing_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(10),
            rate_limit_interval: Duration::from_secs(10),
            event_capacity: 256,
            command_capacity: 256,
            outgoing_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Default configuration pointed at `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}
