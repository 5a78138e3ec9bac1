//! Per-connection settings.

use std::time::Duration;

/// Default cap on the total payload of one (possibly fragmented) message.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 20_000_000;

/// Default write timeout for the close frame sent while tearing down.
pub const DEFAULT_CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for a [`WebSocket`](crate::WebSocket), fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsConfig {
    /// Largest message the read loop will buffer, summed across fragments.
    pub max_message_size: u64,
    /// Upper bound on the write timeout used for the teardown close frame,
    /// so a peer that stopped reading cannot stall teardown.
    pub close_send_timeout: Duration,
    /// Disable Nagle's algorithm on the transport.
    pub nodelay: bool,
    /// Name given to the background read thread.
    pub read_thread_name: String,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            close_send_timeout: DEFAULT_CLOSE_SEND_TIMEOUT,
            nodelay: true,
            read_thread_name: "ws-read".to_string(),
        }
    }
}

impl WsConfig {
    pub fn with_max_message_size(mut self, max: u64) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_close_send_timeout(mut self, timeout: Duration) -> Self {
        self.close_send_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_read_thread_name(mut self, name: impl Into<String>) -> Self {
        self.read_thread_name = name.into();
        self
    }
}
