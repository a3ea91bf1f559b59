//! Server configuration.

/// Configuration for the reference remote.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest accepted payload, in bytes of its JSON encoding.
    pub max_payload_bytes: usize,
    /// Maximum simultaneous subscriptions.
    pub max_subscribers: usize,
    /// Accept a push at the stored version if it carries the stored
    /// payload, so a push retried after a lost acknowledgement succeeds.
    pub idempotent_repeats: bool,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_subscribers: 1024,
            idempotent_repeats: true,
        }
    }

    /// Sets the largest accepted payload.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Sets the maximum simultaneous subscriptions.
    pub fn with_max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = max;
        self
    }

    /// Enables or disables idempotent acceptance of repeated pushes.
    pub fn with_idempotent_repeats(mut self, enabled: bool) -> Self {
        self.idempotent_repeats = enabled;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
