use std::sync::Arc;
use std::time::Duration;

use ipclink_message::{FrameConfig, MessageRegistry};

/// Longest a single frame write may block before the connection gives up
/// on the peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by both ends of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frame limits and socket timeouts.
    ///
    /// The write timeout also bounds how long invalidation spends flushing
    /// queued messages.
    pub frame: FrameConfig,
    /// Dispatch policy for every message name the connection may see.
    pub registry: Arc<MessageRegistry>,
    /// Cap incoming dispatch per run loop pass from the start.
    pub throttle_incoming_messages: bool,
    /// Log and drop malformed messages instead of invalidating.
    pub ignore_invalid_messages_for_testing: bool,
}

impl ConnectionConfig {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig {
                write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
                ..FrameConfig::default()
            },
            registry: MessageRegistry::builtin(),
            throttle_incoming_messages: false,
            ignore_invalid_messages_for_testing: false,
        }
    }
}
