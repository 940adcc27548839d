//! Server configuration knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "max_delay_msgs ({max_delay_msgs}) must be less than write_queue_capacity ({write_queue_capacity})"
    )]
    DelayBufferTooLarge {
        max_delay_msgs: usize,
        write_queue_capacity: usize,
    },
}

/// Tunables for a [`Server`](crate::Server).
///
/// Deserializable from toml/json config layers; every field has a
/// protocol default. Intervals are whole seconds; the heartbeat cadence
/// is advertised to clients in seconds during the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Cadence of server-emitted heartbeat packets.
    pub heartbeat_secs: u64,
    /// How long a disconnected session survives before the sweeper closes
    /// it.
    pub expiry_secs: u64,
    /// Cap on pushes buffered while a session has no connection. Must stay
    /// below `write_queue_capacity` so a resume flush cannot overrun the
    /// write queue.
    pub max_delay_msgs: usize,
    /// Bound on queued outbound frames per connection.
    pub write_queue_capacity: usize,
    /// Largest accepted packet body, in bytes.
    pub packet_max_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            expiry_secs: 20,
            max_delay_msgs: 100,
            write_queue_capacity: 128,
            packet_max_size: tether_proto::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_msgs >= self.write_queue_capacity {
            return Err(ConfigError::DelayBufferTooLarge {
                max_delay_msgs: self.max_delay_msgs,
                write_queue_capacity: self.write_queue_capacity,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    #[must_use]
    pub fn expiry_after_disconnect(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}
