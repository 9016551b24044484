use std::time::Duration;

use crate::protocol::{FRAGMENT_HEADER_SIZE, MESSAGE_HEADER_SIZE, TRAILER_SIZE};

/// Per-connection protocol tuning. The sequence window (1024) and the ack
/// mask width (32) are wire-interop constants, not configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Hard upper bound for one physical package, headers and trailer included.
    pub max_package_size: usize,
    /// Number of round-trip samples retained for the RTT estimate.
    pub ping_samples: usize,
    /// Incomplete reassemblies older than this are eligible for collection.
    pub fragment_max_age: Duration,
    /// A peer silent for longer than this is considered gone.
    pub connection_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_package_size: crate::protocol::MAX_PACKAGE_SIZE,
            ping_samples: 5,
            fragment_max_age: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl ProtocolConfig {
    /// Payload capacity of the leading package, which also carries the
    /// full message header.
    pub fn first_fragment_capacity(&self) -> usize {
        self.max_package_size - MESSAGE_HEADER_SIZE - TRAILER_SIZE
    }

    /// Payload capacity of every follow-up fragment package.
    pub fn later_fragment_capacity(&self) -> usize {
        self.max_package_size - FRAGMENT_HEADER_SIZE - TRAILER_SIZE
    }
}
