//! Configuration.

use std::time::Duration;

use crate::layout::{DEFAULT_CLIENT_COUNT, DEFAULT_SLOT_SIZE, RegionLayout};

/// Class string advertised by an endpoint before any driver binds a class.
pub const DEFAULT_CCLASS: &str = "FEEadapter";

/// Configuration for formatting a mailbox.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Stride of every mailslot (header included).
    pub slot_size: u64,
    /// Number of client peers; the coordinator takes the next id.
    pub n_clients: u64,
}

impl MailboxConfig {
    pub fn layout(&self) -> RegionLayout {
        RegionLayout::new(self.slot_size, self.n_clients)
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            n_clients: DEFAULT_CLIENT_COUNT,
        }
    }
}

/// Busy-wait and deadline policy for sends.
#[derive(Debug, Clone)]
pub struct SendConfig {
    /// First delay between polls of the own mailslot.
    pub initial_delay: Duration,
    /// Added to the delay after every poll while below `max_delay`.
    pub delay_step: Duration,
    /// Delay cap (roughly 100 writes/second at 10 ms).
    pub max_delay: Duration,
    /// Deadline for the own mailslot to drain before giving up.
    pub base_deadline: Duration,
    /// Upper bound for the adaptively widened deadline.
    pub deadline_ceiling: Duration,
}

impl SendConfig {
    /// Short timings, for tests and demos where the remote reader is local.
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_micros(100),
            delay_step: Duration::from_micros(200),
            max_delay: Duration::from_millis(1),
            base_deadline: Duration::from_millis(200),
            deadline_ceiling: Duration::from_millis(800),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            delay_step: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            base_deadline: Duration::from_secs(5),
            deadline_ceiling: Duration::from_secs(20),
        }
    }
}

/// Configuration for attaching an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Host part of the mailslot node name; the local hostname when `None`.
    pub node_name: Option<String>,
    /// Class string written into the own mailslot and link ACKs.
    pub class_name: String,
    pub send: SendConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            class_name: DEFAULT_CCLASS.to_string(),
            send: SendConfig::default(),
        }
    }
}
