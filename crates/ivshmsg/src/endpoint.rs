//! Per-peer endpoint context.
//!
//! An endpoint owns one mailslot. Its behavior is split across modules:
//! sending in [`crate::send`], interrupt handling in [`crate::dispatch`], and
//! consumer handoff in [`crate::handoff`].

use std::ffi::CStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::{EndpointConfig, SendConfig};
use crate::doorbell::Doorbell;
use crate::error::SetupError;
use crate::handoff::IncomingState;
use crate::layout::{PeerId, RegionLayout};
use crate::mailbox::Mailbox;
use crate::send::AdaptiveTimeout;
use crate::slot::Mailslot;
use crate::vector::VectorTable;

// =============================================================================
// Identity
// =============================================================================

/// Component identity negotiated over the link protocol.
///
/// Id fields are 0 while unassigned and -1 when unused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreIdentity {
    pub class_name: String,
    pub cid0: i32,
    pub sid0: i32,
    /// Primary manager CID, if this component is the primary manager.
    pub pmcid: i32,
    /// Fabric manager CID and SID, if someone else is the fabric manager.
    pub pfmcid: i32,
    pub pfmsid: i32,
}

// =============================================================================
// Metrics
// =============================================================================

/// Per-endpoint counters.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    /// Pending deliveries overwritten before the consumer released them.
    pub incoming_stomps: AtomicU64,
    /// Sends that gave up on an occupied own mailslot.
    pub outgoing_busy: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Messages consumed by the link interpreter.
    pub link_handled: AtomicU64,
    /// Messages handed to the consumer.
    pub delivered: AtomicU64,
    /// Interrupts with no matching vector or no sender slot.
    pub dropped_interrupts: AtomicU64,
    /// Interrupts whose sender had nothing staged.
    pub spurious_interrupts: AtomicU64,
    pub reply_failures: AtomicU64,
}

impl EndpointMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            incoming_stomps: self.incoming_stomps.load(Ordering::Relaxed),
            outgoing_busy: self.outgoing_busy.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            link_handled: self.link_handled.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_interrupts: self.dropped_interrupts.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
            reply_failures: self.reply_failures.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`EndpointMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub incoming_stomps: u64,
    pub outgoing_busy: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub link_handled: u64,
    pub delivered: u64,
    pub dropped_interrupts: u64,
    pub spurious_interrupts: u64,
    pub reply_failures: u64,
}

// =============================================================================
// Endpoint
// =============================================================================

/// One attached peer.
pub struct Endpoint {
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) layout: RegionLayout,
    pub(crate) peer_id: PeerId,
    pub(crate) vectors: VectorTable,
    pub(crate) doorbell: Arc<dyn Doorbell>,
    pub(crate) send_config: SendConfig,
    /// Serializes local senders on the own mailslot.
    pub(crate) staging: Mutex<()>,
    pub(crate) incoming: Mutex<IncomingState>,
    pub(crate) incoming_ready: Condvar,
    pub(crate) identity: Mutex<CoreIdentity>,
    pub(crate) timeout: AdaptiveTimeout,
    pub(crate) metrics: EndpointMetrics,
}

impl Endpoint {
    /// Claim `peer_id`'s mailslot.
    ///
    /// The orchestrator must already have stamped the slot with `peer_id`.
    /// The own slot is wiped and labelled with this endpoint's node name and
    /// class.
    pub fn attach(
        mailbox: Arc<Mailbox>,
        peer_id: PeerId,
        vectors: VectorTable,
        doorbell: Arc<dyn Doorbell>,
        config: EndpointConfig,
    ) -> Result<Self, SetupError> {
        let layout = *mailbox.layout();
        layout.validate()?;

        let slot = mailbox
            .slot(u64::from(peer_id))
            .map_err(|_| SetupError::AddressOutOfRange { peer_id })?;

        let found = slot.peer_id();
        if found != u64::from(peer_id) {
            return Err(SetupError::PeerIdMismatch {
                expected: peer_id,
                found,
            });
        }

        if (vectors.len() as u64) < layout.n_events {
            return Err(SetupError::InsufficientVectors {
                needed: layout.n_events,
                available: vectors.len(),
            });
        }

        let host = config.node_name.clone().unwrap_or_else(hostname);
        let nodename = format!("{}.{:02x}", host, peer_id);
        slot.wipe(peer_id);
        slot.header().set_nodename(&nodename);
        slot.header().set_cclass(&config.class_name);

        debug!(
            peer_id,
            nodename = %nodename,
            max_payload = layout.max_payload(),
            "endpoint attached"
        );

        let timeout = AdaptiveTimeout::new(
            config.send.base_deadline,
            config.send.deadline_ceiling,
        );
        Ok(Self {
            mailbox,
            layout,
            peer_id,
            vectors,
            doorbell,
            send_config: config.send,
            staging: Mutex::new(()),
            incoming: Mutex::new(IncomingState::default()),
            incoming_ready: Condvar::new(),
            identity: Mutex::new(CoreIdentity {
                class_name: config.class_name,
                ..CoreIdentity::default()
            }),
            timeout,
            metrics: EndpointMetrics::default(),
        })
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Largest payload accepted by `send` plus one.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.layout.max_payload()
    }

    #[inline]
    pub fn is_coordinator(&self) -> bool {
        u64::from(self.peer_id) == self.layout.coordinator_id
    }

    pub fn own_slot(&self) -> Mailslot<'_> {
        self.slot_of(self.peer_id)
            .unwrap_or_else(|| unreachable!("own slot validated at attach"))
    }

    pub(crate) fn slot_of(&self, peer_id: PeerId) -> Option<Mailslot<'_>> {
        self.mailbox.slot(u64::from(peer_id)).ok()
    }

    pub fn identity(&self) -> CoreIdentity {
        self.identity.lock().clone()
    }

    /// Set the class name advertised in link ACKs and the own mailslot.
    pub fn set_class_name(&self, name: &str) {
        self.identity.lock().class_name = name.to_string();
        self.own_slot().header().set_cclass(name);
    }

    pub fn metrics(&self) -> &EndpointMetrics {
        &self.metrics
    }

    pub fn vectors(&self) -> &VectorTable {
        &self.vectors
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer_id", &self.peer_id)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Local host name, or `"localhost"` if it cannot be read.
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    match CStr::from_bytes_until_nul(&buf) {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        _ => "localhost".to_string(),
    }
}
