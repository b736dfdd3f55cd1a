//! Send engine.
//!
//! A message is staged in the sender's own mailslot and announced by ringing
//! the destination. The destination clears the sender's `buflen` once it has
//! consumed the message; until then the sender cannot send again.

use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, error, trace};

use crate::doorbell::DoorbellWord;
use crate::endpoint::{Endpoint, EndpointMetrics};
use crate::error::{MsgError, Result};
use crate::layout::{PeerId, RegionLayout};
use crate::sync::{Ordering, fence, spin_loop};

/// SID of the single subnet every peer sits on.
pub const SID_DEFAULT: i32 = 27;

/// Sentinel SID meaning "the CID is a raw peer id".
pub const SID_CID_IS_PEER_ID: i32 = -42;

/// Payload that asks the coordinator to dump its switch state.
pub const SWITCH_DUMP: &[u8] = b"dump";

// =============================================================================
// Destination
// =============================================================================

/// Where a message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestSelector {
    /// A raw peer id.
    Peer(PeerId),
    /// A component address.
    Component { cid: i32, sid: i32 },
}

impl DestSelector {
    /// The coordinator, addressed through the peer-id sentinel.
    pub fn coordinator(layout: &RegionLayout) -> Self {
        Self::Component {
            cid: layout.coordinator_id as i32,
            sid: SID_CID_IS_PEER_ID,
        }
    }

    /// Map to a peer id that owns a mailslot.
    pub fn resolve(&self, layout: &RegionLayout) -> Result<u64> {
        let id = match *self {
            Self::Peer(id) => i64::from(id),
            Self::Component { cid, sid } => match sid {
                SID_CID_IS_PEER_ID => i64::from(cid),
                SID_DEFAULT => i64::from(cid / 100),
                sid => return Err(MsgError::UnreachableDestination { sid }),
            },
        };
        if id < 1 || id as u64 > layout.coordinator_id || !layout.contains(id as u64) {
            return Err(MsgError::AddressOutOfRange { peer_id: id });
        }
        Ok(id as u64)
    }
}

impl From<PeerId> for DestSelector {
    fn from(id: PeerId) -> Self {
        Self::Peer(id)
    }
}

// =============================================================================
// Adaptive Deadline
// =============================================================================

/// Busy-wait deadline that widens after slow drains.
///
/// `deadline = clamp(max(base, longest * 3/2), base, ceiling)`. The longest
/// observed wait only grows.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    base: Duration,
    ceiling: Duration,
    longest_nanos: AtomicU64,
}

impl AdaptiveTimeout {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            longest_nanos: AtomicU64::new(0),
        }
    }

    pub fn deadline(&self) -> Duration {
        let longest = self.longest();
        let widened = longest + longest / 2;
        widened.max(self.base).min(self.ceiling)
    }

    pub fn longest(&self) -> Duration {
        Duration::from_nanos(self.longest_nanos.load(Ordering::Relaxed))
    }

    pub fn record(&self, waited: Duration) {
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.longest_nanos.fetch_max(nanos, Ordering::Relaxed);
    }
}

// =============================================================================
// Sending
// =============================================================================

/// How to pass the time between polls of the own mailslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Sleep the thread.
    Sleep,
    /// Busy-spin; never parks.
    Spin,
}

impl Endpoint {
    /// Send `payload` to `dest`, sleeping while the own mailslot drains.
    ///
    /// Returns the number of bytes sent.
    pub fn send(&self, dest: impl Into<DestSelector>, payload: &[u8]) -> Result<usize> {
        self.send_with(dest.into(), payload, WaitMode::Sleep)
    }

    /// Like [`send`](Self::send) but never sleeps or parks. Used for replies
    /// from the interrupt path.
    pub fn try_send(&self, dest: impl Into<DestSelector>, payload: &[u8]) -> Result<usize> {
        self.send_with(dest.into(), payload, WaitMode::Spin)
    }

    /// Ask the coordinator to dump its switch state.
    pub fn request_switch_dump(&self) -> Result<usize> {
        self.send(DestSelector::coordinator(&self.layout), SWITCH_DUMP)
    }

    pub fn send_with(&self, dest: DestSelector, payload: &[u8], mode: WaitMode) -> Result<usize> {
        let target = dest.resolve(&self.layout)?;
        if payload.is_empty() {
            return Err(MsgError::EmptyPayload);
        }
        let max = self.layout.max_payload();
        if payload.len() >= max {
            return Err(MsgError::OversizedPayload {
                len: payload.len(),
                max: max - 1,
            });
        }

        let start = Instant::now();
        let deadline = self.timeout.deadline();
        let _staging = match mode {
            WaitMode::Sleep => self.staging.lock(),
            WaitMode::Spin => self.spin_lock_staging(start, deadline)?,
        };

        self.wait_own_slot_idle(start, deadline, mode)?;

        let own = self.own_slot();
        let len = payload.len();
        own.stage(payload);
        own.header().last_responder.store(target, Ordering::Relaxed);
        own.busy().publish(len as u64);
        fence(Ordering::SeqCst);
        self.doorbell
            .ring(DoorbellWord::new(self.peer_id, target as PeerId));

        EndpointMetrics::bump(&self.metrics.messages_sent);
        self.metrics.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        debug!(peer_id = self.peer_id, dest = target, len, "sent");
        Ok(len)
    }

    fn spin_lock_staging(&self, start: Instant, deadline: Duration) -> Result<MutexGuard<'_, ()>> {
        loop {
            if let Some(guard) = self.staging.try_lock() {
                return Ok(guard);
            }
            let waited = start.elapsed();
            if waited >= deadline {
                return Err(self.busy_timeout(waited));
            }
            spin_loop();
        }
    }

    /// Poll the own `buflen` until a remote reader has cleared it.
    fn wait_own_slot_idle(&self, start: Instant, deadline: Duration, mode: WaitMode) -> Result<()> {
        let own = self.own_slot();
        let cfg = &self.send_config;
        let mut delay = cfg.initial_delay;
        let mut polls = 0u32;

        while let Some(staged) = own.busy().occupied() {
            let waited = start.elapsed();
            if waited >= deadline {
                return Err(self.busy_timeout(waited));
            }
            trace!(peer_id = self.peer_id, staged, ?delay, "own mailslot busy");
            match mode {
                WaitMode::Sleep => std::thread::sleep(delay),
                WaitMode::Spin => spin_for(delay),
            }
            if delay < cfg.max_delay {
                delay += cfg.delay_step;
            }
            polls += 1;
        }

        if polls > 0 {
            self.timeout.record(start.elapsed());
        }
        Ok(())
    }

    fn busy_timeout(&self, waited: Duration) -> MsgError {
        EndpointMetrics::bump(&self.metrics.outgoing_busy);
        let last_responder = self
            .own_slot()
            .header()
            .last_responder
            .load(Ordering::Relaxed);
        error!(
            peer_id = self.peer_id,
            last_responder,
            waited_ms = waited.as_millis() as u64,
            "own mailslot never drained; refusing to overwrite"
        );
        MsgError::SlotBusyTimeout {
            last_responder,
            waited,
        }
    }

    /// Current busy-wait deadline.
    pub fn send_deadline(&self) -> Duration {
        self.timeout.deadline()
    }
}

fn spin_for(delay: Duration) {
    let until = Instant::now() + delay;
    while Instant::now() < until {
        spin_loop();
    }
}
