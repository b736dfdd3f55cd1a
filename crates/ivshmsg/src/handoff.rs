//! Handing delivered messages to the consumer.
//!
//! The dispatcher installs at most one pending reference per endpoint. The
//! consumer waits for it, copies the payload out, and releases it, which
//! clears the sender's `buflen` and lets the sender send again.
//!
//! A delivery handed to the consumer stays in hand until released, even if
//! another sender stomps the pending reference meanwhile. Release clears the
//! slot the consumer actually read and leaves the newer delivery pending.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{MsgError, Result};
use crate::layout::PeerId;
use crate::slot::Mailslot;
use crate::sync::Ordering;

/// A delivery the consumer has not released yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingIncoming {
    pub sender: PeerId,
    /// `buflen` observed at dispatch; release clears only this value.
    pub len: u64,
    /// Install counter value; tells successive deliveries apart.
    pub generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct IncomingState {
    pub pending: Option<PendingIncoming>,
    /// Last delivery returned by an await and not released yet.
    pub in_hand: Option<PendingIncoming>,
    pub generation: u64,
    /// Bumped by `interrupt_waiters` to abort blocked consumers.
    pub epoch: u64,
}

impl IncomingState {
    /// Install a delivery from `sender`. Returns the reference it displaced
    /// when that came from another sender.
    pub fn install(&mut self, sender: PeerId, len: u64) -> Option<PendingIncoming> {
        if self.pending.is_some_and(|current| current.sender == sender) {
            return None;
        }
        self.generation = self.generation.wrapping_add(1);
        self.pending.replace(PendingIncoming {
            sender,
            len,
            generation: self.generation,
        })
    }

    /// Whether the consumer is still holding `delivery`.
    pub fn holds(&self, delivery: &PendingIncoming) -> bool {
        self.in_hand
            .is_some_and(|held| held.generation == delivery.generation)
    }
}

/// A view of the pending delivery.
#[derive(Debug, Clone, Copy)]
pub struct IncomingSlot<'a> {
    slot: Mailslot<'a>,
    sender: PeerId,
    len: usize,
}

impl<'a> IncomingSlot<'a> {
    pub fn sender(&self) -> PeerId {
        self.sender
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CID the link layer assigned to the sender.
    pub fn peer_cid(&self) -> u64 {
        self.slot.header().peer_cid.load(Ordering::Relaxed)
    }

    pub fn peer_sid(&self) -> u64 {
        self.slot.header().peer_sid.load(Ordering::Relaxed)
    }

    pub fn payload(&self) -> Vec<u8> {
        self.slot.read_payload(self.len)
    }

    /// Copy the payload into the front of `dst`; returns the bytes copied.
    pub fn copy_payload(&self, dst: &mut [u8]) -> Result<usize> {
        let max = dst.len();
        let dst = dst
            .get_mut(..self.len)
            .ok_or(MsgError::OversizedPayload {
                len: self.len,
                max,
            })?;
        self.slot.copy_payload(dst);
        Ok(self.len)
    }
}

impl Endpoint {
    /// Wait for a delivery.
    ///
    /// Returns at once if one is pending. Otherwise fails with `WouldBlock`
    /// when `nonblocking`, or blocks until a delivery arrives or
    /// [`interrupt_waiters`](Self::interrupt_waiters) is called.
    pub fn await_incoming(&self, nonblocking: bool) -> Result<IncomingSlot<'_>> {
        let mut state = self.incoming.lock();
        let epoch = state.epoch;
        loop {
            if let Some(pending) = state.pending {
                return self.hand_out(&mut state, pending);
            }
            if nonblocking {
                return Err(MsgError::WouldBlock);
            }
            if state.epoch != epoch {
                return Err(MsgError::Interrupted);
            }
            self.incoming_ready.wait(&mut state);
        }
    }

    /// Like a blocking [`await_incoming`](Self::await_incoming), giving up
    /// with `TimedOut` after `timeout`.
    pub fn await_incoming_timeout(&self, timeout: Duration) -> Result<IncomingSlot<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.incoming.lock();
        let epoch = state.epoch;
        loop {
            if let Some(pending) = state.pending {
                return self.hand_out(&mut state, pending);
            }
            if state.epoch != epoch {
                return Err(MsgError::Interrupted);
            }
            if self
                .incoming_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match state.pending {
                    Some(pending) => self.hand_out(&mut state, pending),
                    None => Err(MsgError::TimedOut),
                };
            }
        }
    }

    /// Record `pending` as the consumer's delivery and build its view.
    ///
    /// A stomped delivery still in hand is given up here, since the
    /// consumer has moved on to the newer one.
    fn hand_out(
        &self,
        state: &mut IncomingState,
        pending: PendingIncoming,
    ) -> Result<IncomingSlot<'_>> {
        let superseded = state
            .in_hand
            .replace(pending)
            .filter(|previous| previous.sender != pending.sender);
        if let Some(previous) = superseded {
            self.clear_sender(previous);
        }
        self.incoming_view(pending)
    }

    fn incoming_view(&self, pending: PendingIncoming) -> Result<IncomingSlot<'_>> {
        let slot = self
            .slot_of(pending.sender)
            .ok_or(MsgError::AddressOutOfRange {
                peer_id: i64::from(pending.sender),
            })?;
        Ok(IncomingSlot {
            slot,
            sender: pending.sender,
            len: pending.len as usize,
        })
    }

    /// Mark the delivery consumed.
    ///
    /// Releases the delivery the last await returned, or the pending one if
    /// nothing was awaited. A newer delivery that stomped the one in hand
    /// stays pending. Returns `false` if there was nothing to release, so a
    /// repeated release is harmless.
    pub fn release_incoming(&self) -> bool {
        let mut state = self.incoming.lock();
        let released = match state.in_hand.take() {
            Some(held) => {
                // The sender cannot restage before this release, so a
                // pending reference from it is the same message.
                if state.pending.is_some_and(|p| p.sender == held.sender) {
                    state.pending = None;
                }
                held
            }
            None => match state.pending.take() {
                Some(pending) => pending,
                None => return false,
            },
        };
        self.clear_sender(released);
        true
    }

    /// Clear the sender's `buflen` if it still holds the delivered length.
    pub(crate) fn clear_sender(&self, delivery: PendingIncoming) {
        let cleared = self
            .slot_of(delivery.sender)
            .map(|slot| slot.busy().compare_and_clear(delivery.len));
        if let Some(Err(current)) = cleared {
            debug!(
                peer_id = self.peer_id,
                sender = delivery.sender,
                expected = delivery.len,
                current,
                "sender buflen changed before release"
            );
        }
    }

    /// Wake every blocked consumer with `Interrupted`.
    pub fn interrupt_waiters(&self) {
        let mut state = self.incoming.lock();
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.incoming_ready.notify_all();
    }

    /// Sender of the pending delivery, if any.
    pub fn pending_sender(&self) -> Option<PeerId> {
        self.incoming.lock().pending.map(|p| p.sender)
    }
}
