//! Interrupt dispatch.

use tracing::{debug, error, trace, warn};

use crate::endpoint::{Endpoint, EndpointMetrics};
use crate::link::{self, LinkOutcome};
use crate::send::DestSelector;

/// Whether an interrupt was ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The vector did not belong to this endpoint.
    None,
    Handled,
}

impl Endpoint {
    /// Handle one doorbell interrupt raised on `vector`.
    ///
    /// Link messages are answered here; anything else becomes the pending
    /// delivery and wakes one consumer.
    pub fn on_interrupt(&self, vector: u32) -> IrqReturn {
        let Some(sender) = self.vectors.peer_for_vector(vector) else {
            EndpointMetrics::bump(&self.metrics.dropped_interrupts);
            error!(peer_id = self.peer_id, vector, "interrupt on unknown vector");
            return IrqReturn::None;
        };
        let Some(slot) = self.slot_of(sender) else {
            EndpointMetrics::bump(&self.metrics.dropped_interrupts);
            error!(
                peer_id = self.peer_id,
                vector, sender, "interrupt from a peer without a mailslot"
            );
            return IrqReturn::Handled;
        };

        let mut state = self.incoming.lock();

        if let LinkOutcome::Handled(reply) = link::interpret(slot, sender, &self.identity) {
            drop(state);
            EndpointMetrics::bump(&self.metrics.link_handled);
            if let Some(reply) = reply {
                if let Err(e) = self.try_send(DestSelector::Peer(sender), &reply) {
                    EndpointMetrics::bump(&self.metrics.reply_failures);
                    warn!(peer_id = self.peer_id, sender, error = %e, "link reply failed");
                }
            }
            return IrqReturn::Handled;
        }

        let Some(len) = slot.busy().occupied() else {
            drop(state);
            EndpointMetrics::bump(&self.metrics.spurious_interrupts);
            debug!(peer_id = self.peer_id, sender, "sender has nothing staged");
            return IrqReturn::Handled;
        };

        let stomped = state.install(sender, len);
        // A stomped delivery the consumer is reading is cleared on release.
        let in_hand = stomped.is_some_and(|previous| state.holds(&previous));
        drop(state);
        self.incoming_ready.notify_one();
        EndpointMetrics::bump(&self.metrics.delivered);
        trace!(peer_id = self.peer_id, sender, len, vector, "delivery pending");

        if let Some(previous) = stomped {
            EndpointMetrics::bump(&self.metrics.incoming_stomps);
            warn!(
                peer_id = self.peer_id,
                stomped = previous.sender,
                by = sender,
                "pending delivery overwritten before release"
            );
            // The stomped sender would otherwise never be able to send again.
            if !in_hand {
                self.clear_sender(previous);
            }
        }
        IrqReturn::Handled
    }
}
