//! Error types.
//!
//! [`MsgError`] covers per-operation failures, none of which are fatal to the
//! endpoint. [`SetupError`] covers attaching to or formatting a mailbox, where
//! a failure unwinds whatever was built so far.

use std::io;
use std::time::Duration;

use crate::layout::LayoutError;

/// Errors from sending, receiving, and bridge framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgError {
    /// Peer id has no mailslot in this layout.
    AddressOutOfRange { peer_id: i64 },
    /// Payload does not fit the mailslot (or the caller's buffer).
    OversizedPayload { len: usize, max: usize },
    /// Zero-length payloads are not sent.
    EmptyPayload,
    /// The SID does not name a reachable subnet.
    UnreachableDestination { sid: i32 },
    /// Own mailslot was still occupied at the deadline.
    SlotBusyTimeout {
        last_responder: u64,
        waited: Duration,
    },
    /// Nothing pending and the caller asked not to block.
    WouldBlock,
    /// A blocking wait was aborted.
    Interrupted,
    /// Fewer bytes were staged than requested.
    PartialTransfer { sent: usize, expected: usize },
    /// A bounded wait expired (busy retries exhausted, or no delivery in time).
    TimedOut,
    /// Bridge request could not be parsed.
    MalformedRequest(String),
}

impl std::fmt::Display for MsgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddressOutOfRange { peer_id } => {
                write!(f, "mailslot {} is out of range", peer_id)
            }
            Self::OversizedPayload { len, max } => {
                write!(f, "payload too large: {} bytes, max {}", len, max)
            }
            Self::EmptyPayload => write!(f, "empty payload"),
            Self::UnreachableDestination { sid } => {
                write!(f, "destination SID {} is unreachable", sid)
            }
            Self::SlotBusyTimeout {
                last_responder,
                waited,
            } => write!(
                f,
                "own mailslot still busy after {:?} (last responder {})",
                waited, last_responder
            ),
            Self::WouldBlock => write!(f, "no message pending"),
            Self::Interrupted => write!(f, "wait interrupted"),
            Self::PartialTransfer { sent, expected } => {
                write!(f, "partial transfer: {} of {} bytes", sent, expected)
            }
            Self::TimedOut => write!(f, "timed out"),
            Self::MalformedRequest(msg) => write!(f, "malformed request: {}", msg),
        }
    }
}

impl std::error::Error for MsgError {}

/// Errors from creating a mailbox or attaching an endpoint to it.
#[derive(Debug)]
pub enum SetupError {
    /// Mapping or file I/O failed.
    Io(io::Error),
    /// The region layout is unusable.
    Layout(LayoutError),
    /// The requested peer id has no mailslot.
    AddressOutOfRange { peer_id: u16 },
    /// The orchestrator stamped a different id into the slot.
    PeerIdMismatch { expected: u16, found: u64 },
    /// The supplied vector table cannot cover every event.
    InsufficientVectors { needed: u64, available: usize },
    /// An endpoint is already registered for this peer id.
    AlreadyAttached { peer_id: u16 },
    /// Vector numbers for this peer do not fit in 32 bits.
    VectorOverflow { peer_id: u16, n_events: u64 },
    /// The interrupt thread could not be started.
    Spawn(io::Error),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::AddressOutOfRange { peer_id } => {
                write!(f, "peer id {} has no mailslot", peer_id)
            }
            Self::PeerIdMismatch { expected, found } => write!(
                f,
                "server-defined peer id {} does not match {}",
                found, expected
            ),
            Self::InsufficientVectors { needed, available } => write!(
                f,
                "need {} interrupt vectors, only {} available",
                needed, available
            ),
            Self::AlreadyAttached { peer_id } => {
                write!(f, "peer {} is already attached", peer_id)
            }
            Self::VectorOverflow { peer_id, n_events } => write!(
                f,
                "{} interrupt vectors for peer {} overflow the vector space",
                n_events, peer_id
            ),
            Self::Spawn(e) => write!(f, "failed to start interrupt thread: {}", e),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Spawn(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for SetupError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

pub type Result<T, E = MsgError> = std::result::Result<T, E>;
