//! Mailbox region layout and the peer id → mailslot resolver.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | SLOT 0: layout globals                                            |
//! |   slot_size, buf_offset, n_clients, n_events, server_id (u64 each) |
//! +-------------------------------------------------------------------+
//! | SLOT 1 .. n_clients: client mailslots                             |
//! |   [MailslotHeader (128 bytes)][payload: stride - 128 bytes]        |
//! +-------------------------------------------------------------------+
//! | SLOT server_id: coordinator mailslot                              |
//! +-------------------------------------------------------------------+
//! ```
//!
//! Every slot is `stride` bytes. Slot 0 never belongs to a peer; peer id 0
//! does not work with the doorbell encoding either.

use std::ptr::NonNull;

use crate::error::MsgError;
use crate::slot::MailslotHeader;

/// Peer identifier within one mailbox.
pub type PeerId = u16;

/// Size of the per-slot header; payload starts at this offset.
pub const MAILSLOT_HEADER_SIZE: u64 = core::mem::size_of::<MailslotHeader>() as u64;

/// Default mailslot stride.
pub const DEFAULT_SLOT_SIZE: u64 = 512;

/// Default number of client peers.
pub const DEFAULT_CLIENT_COUNT: u64 = 4;

// =============================================================================
// Globals
// =============================================================================

/// Layout globals as stored at the start of slot 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxGlobals {
    /// Stride of every mailslot, slot 0 included.
    pub slot_size: u64,
    /// Offset of the payload within a mailslot.
    pub buf_offset: u64,
    /// Number of client peers (ids 1..=n_clients).
    pub n_clients: u64,
    /// Number of interrupt events, one per slot.
    pub n_events: u64,
    /// Peer id of the coordinator.
    pub server_id: u64,
}

const _: () = assert!(core::mem::size_of::<MailboxGlobals>() == 40);

// =============================================================================
// Region Layout
// =============================================================================

/// Immutable copy of the region parameters.
///
/// Endpoints copy the globals once at attach time and resolve slots from this
/// value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub stride: u64,
    pub header_size: u64,
    pub n_clients: u64,
    pub n_events: u64,
    pub coordinator_id: u64,
}

impl RegionLayout {
    /// Conventional layout: clients `1..=n_clients`, coordinator right after
    /// the last client, one event per slot.
    pub fn new(stride: u64, n_clients: u64) -> Self {
        Self {
            stride,
            header_size: MAILSLOT_HEADER_SIZE,
            n_clients,
            n_events: n_clients + 2,
            coordinator_id: n_clients + 1,
        }
    }

    pub fn from_globals(globals: &MailboxGlobals) -> Self {
        Self {
            stride: globals.slot_size,
            header_size: globals.buf_offset,
            n_clients: globals.n_clients,
            n_events: globals.n_events,
            coordinator_id: globals.server_id,
        }
    }

    pub fn to_globals(&self) -> MailboxGlobals {
        MailboxGlobals {
            slot_size: self.stride,
            buf_offset: self.header_size,
            n_clients: self.n_clients,
            n_events: self.n_events,
            server_id: self.coordinator_id,
        }
    }

    /// Check the layout against the mailslot header this crate was built with.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.header_size != MAILSLOT_HEADER_SIZE {
            return Err(LayoutError::HeaderSizeMismatch {
                expected: MAILSLOT_HEADER_SIZE,
                found: self.header_size,
            });
        }
        // One payload byte plus the terminating NUL.
        if self.stride <= self.header_size + 1 {
            return Err(LayoutError::StrideTooSmall {
                stride: self.stride,
                header_size: self.header_size,
            });
        }
        if self.n_clients == 0 {
            return Err(LayoutError::InvalidConfig("n_clients must be > 0"));
        }
        if self.coordinator_id <= self.n_clients {
            return Err(LayoutError::CoordinatorInClientRange {
                coordinator_id: self.coordinator_id,
                n_clients: self.n_clients,
            });
        }
        if self.max_peer_id() > u64::from(PeerId::MAX) {
            return Err(LayoutError::InvalidConfig("peer ids must fit in 16 bits"));
        }
        if self.n_events <= self.max_peer_id() {
            return Err(LayoutError::TooFewEvents {
                n_events: self.n_events,
                max_peer_id: self.max_peer_id(),
            });
        }
        if self.checked_region_len().is_none() {
            return Err(LayoutError::InvalidConfig("region size overflows"));
        }
        Ok(())
    }

    /// Largest payload the buffer can hold; sends must stay strictly below it
    /// to leave room for the terminating NUL.
    #[inline]
    pub fn max_payload(&self) -> usize {
        (self.stride - self.header_size) as usize
    }

    #[inline]
    pub fn max_peer_id(&self) -> u64 {
        self.coordinator_id.max(self.n_clients)
    }

    /// Whether `peer_id` owns a mailslot.
    #[inline]
    pub fn contains(&self, peer_id: u64) -> bool {
        (1..=self.n_clients).contains(&peer_id) || peer_id == self.coordinator_id
    }

    /// Byte offset of a peer's mailslot from the region base.
    pub fn slot_offset(&self, peer_id: u64) -> Result<usize, MsgError> {
        if !self.contains(peer_id) {
            return Err(MsgError::AddressOutOfRange {
                peer_id: peer_id as i64,
            });
        }
        peer_id
            .checked_mul(self.stride)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(MsgError::AddressOutOfRange {
                peer_id: peer_id as i64,
            })
    }

    /// Address of a peer's mailslot header given the region base.
    pub fn slot_address(
        &self,
        base: NonNull<u8>,
        peer_id: u64,
    ) -> Result<NonNull<MailslotHeader>, MsgError> {
        let offset = self.slot_offset(peer_id)?;
        // SAFETY: offset lies inside a region of at least region_len() bytes,
        // which the mailbox checks when it is created or opened.
        Ok(unsafe { base.add(offset) }.cast())
    }

    /// Every valid peer id, ascending.
    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        (1..=self.max_peer_id())
            .filter(|id| self.contains(*id))
            .map(|id| id as PeerId)
    }

    /// Bytes needed to hold slot 0 through the highest peer slot.
    ///
    /// Saturates for layouts that `validate` rejects.
    pub fn region_len(&self) -> usize {
        self.checked_region_len().unwrap_or(usize::MAX)
    }

    fn checked_region_len(&self) -> Option<usize> {
        self.max_peer_id()
            .checked_add(1)?
            .checked_mul(self.stride)
            .and_then(|len| usize::try_from(len).ok())
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_SIZE, DEFAULT_CLIENT_COUNT)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Payload offset in the globals does not match the mailslot header.
    HeaderSizeMismatch { expected: u64, found: u64 },
    /// Slots leave no room for a payload.
    StrideTooSmall { stride: u64, header_size: u64 },
    /// Coordinator id collides with the client range.
    CoordinatorInClientRange { coordinator_id: u64, n_clients: u64 },
    /// Not every peer has an event.
    TooFewEvents { n_events: u64, max_peer_id: u64 },
    /// Backing memory is smaller than the layout needs.
    RegionTooSmall { required: usize, found: usize },
    /// Invalid configuration value.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeaderSizeMismatch { expected, found } => write!(
                f,
                "payload offset {} does not match mailslot header size {}",
                found, expected
            ),
            Self::StrideTooSmall {
                stride,
                header_size,
            } => write!(
                f,
                "slot size {} must exceed header size {}",
                stride, header_size
            ),
            Self::CoordinatorInClientRange {
                coordinator_id,
                n_clients,
            } => write!(
                f,
                "coordinator id {} overlaps clients 1..={}",
                coordinator_id, n_clients
            ),
            Self::TooFewEvents {
                n_events,
                max_peer_id,
            } => write!(
                f,
                "{} events cannot cover peer id {}",
                n_events, max_peer_id
            ),
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid layout: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn scenario() -> RegionLayout {
        RegionLayout {
            stride: 256,
            header_size: 128,
            n_clients: 4,
            n_events: 6,
            coordinator_id: 5,
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(MAILSLOT_HEADER_SIZE, 128);
    }

    #[test]
    fn test_slot_offsets_are_injective() {
        let layout = scenario();
        let offsets: HashSet<usize> = layout
            .peer_ids()
            .map(|id| layout.slot_offset(id as u64).unwrap())
            .collect();
        assert_eq!(offsets.len(), 5);
        assert_eq!(layout.slot_offset(1).unwrap(), 256);
        assert_eq!(layout.slot_offset(5).unwrap(), 1280);
        // Deterministic.
        assert_eq!(layout.slot_offset(3), layout.slot_offset(3));
    }

    #[test]
    fn test_out_of_range_ids() {
        let layout = scenario();
        for id in [0u64, 6, 7, 1000] {
            assert_eq!(
                layout.slot_offset(id),
                Err(MsgError::AddressOutOfRange { peer_id: id as i64 })
            );
        }
    }

    #[test]
    fn test_discontiguous_coordinator() {
        let layout = RegionLayout {
            coordinator_id: 9,
            n_events: 10,
            ..scenario()
        };
        layout.validate().unwrap();
        assert!(layout.contains(9));
        assert!(!layout.contains(5));
        assert_eq!(layout.peer_ids().collect::<Vec<_>>(), vec![1, 2, 3, 4, 9]);
        assert_eq!(layout.region_len(), 10 * 256);
    }

    #[test]
    fn test_validate() {
        scenario().validate().unwrap();
        assert_eq!(scenario().max_payload(), 128);

        let bad = RegionLayout {
            header_size: 64,
            ..scenario()
        };
        assert!(matches!(
            bad.validate(),
            Err(LayoutError::HeaderSizeMismatch { .. })
        ));

        for stride in [128, 129] {
            let bad = RegionLayout {
                stride,
                ..scenario()
            };
            assert!(matches!(
                bad.validate(),
                Err(LayoutError::StrideTooSmall { .. })
            ));
        }
        let smallest = RegionLayout {
            stride: 130,
            ..scenario()
        };
        smallest.validate().unwrap();
        assert_eq!(smallest.max_payload(), 2);

        let bad = RegionLayout {
            coordinator_id: 3,
            ..scenario()
        };
        assert!(matches!(
            bad.validate(),
            Err(LayoutError::CoordinatorInClientRange { .. })
        ));

        let bad = RegionLayout {
            n_events: 5,
            ..scenario()
        };
        assert!(matches!(
            bad.validate(),
            Err(LayoutError::TooFewEvents { .. })
        ));
    }

    #[test]
    fn test_huge_stride_is_rejected() {
        let layout = RegionLayout {
            stride: 1 << 63,
            n_clients: 1,
            n_events: 3,
            coordinator_id: 2,
            ..scenario()
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::InvalidConfig("region size overflows"))
        );
        assert_eq!(layout.region_len(), usize::MAX);
        assert_eq!(
            layout.slot_offset(2),
            Err(MsgError::AddressOutOfRange { peer_id: 2 })
        );
    }

    #[test]
    fn test_globals_round_trip() {
        let layout = scenario();
        assert_eq!(RegionLayout::from_globals(&layout.to_globals()), layout);
    }
}
