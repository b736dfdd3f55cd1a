//! Mailslot header and the busy cell.
//!
//! `buflen` is written by two parties: the owning peer publishes a length
//! when it stages a message, and whichever peer reads that message clears it.
//! [`BusyCell`] makes that contract explicit: the owner only ever publishes
//! into an idle cell, and a reader only clears the length it actually saw.

use std::ptr::NonNull;

use crate::layout::PeerId;
use crate::sync::{AtomicU8, AtomicU64, Ordering};

/// Length of the `nodename` and `cclass` fields, NUL included.
pub const NAME_LEN: usize = 32;

// =============================================================================
// Busy Cell
// =============================================================================

/// Occupancy of a mailslot: 0 = idle, nonzero = length of the staged message.
#[repr(transparent)]
pub struct BusyCell(AtomicU64);

impl BusyCell {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Staged length, or `None` when idle.
    #[inline]
    pub fn occupied(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            len => Some(len),
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.occupied().is_none()
    }

    /// Owner side: advertise a staged message.
    ///
    /// The release store orders every payload write before it.
    #[inline]
    pub fn publish(&self, len: u64) {
        debug_assert!(len != 0, "publishing an empty message");
        self.0.store(len, Ordering::Release);
    }

    /// Reader side: mark the message consumed if it is still the one that was
    /// observed. Returns the current value on mismatch.
    #[inline]
    pub fn compare_and_clear(&self, expected: u64) -> Result<(), u64> {
        self.0
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Unconditional reset, only for the owner while (re)initializing.
    #[inline]
    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for BusyCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BusyCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BusyCell").field(&self.occupied()).finish()
    }
}

// =============================================================================
// Mailslot Header
// =============================================================================

/// Header at the start of every mailslot (128 bytes).
///
/// Name fields are byte atomics so other peers may read them while the owner
/// rewrites them.
#[repr(C)]
pub struct MailslotHeader {
    /// Node name of the owning peer.
    pub nodename: [AtomicU8; NAME_LEN],
    /// Class string of the owning peer.
    pub cclass: [AtomicU8; NAME_LEN],
    /// Busy flag and staged payload length.
    pub buflen: BusyCell,
    /// Stamped by the orchestrator.
    pub peer_id: AtomicU64,
    /// Destination of the most recent send.
    pub last_responder: AtomicU64,
    /// Negotiated SID of the owner, stamped by whoever reads its messages.
    pub peer_sid: AtomicU64,
    /// Negotiated CID of the owner, stamped by whoever reads its messages.
    pub peer_cid: AtomicU64,
    _pad: [u64; 3],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<MailslotHeader>() == 128);

impl MailslotHeader {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            nodename: core::array::from_fn(|_| AtomicU8::new(0)),
            cclass: core::array::from_fn(|_| AtomicU8::new(0)),
            buflen: BusyCell::new(),
            peer_id: AtomicU64::new(u64::from(peer_id)),
            last_responder: AtomicU64::new(0),
            peer_sid: AtomicU64::new(0),
            peer_cid: AtomicU64::new(0),
            _pad: [0; 3],
        }
    }

    /// Zero every field except `peer_id`, which is set to the given value.
    pub(crate) fn reset(&self, peer_id: PeerId) {
        store_name(&self.nodename, "");
        store_name(&self.cclass, "");
        self.buflen.reset();
        self.peer_id.store(u64::from(peer_id), Ordering::Relaxed);
        self.last_responder.store(0, Ordering::Relaxed);
        self.peer_sid.store(0, Ordering::Relaxed);
        self.peer_cid.store(0, Ordering::Relaxed);
    }

    pub fn nodename(&self) -> String {
        load_name(&self.nodename)
    }

    pub fn cclass(&self) -> String {
        load_name(&self.cclass)
    }

    pub fn set_nodename(&self, name: &str) {
        store_name(&self.nodename, name);
    }

    pub fn set_cclass(&self, name: &str) {
        store_name(&self.cclass, name);
    }
}

/// Copy `name` into a fixed field, truncated to leave room for the NUL.
fn store_name(field: &[AtomicU8; NAME_LEN], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    for (i, cell) in field.iter().enumerate() {
        let b = if i < n { bytes[i] } else { 0 };
        cell.store(b, Ordering::Relaxed);
    }
}

fn load_name(field: &[AtomicU8; NAME_LEN]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .map(|b| b.load(Ordering::Relaxed))
        .take_while(|b| *b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

// =============================================================================
// Mailslot View
// =============================================================================

/// A view of one mailslot inside a mapped mailbox.
#[derive(Clone, Copy)]
pub struct Mailslot<'a> {
    header: &'a MailslotHeader,
    payload: NonNull<u8>,
    capacity: usize,
}

impl<'a> Mailslot<'a> {
    /// # Safety
    ///
    /// `header` must point to an initialized mailslot followed by `capacity`
    /// payload bytes, all valid for `'a`.
    pub(crate) unsafe fn from_raw(header: NonNull<MailslotHeader>, capacity: usize) -> Self {
        Self {
            header: unsafe { header.as_ref() },
            payload: unsafe { header.cast::<u8>().add(core::mem::size_of::<MailslotHeader>()) },
            capacity,
        }
    }

    #[inline]
    pub fn header(&self) -> &'a MailslotHeader {
        self.header
    }

    #[inline]
    pub fn busy(&self) -> &'a BusyCell {
        &self.header.buflen
    }

    #[inline]
    pub fn peer_id(&self) -> u64 {
        self.header.peer_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Owner side: copy a payload and its terminating NUL into the buffer.
    ///
    /// Only valid while the cell is idle; the caller publishes afterwards.
    pub(crate) fn stage(&self, data: &[u8]) {
        assert!(data.len() < self.capacity, "payload exceeds mailslot");
        // SAFETY: bounds checked above; the owner is the only writer of its
        // payload and readers only look at it while the cell is busy.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.payload.as_ptr(), data.len());
            self.payload.as_ptr().add(data.len()).write(0);
        }
    }

    /// Copy out the first `len` payload bytes.
    pub fn read_payload(&self, len: usize) -> Vec<u8> {
        let len = len.min(self.capacity);
        let mut out = vec![0u8; len];
        self.copy_payload(&mut out);
        out
    }

    /// Fill `dst` from the start of the payload.
    pub fn copy_payload(&self, dst: &mut [u8]) {
        let len = dst.len().min(self.capacity);
        // SAFETY: len is within the payload buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload.as_ptr(), dst.as_mut_ptr(), len);
        }
    }

    /// Zero the header (keeping `peer_id`) and the payload.
    pub(crate) fn wipe(&self, peer_id: PeerId) {
        self.header.reset(peer_id);
        // SAFETY: the payload buffer is capacity bytes long.
        unsafe {
            std::ptr::write_bytes(self.payload.as_ptr(), 0, self.capacity);
        }
    }
}

impl std::fmt::Debug for Mailslot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailslot")
            .field("peer_id", &self.peer_id())
            .field("buflen", &self.header.buflen)
            .field(
                "last_responder",
                &self.header.last_responder.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_busy_cell_publish_and_clear() {
        let cell = BusyCell::new();
        assert!(cell.is_idle());

        cell.publish(5);
        assert_eq!(cell.occupied(), Some(5));

        // A reader that saw a different length must not clear.
        assert_eq!(cell.compare_and_clear(4), Err(5));
        assert_eq!(cell.occupied(), Some(5));

        cell.compare_and_clear(5).unwrap();
        assert!(cell.is_idle());

        // Clearing an idle cell is a mismatch, not a corruption.
        assert_eq!(cell.compare_and_clear(5), Err(0));
    }

    #[test]
    fn test_names_truncate_and_terminate() {
        let header = MailslotHeader::new(3);
        header.set_cclass("FEEadapter");
        assert_eq!(header.cclass(), "FEEadapter");

        let long = "x".repeat(64);
        header.set_nodename(&long);
        assert_eq!(header.nodename().len(), NAME_LEN - 1);

        header.set_nodename("short");
        assert_eq!(header.nodename(), "short");
    }

    #[test]
    fn test_reset_keeps_peer_id() {
        let header = MailslotHeader::new(7);
        header.buflen.publish(9);
        header.peer_cid.store(700, Ordering::Relaxed);
        header.set_cclass("junk");

        header.reset(7);
        assert!(header.buflen.is_idle());
        assert_eq!(header.peer_id.load(Ordering::Relaxed), 7);
        assert_eq!(header.peer_cid.load(Ordering::Relaxed), 0);
        assert_eq!(header.cclass(), "");
    }
}
