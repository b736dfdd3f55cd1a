//! Interrupt vector table.
//!
//! Entry `i` holds the vector raised when peer `i` rings this endpoint. The
//! table is built once at attach time and is small, so lookups scan it.

use crate::layout::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorTable {
    vectors: Vec<u32>,
}

impl VectorTable {
    pub fn new(vectors: Vec<u32>) -> Self {
        Self { vectors }
    }

    /// `n_events` consecutive vectors starting at `base`, or `None` if the
    /// run does not fit in 32 bits.
    pub fn sequential(n_events: u64, base: u32) -> Option<Self> {
        let n = u32::try_from(n_events).ok()?;
        if n > 0 {
            base.checked_add(n - 1)?;
        }
        Some(Self {
            vectors: (0..n).map(|i| base + i).collect(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Vector raised for rings from `origin`.
    #[inline]
    pub fn vector_for(&self, origin: PeerId) -> Option<u32> {
        self.vectors.get(usize::from(origin)).copied()
    }

    /// Sender peer id behind a raised vector.
    pub fn peer_for_vector(&self, vector: u32) -> Option<PeerId> {
        self.vectors
            .iter()
            .position(|v| *v == vector)
            .and_then(|i| PeerId::try_from(i).ok())
    }
}
