//! Doorbell register word and the doorbell seam.

use crate::layout::PeerId;

/// One write to the doorbell register: origin in the upper 16 bits,
/// destination peer id in the lower 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoorbellWord(u32);

impl DoorbellWord {
    #[inline]
    pub const fn new(origin: PeerId, dest: PeerId) -> Self {
        Self(((origin as u32) << 16) | dest as u32)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Vector entry the destination will see (the sender's peer id).
    #[inline]
    pub const fn origin(self) -> PeerId {
        (self.0 >> 16) as PeerId
    }

    #[inline]
    pub const fn dest(self) -> PeerId {
        (self.0 & 0xFFFF) as PeerId
    }
}

/// Something that raises an interrupt at a peer.
///
/// Ringing never blocks and never fails from the sender's point of view; an
/// undeliverable ring is the receiver side's problem.
pub trait Doorbell: Send + Sync {
    fn ring(&self, word: DoorbellWord);
}

impl<F> Doorbell for F
where
    F: Fn(DoorbellWord) + Send + Sync,
{
    fn ring(&self, word: DoorbellWord) {
        self(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_encoding() {
        let word = DoorbellWord::new(2, 3);
        assert_eq!(word.raw(), 0x0002_0003);
        assert_eq!(word.origin(), 2);
        assert_eq!(word.dest(), 3);

        let word = DoorbellWord::from_raw(0xFFFF_0001);
        assert_eq!(word.origin(), 0xFFFF);
        assert_eq!(word.dest(), 1);
    }

    #[test]
    fn test_closure_doorbell() {
        let rung = std::sync::Mutex::new(Vec::new());
        let bell = |w: DoorbellWord| rung.lock().unwrap().push(w);
        bell.ring(DoorbellWord::new(1, 5));
        assert_eq!(*rung.lock().unwrap(), vec![DoorbellWord::new(1, 5)]);
    }
}
