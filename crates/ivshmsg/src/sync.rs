//! Atomics used for state shared through the mailbox region.
//!
//! Routed through this module so the `loom` feature can swap in loom's
//! model-checked types.

#[cfg(not(feature = "loom"))]
pub use core::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU8, AtomicU64, Ordering, fence};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU8, AtomicU64, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(not(feature = "loom"))]
pub use std::thread;
