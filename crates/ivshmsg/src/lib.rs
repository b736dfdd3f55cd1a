//! Mailbox messaging over a shared memory region.
//!
//! A region is divided into equal mailslots, one per peer. A peer sends by
//! staging a message in its *own* mailslot and ringing a doorbell at the
//! destination; the destination reads the message in place and clears the
//! sender's busy length once consumed. A small link protocol (ping, peer
//! attributes, component id assignment) is answered directly from the
//! interrupt path.
//!
//! # Pieces
//!
//! - [`Mailbox`]: the formatted region and its [`RegionLayout`]
//! - [`Endpoint`]: one attached peer; sends with [`Endpoint::send`], handles
//!   interrupts with [`Endpoint::on_interrupt`], and hands deliveries to a
//!   consumer with [`Endpoint::await_incoming`] / [`Endpoint::release_incoming`]
//! - [`Fabric`]: a mailbox plus the registry of attached endpoints, with an
//!   in-process [`LoopbackDoorbell`]
//! - [`Bridge`]: `"<selector>:<payload>"` framing for byte-stream callers
//!
//! # Loom Testing
//!
//! ```text
//! cargo test -p ivshmsg --features loom
//! ```

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod doorbell;
pub mod endpoint;
pub mod error;
pub mod handoff;
pub mod layout;
pub mod link;
pub mod mailbox;
pub mod region;
pub mod registry;
pub mod send;
pub mod slot;
pub mod sync;
pub mod vector;

pub use bridge::{Bridge, Readiness};
pub use config::{DEFAULT_CCLASS, EndpointConfig, MailboxConfig, SendConfig};
pub use dispatch::IrqReturn;
pub use doorbell::{Doorbell, DoorbellWord};
pub use endpoint::{CoreIdentity, Endpoint, EndpointMetrics, MetricsSnapshot};
pub use error::{MsgError, Result, SetupError};
pub use handoff::IncomingSlot;
pub use layout::{LayoutError, MailboxGlobals, PeerId, RegionLayout};
pub use link::{CtlWrite, LinkAck, LinkOutcome};
pub use mailbox::Mailbox;
pub use registry::{EndpointRegistry, Fabric, LoopbackDoorbell};
pub use send::{DestSelector, SID_CID_IS_PEER_ID, SID_DEFAULT, WaitMode};
pub use slot::{BusyCell, Mailslot, MailslotHeader};
pub use vector::VectorTable;
