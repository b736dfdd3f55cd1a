//! Live endpoints and in-process doorbell routing.
//!
//! A [`Fabric`] owns a mailbox and the registry of endpoints attached to it.
//! Each endpoint gets an interrupt thread fed by an unbounded channel; the
//! [`LoopbackDoorbell`] turns a rung word into a vector on the destination's
//! channel, the way the doorbell hardware would raise an MSI-X vector.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DEFAULT_CCLASS, EndpointConfig, MailboxConfig};
use crate::doorbell::{Doorbell, DoorbellWord};
use crate::endpoint::Endpoint;
use crate::error::SetupError;
use crate::layout::PeerId;
use crate::mailbox::Mailbox;
use crate::vector::VectorTable;

/// First vector handed out by a fabric.
pub const FABRIC_BASE_IRQ: u32 = 64;

// =============================================================================
// Registry
// =============================================================================

struct Attachment {
    endpoint: Arc<Endpoint>,
    irq: mpsc::UnboundedSender<u32>,
    thread: JoinHandle<()>,
}

/// Endpoints attached to one mailbox, by peer id.
#[derive(Default)]
pub struct EndpointRegistry {
    entries: RwLock<BTreeMap<PeerId, Attachment>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: PeerId) -> Option<Arc<Endpoint>> {
        self.entries
            .read()
            .get(&peer_id)
            .map(|a| a.endpoint.clone())
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.entries.read().keys().copied().collect()
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.entries
            .read()
            .values()
            .map(|a| a.endpoint.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Raise the vector for `word` on its destination's interrupt line.
    fn raise(&self, word: DoorbellWord) -> bool {
        let entries = self.entries.read();
        let Some(attachment) = entries.get(&word.dest()) else {
            debug!(origin = word.origin(), dest = word.dest(), "ring for unattached peer dropped");
            return false;
        };
        let Some(vector) = attachment.endpoint.vectors().vector_for(word.origin()) else {
            debug!(origin = word.origin(), dest = word.dest(), "no vector for origin");
            return false;
        };
        trace!(origin = word.origin(), dest = word.dest(), vector, "raise");
        attachment.irq.send(vector).is_ok()
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("peer_ids", &self.peer_ids())
            .finish()
    }
}

/// Doorbell that delivers rings to endpoints in the same process.
#[derive(Debug, Clone)]
pub struct LoopbackDoorbell {
    registry: Weak<EndpointRegistry>,
}

impl LoopbackDoorbell {
    pub fn new(registry: &Arc<EndpointRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

impl Doorbell for LoopbackDoorbell {
    fn ring(&self, word: DoorbellWord) {
        match self.registry.upgrade() {
            Some(registry) => {
                registry.raise(word);
            }
            None => debug!(dest = word.dest(), "ring after fabric shutdown dropped"),
        }
    }
}

// =============================================================================
// Fabric
// =============================================================================

/// A mailbox plus every endpoint attached to it.
pub struct Fabric {
    mailbox: Arc<Mailbox>,
    registry: Arc<EndpointRegistry>,
}

impl Fabric {
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox: Arc::new(mailbox),
            registry: Arc::new(EndpointRegistry::new()),
        }
    }

    /// Format a heap-backed mailbox and wrap it.
    pub fn create(config: &MailboxConfig) -> Result<Self, SetupError> {
        Ok(Self::new(Mailbox::create(config)?))
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn endpoint(&self, peer_id: PeerId) -> Option<Arc<Endpoint>> {
        self.registry.get(peer_id)
    }

    /// Vector table for `peer_id`: a distinct run of vectors per endpoint.
    fn vector_table(&self, peer_id: PeerId) -> Result<VectorTable, SetupError> {
        let n_events = self.mailbox.layout().n_events;
        u32::try_from(n_events)
            .ok()
            .and_then(|n| u32::from(peer_id).checked_mul(n))
            .and_then(|offset| FABRIC_BASE_IRQ.checked_add(offset))
            .and_then(|base| VectorTable::sequential(n_events, base))
            .ok_or(SetupError::VectorOverflow { peer_id, n_events })
    }

    /// Attach an endpoint for `peer_id` and start its interrupt thread.
    pub fn attach(&self, peer_id: PeerId, config: EndpointConfig) -> Result<Arc<Endpoint>, SetupError> {
        let mut entries = self.registry.entries.write();
        if entries.contains_key(&peer_id) {
            return Err(SetupError::AlreadyAttached { peer_id });
        }

        let endpoint = Arc::new(Endpoint::attach(
            self.mailbox.clone(),
            peer_id,
            self.vector_table(peer_id)?,
            Arc::new(LoopbackDoorbell::new(&self.registry)),
            config,
        )?);

        let (irq, mut line) = mpsc::unbounded_channel::<u32>();
        let handler = endpoint.clone();
        let thread = std::thread::Builder::new()
            .name(format!("ivshmsg-irq-{}", peer_id))
            .spawn(move || {
                while let Some(vector) = line.blocking_recv() {
                    handler.on_interrupt(vector);
                }
                trace!(peer_id = handler.peer_id(), "interrupt line closed");
            })
            .map_err(SetupError::Spawn)?;

        entries.insert(
            peer_id,
            Attachment {
                endpoint: endpoint.clone(),
                irq,
                thread,
            },
        );
        info!(peer_id, coordinator = endpoint.is_coordinator(), "attached");
        Ok(endpoint)
    }

    /// Detach `peer_id`: abort its blocked consumers, close its interrupt
    /// line, and join the interrupt thread.
    pub fn detach(&self, peer_id: PeerId) -> bool {
        let Some(attachment) = self.registry.entries.write().remove(&peer_id) else {
            return false;
        };
        let Attachment {
            endpoint,
            irq,
            thread,
        } = attachment;

        endpoint.interrupt_waiters();
        drop(irq);
        if thread.join().is_err() {
            error!(peer_id, "interrupt thread panicked");
        }
        info!(peer_id, "detached");
        true
    }

    /// Bind a driver class to every endpoint and tell the coordinator.
    ///
    /// Returns the number of endpoints bound.
    pub fn bind_class(&self, class_name: &str) -> usize {
        let endpoints = self.registry.endpoints();
        for endpoint in &endpoints {
            endpoint.set_class_name(class_name);
            self.update_switch(endpoint);
        }
        debug!(class_name, count = endpoints.len(), "class bound");
        endpoints.len()
    }

    /// Restore the default class on every bound endpoint.
    ///
    /// Returns the number of endpoints unbound.
    pub fn unbind_class(&self) -> usize {
        let mut count = 0;
        for endpoint in self.registry.endpoints() {
            if endpoint.identity().class_name == DEFAULT_CCLASS {
                continue;
            }
            endpoint.set_class_name(DEFAULT_CCLASS);
            self.update_switch(&endpoint);
            count += 1;
        }
        count
    }

    fn update_switch(&self, endpoint: &Endpoint) {
        if endpoint.is_coordinator() {
            return;
        }
        if let Err(e) = endpoint.request_switch_dump() {
            warn!(peer_id = endpoint.peer_id(), error = %e, "switch update failed");
        }
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        for peer_id in self.registry.peer_ids() {
            self.detach(peer_id);
        }
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("mailbox", &self.mailbox)
            .field("registry", &self.registry)
            .finish()
    }
}
