//! In-process transport.
//!
//! A [`LocalHub`] connects any number of endpoints living in one process, one
//! per execution context. Delivery is asynchronous: the receiving endpoint's
//! inbound hook runs on a spawned tokio task, never inside the sender's call.
//!
//! Delivering to a role/context with no endpoint fails with
//! [`TransportError::NoListener`]. An endpoint whose context has not attached
//! a listener yet silently drops the message. A listener that declines a
//! message closes the reply port.

use crate::transport::{InboundHook, Peer, ReplySink, Transport, TransportError};
use courier_types::{Envelope, Role, TargetContext};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

struct Slot {
    peer: Peer,
    hook: RwLock<Option<Arc<dyn InboundHook>>>,
}

impl Slot {
    fn hook(&self) -> Option<Arc<dyn InboundHook>> {
        self.hook.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Shared switchboard for in-process endpoints.
#[derive(Clone, Default)]
pub struct LocalHub {
    slots: Arc<RwLock<Vec<Arc<Slot>>>>,
}

impl LocalHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint for a context with `role` and optional instance handle.
    pub fn endpoint(&self, role: Role, context: Option<TargetContext>) -> Arc<LocalTransport> {
        let slot = Arc::new(Slot {
            peer: Peer::new(role, context),
            hook: RwLock::new(None),
        });
        debug!(peer = %slot.peer, "Local endpoint created");
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.push(Arc::clone(&slot));
        Arc::new(LocalTransport {
            hub: self.clone(),
            slot,
        })
    }

    /// Remove every endpoint matching `peer`, as when a page closes.
    pub fn disconnect(&self, peer: &Peer) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|s| s.peer != *peer);
        let removed = before - slots.len();
        debug!(peer = %peer, removed, "Local endpoint disconnected");
        removed
    }

    /// Number of live endpoints.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn route(
        &self,
        from: &Arc<Slot>,
        to: &Role,
        target: Option<&TargetContext>,
    ) -> Option<Arc<Slot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter(|s| !Arc::ptr_eq(*s, from))
            .find(|s| {
                s.peer.role == *to && target.map_or(true, |t| s.peer.context.as_ref() == Some(t))
            })
            .cloned()
    }

    fn peers_except(&self, slot: &Arc<Slot>) -> Vec<Peer> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter(|s| !Arc::ptr_eq(*s, slot))
            .map(|s| s.peer.clone())
            .collect()
    }
}

/// One endpoint of a [`LocalHub`].
pub struct LocalTransport {
    hub: LocalHub,
    slot: Arc<Slot>,
}

impl LocalTransport {
    /// The peer identity of this endpoint.
    pub fn peer(&self) -> &Peer {
        &self.slot.peer
    }
}

impl Transport for LocalTransport {
    fn deliver(&self, envelope: Envelope, reply: ReplySink) -> Result<(), TransportError> {
        let destination = Peer::new(envelope.to.clone(), envelope.target_context.clone());
        let slot = self
            .hub
            .route(&self.slot, &envelope.to, envelope.target_context.as_ref())
            .ok_or_else(|| TransportError::NoListener(destination.to_string()))?;
        let Some(hook) = slot.hook() else {
            // The context exists but has not attached a listener yet; the
            // message is lost and the caller's timeout decides.
            debug!(
                call_id = %envelope.id,
                kind = %envelope.kind,
                to = %destination,
                "No inbound hook, message dropped"
            );
            return Ok(());
        };

        trace!(call_id = %envelope.id, kind = %envelope.kind, to = %destination, "Local delivery");
        tokio::spawn(async move {
            if !hook.on_message(envelope, reply.clone()) {
                reply.fail(TransportError::PortClosed);
            }
        });
        Ok(())
    }

    fn set_inbound(&self, hook: Arc<dyn InboundHook>) {
        let mut slot_hook = self.slot.hook.write().unwrap_or_else(|e| e.into_inner());
        *slot_hook = Some(hook);
    }

    fn peers(&self) -> Vec<Peer> {
        self.hub.peers_except(&self.slot)
    }
}
