//! Transport abstraction.
//!
//! A transport delivers an envelope to the peer selected by its `to` role and
//! optional `target_context`, and hands the receiving side a [`ReplySink`]
//! through which any number of stream pieces and one terminal reply travel
//! back to the original caller. The bus assumes at-most-once delivery and a
//! trusted, single-hop channel.

use courier_types::{Envelope, Role, TargetContext};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Adapter-level delivery failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Nobody is listening at the requested destination.
    #[error("Receiving end does not exist: {0}")]
    NoListener(String),
    /// The receiver accepted the message but will never reply.
    #[error("Message port closed before a response was received")]
    PortClosed,
    /// The connection to the peer was lost while a reply was outstanding.
    #[error("Peer disconnected: {0}")]
    Disconnected(String),
    /// Any other delivery failure.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// A reachable peer context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Role of the peer.
    pub role: Role,
    /// Instance handle, when the role has more than one instance.
    pub context: Option<TargetContext>,
}

impl Peer {
    /// A peer with `role`, optionally narrowed to one instance.
    pub fn new(role: Role, context: Option<TargetContext>) -> Self {
        Self { role, context }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}#{}", self.role, ctx),
            None => write!(f, "{}", self.role),
        }
    }
}

type ReplyFn = dyn Fn(Result<Envelope, TransportError>) + Send + Sync;

/// Per-request reply channel.
///
/// Cloneable; every clone feeds the same destination. The caller side builds
/// one per outgoing request, the receiving side of a transport builds one per
/// inbound request.
#[derive(Clone)]
pub struct ReplySink {
    call_id: String,
    deliver: Arc<ReplyFn>,
}

impl ReplySink {
    /// Build a sink answering `call_id` that passes every event to `deliver`.
    pub fn new<F>(call_id: impl Into<String>, deliver: F) -> Self
    where
        F: Fn(Result<Envelope, TransportError>) + Send + Sync + 'static,
    {
        Self {
            call_id: call_id.into(),
            deliver: Arc::new(deliver),
        }
    }

    /// Correlation id this sink answers.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Pass a response envelope (stream piece or terminal) back.
    pub fn reply(&self, envelope: Envelope) {
        (self.deliver)(Ok(envelope));
    }

    /// Report that no reply will arrive.
    pub fn fail(&self, error: TransportError) {
        (self.deliver)(Err(error));
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// Receiver of inbound envelopes, attached to a transport.
pub trait InboundHook: Send + Sync + 'static {
    /// Handle an inbound envelope. Returns `true` if a reply will be sent
    /// through `reply` asynchronously, `false` if the envelope is ignored.
    fn on_message(&self, envelope: Envelope, reply: ReplySink) -> bool;
}

/// A host message-delivery mechanism.
pub trait Transport: Send + Sync + 'static {
    /// Deliver `envelope` to the peer named by its `to` and `target_context`.
    ///
    /// An immediate failure is returned; a later one arrives through
    /// [`ReplySink::fail`].
    fn deliver(&self, envelope: Envelope, reply: ReplySink) -> Result<(), TransportError>;

    /// Attach the hook that receives inbound envelopes, replacing any previous one.
    fn set_inbound(&self, hook: Arc<dyn InboundHook>);

    /// Peers currently reachable from this context.
    fn peers(&self) -> Vec<Peer>;

    /// The caller stopped waiting for `call_id` (settled, timed out, aborted
    /// or dropped). Transports that track outstanding replies free them here.
    fn release(&self, _call_id: &str) {}
}
