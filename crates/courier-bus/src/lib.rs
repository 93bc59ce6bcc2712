//! Typed request/response RPC between isolated execution contexts.
//!
//! The host transport only offers fire-and-forget delivery with a per-request
//! reply channel. This crate layers on top of it:
//!
//! - **Caller**: correlation ids, timeout-bounded calls, caller-side
//!   cancellation and stream pieces before the terminal answer
//! - **HandlerRegistry**: one async handler per request type
//! - **Dispatcher**: turns every inbound request into exactly one reply
//! - **Broadcast**: the same request to many peers with per-target isolation
//! - **Bus**: the facade one execution context owns
//! - **LocalHub**: an in-process transport connecting several buses
//!
//! Cancellation and timeouts are caller-local. Aborting a call frees the
//! caller's pending entry but cannot stop a remote handler that is already
//! running; nothing about cancellation travels over the wire.

pub mod abort;
pub mod broadcast;
pub mod bus;
pub mod caller;
pub mod dispatcher;
pub mod local;
pub mod registry;
pub mod transport;

pub use abort::{AbortController, AbortSignal};
pub use broadcast::{BroadcastOptions, BroadcastReport, TargetOutcome};
pub use bus::Bus;
pub use caller::{Caller, SendOptions};
pub use dispatcher::Dispatcher;
pub use local::{LocalHub, LocalTransport};
pub use registry::{Handler, HandlerRegistry, StreamSink};
pub use transport::{InboundHook, Peer, ReplySink, Transport, TransportError};

pub use courier_types::{
    BusConfig, BusError, BusResult, Envelope, ErrorCode, Operation, Role, TargetContext,
};
