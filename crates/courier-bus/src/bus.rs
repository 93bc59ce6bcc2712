//! The messaging endpoint owned by one execution context.
//!
//! A [`Bus`] binds a role, a transport, a caller and a handler registry.
//! Calling [`Bus::listen`] attaches the dispatcher to the transport; it is safe
//! to call any number of times.

use crate::broadcast::{self, BroadcastOptions, BroadcastReport};
use crate::caller::{Caller, SendOptions};
use crate::dispatcher::Dispatcher;
use crate::registry::{Handler, HandlerRegistry, StreamSink};
use crate::transport::{Peer, Transport};
use courier_types::{BusConfig, BusResult, Envelope, Operation, Role};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

struct BusInner {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    caller: Caller,
    registry: Arc<HandlerRegistry>,
    dispatcher: Dispatcher,
    listening: AtomicBool,
}

/// Messaging endpoint for one execution context. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus for a context playing `role` on top of `transport`.
    ///
    /// Nothing is received until [`Bus::listen`] is called.
    pub fn new(role: Role, transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.protocol_version);
        let caller = Caller::new(role, Arc::clone(&transport), &config);
        Self {
            inner: Arc::new(BusInner {
                config,
                transport,
                caller,
                registry,
                dispatcher,
                listening: AtomicBool::new(false),
            }),
        }
    }

    /// Role of the owning context.
    pub fn role(&self) -> &Role {
        self.inner.caller.role()
    }

    /// Configuration the bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Handlers this bus dispatches to.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Attach the dispatcher to the transport's inbound hook.
    ///
    /// Returns `true` the first time and `false` on every later call, which
    /// leaves the existing attachment untouched.
    pub fn listen(&self) -> bool {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner
            .transport
            .set_inbound(Arc::new(self.inner.dispatcher.clone()));
        info!(role = %self.role(), "Bus listening");
        true
    }

    /// Whether [`Bus::listen`] has attached the dispatcher.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Register a handler for `kind`, replacing any previous one.
    pub fn add_handler<H: Handler>(&self, kind: impl Into<String>, handler: H) {
        self.inner.registry.add(kind, handler);
    }

    /// Register a closure over raw envelopes for `kind`.
    pub fn add_handler_fn<F, Fut>(&self, kind: impl Into<String>, f: F)
    where
        F: Fn(Envelope, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Envelope>> + Send + 'static,
    {
        self.inner.registry.add_fn(kind, f);
    }

    /// Register a typed closure for operation `O`.
    pub fn add_typed_handler<O, F, Fut>(&self, f: F)
    where
        O: Operation,
        F: Fn(O::Payload, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
    {
        self.inner.registry.add_typed::<O, F, Fut>(f);
    }

    /// Remove the handler for `kind`. Returns whether one was registered.
    pub fn remove_handler(&self, kind: &str) -> bool {
        self.inner.registry.remove(kind)
    }

    /// Issue a typed request and wait for its terminal reply.
    pub async fn send<O: Operation>(
        &self,
        payload: O::Payload,
        options: SendOptions,
    ) -> BusResult<O::Output> {
        self.inner.caller.send::<O>(payload, options).await
    }

    /// Issue an untyped request and wait for its terminal reply.
    pub async fn send_raw(
        &self,
        kind: &str,
        payload: Value,
        options: SendOptions,
    ) -> BusResult<Value> {
        self.inner.caller.send_raw(kind, payload, options).await
    }

    /// Peers currently reachable through the transport.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.transport.peers()
    }

    /// Issue `O` to every known peer that passes the filter.
    pub async fn broadcast<O: Operation>(
        &self,
        payload: O::Payload,
        options: BroadcastOptions,
    ) -> BroadcastReport<O::Output> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.broadcast_timeout());
        broadcast::broadcast::<O>(
            &self.inner.caller,
            self.peers(),
            payload,
            options.filter.as_ref(),
            timeout,
        )
        .await
    }

    /// Number of this bus's calls still waiting for settlement.
    pub fn pending_calls(&self) -> usize {
        self.inner.caller.pending_count()
    }
}
