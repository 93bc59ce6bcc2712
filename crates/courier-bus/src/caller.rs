//! Caller: issues requests and settles each one exactly once.
//!
//! Every outgoing request gets an entry in the pending-call table. Three
//! things race to settle it: the terminal reply, the timeout and the abort
//! signal. Whoever removes the entry from the table decides the outcome; the
//! losers find the entry gone and become no-ops. Stream pieces look the entry
//! up without removing it, so they never settle a call.

use crate::abort::AbortSignal;
use crate::transport::{ReplySink, Transport, TransportError};
use courier_types::envelope::RESPONSE_SUFFIX;
use courier_types::id::next_call_id;
use courier_types::{Body, BusConfig, BusError, BusResult, Envelope, Operation, Role, TargetContext};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Observer invoked once per non-terminal stream piece.
pub type StreamCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Options for a single send.
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Receiver role. Defaults to `content` when a target context is given,
    /// otherwise `background`.
    pub to: Option<Role>,
    /// Specific peer instance.
    pub target: Option<TargetContext>,
    /// Deadline for the terminal reply. Defaults to the bus configuration.
    pub timeout: Option<Duration>,
    /// Cancellation signal.
    pub signal: Option<AbortSignal>,
    /// Stream piece observer.
    pub on_stream: Option<StreamCallback>,
}

impl SendOptions {
    /// Defaults for every option.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver role.
    pub fn to(mut self, role: Role) -> Self {
        self.to = Some(role);
        self
    }

    /// Receiver instance; implies `content` unless a role is set.
    pub fn target(mut self, target: impl Into<TargetContext>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Deadline for the terminal reply.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, ms: u64) -> Self {
        self.timeout(Duration::from_millis(ms))
    }

    /// Abort the call when `signal` fires.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Observe non-terminal stream pieces.
    pub fn on_stream<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.on_stream = Some(Arc::new(f));
        self
    }

    fn receiver(&self) -> Role {
        match (&self.to, &self.target) {
            (Some(role), _) => role.clone(),
            (None, Some(_)) => Role::Content,
            (None, None) => Role::Background,
        }
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("to", &self.to)
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .field("signal", &self.signal.is_some())
            .field("on_stream", &self.on_stream.is_some())
            .finish()
    }
}

struct PendingCall {
    settle: oneshot::Sender<BusResult<Value>>,
    on_stream: Option<StreamCallback>,
}

type PendingTable = DashMap<String, PendingCall>;

/// Removes the pending entry if the send future is dropped before settling,
/// and lets the transport free whatever it holds for the call.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    transport: &'a dyn Transport,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
        self.transport.release(self.id);
    }
}

enum Wake {
    Settled(Result<BusResult<Value>, oneshot::error::RecvError>),
    Aborted,
    TimedOut,
}

/// Issues requests from one execution context.
pub struct Caller {
    role: Role,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    protocol_version: u32,
    default_timeout: Duration,
}

impl Caller {
    /// Create a caller that stamps `role` on its requests and delivers them
    /// through `transport`.
    pub fn new(role: Role, transport: Arc<dyn Transport>, config: &BusConfig) -> Self {
        Self {
            role,
            transport,
            pending: Arc::new(DashMap::new()),
            protocol_version: config.protocol_version,
            default_timeout: config.default_timeout(),
        }
    }

    /// Role stamped into the `from` field of outgoing requests.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Number of calls still waiting for settlement.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Issue a typed request.
    pub async fn send<O: Operation>(
        &self,
        payload: O::Payload,
        options: SendOptions,
    ) -> BusResult<O::Output> {
        let payload = serde_json::to_value(payload).map_err(|e| {
            BusError::bad_request(format!("Failed to encode {} payload: {e}", O::TYPE))
        })?;
        let result = self.send_raw(O::TYPE, payload, options).await?;
        serde_json::from_value(result).map_err(|e| {
            BusError::internal(format!("Malformed {} result: {e}", O::TYPE))
        })
    }

    /// Issue a request with an untyped payload and result.
    pub async fn send_raw(
        &self,
        kind: &str,
        payload: Value,
        options: SendOptions,
    ) -> BusResult<Value> {
        if kind.is_empty() || kind.ends_with(RESPONSE_SUFFIX) {
            return Err(BusError::bad_request(format!(
                "Invalid request type {kind:?}: must be non-empty and not end in {RESPONSE_SUFFIX}"
            )));
        }
        let to = options.receiver();
        let SendOptions {
            target,
            timeout,
            signal,
            on_stream,
            ..
        } = options;
        let timeout = timeout.unwrap_or(self.default_timeout);

        if signal.as_ref().is_some_and(AbortSignal::is_aborted) {
            debug!(kind, "Send aborted before delivery");
            return Err(BusError::aborted(format!("{kind} aborted before it was sent")));
        }

        let id = next_call_id();
        let mut envelope = Envelope::request(id.clone(), self.role.clone(), to, kind, payload)
            .with_target(target);
        envelope.protocol_version = self.protocol_version;

        let (settle, mut settled) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingCall {
                settle,
                on_stream,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            transport: self.transport.as_ref(),
            id: &id,
        };

        debug!(
            call_id = %id,
            kind,
            to = %envelope.to,
            target = ?envelope.target_context,
            timeout_ms = timeout.as_millis() as u64,
            "Sending request"
        );

        let sink = self.reply_sink(&id);
        if let Err(e) = self.transport.deliver(envelope, sink) {
            warn!(call_id = %id, kind, error = %e, "Transport delivery failed");
            route_reply(&self.pending, &id, Err(e));
        }

        let aborted = async {
            match &signal {
                Some(signal) => signal.aborted().await,
                None => std::future::pending().await,
            }
        };

        let wake = tokio::select! {
            biased;
            outcome = &mut settled => Wake::Settled(outcome),
            _ = aborted => Wake::Aborted,
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
        };

        let local = match wake {
            Wake::Settled(outcome) => return flatten(outcome),
            Wake::Aborted => BusError::aborted(format!("{kind} aborted by caller")),
            Wake::TimedOut => BusError::timeout(format!(
                "No reply to {kind} within {}ms",
                timeout.as_millis()
            )),
        };

        if self.pending.remove(&id).is_some() {
            debug!(call_id = %id, kind, code = %local.code, "Call settled locally");
            Err(local)
        } else {
            // A terminal reply claimed the entry first; its outcome is on the way.
            flatten(settled.await)
        }
    }

    fn reply_sink(&self, id: &str) -> ReplySink {
        let pending: Weak<PendingTable> = Arc::downgrade(&self.pending);
        let call_id = id.to_string();
        ReplySink::new(id, move |reply| {
            if let Some(pending) = pending.upgrade() {
                route_reply(&pending, &call_id, reply);
            }
        })
    }
}

fn flatten(outcome: Result<BusResult<Value>, oneshot::error::RecvError>) -> BusResult<Value> {
    outcome.unwrap_or_else(|_| Err(BusError::internal("Pending call dropped without settling")))
}

/// Route one reply event for `call_id` into the pending table.
fn route_reply(pending: &PendingTable, call_id: &str, reply: Result<Envelope, TransportError>) {
    let envelope = match reply {
        Ok(envelope) => envelope,
        Err(e) => {
            if let Some((_, call)) = pending.remove(call_id) {
                let _ = call.settle.send(Err(BusError::internal(e.to_string())));
            }
            return;
        }
    };

    if envelope.id != call_id {
        warn!(
            call_id,
            reply_id = %envelope.id,
            "Dropping reply with mismatched correlation id"
        );
        return;
    }

    if envelope.stream {
        let observer = pending.get(call_id).and_then(|call| call.on_stream.clone());
        match observer {
            Some(observer) => observer(stream_data(envelope.body)),
            None => debug!(call_id, "Stream piece without observer ignored"),
        }
        return;
    }

    let Some((_, call)) = pending.remove(call_id) else {
        debug!(call_id, kind = %envelope.kind, "Late reply ignored");
        return;
    };

    let outcome = match envelope.body {
        Body::Response(Ok(result)) => Ok(result),
        Body::Response(Err(error)) => Err(BusError::from(error)),
        Body::Request { .. } => Err(BusError::internal(format!(
            "Expected a response for {call_id}, got request {}",
            envelope.kind
        ))),
    };
    let _ = call.settle.send(outcome);
}

fn stream_data(body: Body) -> Value {
    match body {
        Body::Response(Ok(data)) => data,
        Body::Response(Err(error)) => serde_json::to_value(error).unwrap_or_default(),
        Body::Request { payload } => payload,
    }
}
