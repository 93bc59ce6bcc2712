//! Handler registry: one async handler per request type.
//!
//! Registering a type that already has a handler replaces it (last write
//! wins). Each [`Bus`](crate::Bus) owns its own registry, so several buses in
//! one process never share handlers.

use crate::transport::ReplySink;
use async_trait::async_trait;
use courier_types::{BusError, Envelope, Operation};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// An async function bound to one request type.
///
/// A handler resolves with the terminal response envelope. Returning an error
/// is the handler's way of failing; the dispatcher turns it into an `ok:false`
/// reply. Return a [`BusError`] to choose the error code.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Envelope, stream: StreamSink) -> anyhow::Result<Envelope>;
}

/// Lets a handler emit non-terminal pieces before its terminal response.
#[derive(Debug, Clone)]
pub struct StreamSink {
    request: Arc<Envelope>,
    reply: Option<ReplySink>,
}

impl StreamSink {
    /// A sink whose pieces go back through `reply` as answers to `request`.
    pub fn new(request: &Envelope, reply: ReplySink) -> Self {
        Self {
            request: Arc::new(header_of(request)),
            reply: Some(reply),
        }
    }

    /// A sink that discards every piece.
    pub fn detached(request: &Envelope) -> Self {
        Self {
            request: Arc::new(header_of(request)),
            reply: None,
        }
    }

    /// Emit one stream piece.
    pub fn send(&self, data: Value) {
        if let Some(reply) = &self.reply {
            reply.reply(Envelope::stream_piece(&self.request, data));
        }
    }

    /// Emit one stream piece from any serializable value.
    pub fn send_json<T: Serialize>(&self, data: &T) -> Result<(), serde_json::Error> {
        self.send(serde_json::to_value(data)?);
        Ok(())
    }
}

/// The request with its payload stripped; enough to address responses.
fn header_of(request: &Envelope) -> Envelope {
    let mut header = Envelope::request(
        request.id.clone(),
        request.from.clone(),
        request.to.clone(),
        request.kind.clone(),
        Value::Null,
    )
    .with_target(request.target_context.clone());
    header.protocol_version = request.protocol_version;
    header
}

/// Adapts a closure over raw envelopes into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope, StreamSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Envelope>> + Send + 'static,
{
    async fn handle(&self, request: Envelope, stream: StreamSink) -> anyhow::Result<Envelope> {
        (self.f)(request, stream).await
    }
}

/// Adapts a typed closure for operation `O` into a [`Handler`].
///
/// The payload is decoded into `O::Payload` (a decode failure is a
/// `BadRequest`) and the returned `O::Output` is wrapped in an `ok:true`
/// response.
pub struct TypedHandler<O, F> {
    f: F,
    _op: PhantomData<fn() -> O>,
}

#[async_trait]
impl<O, F, Fut> Handler for TypedHandler<O, F>
where
    O: Operation,
    F: Fn(O::Payload, StreamSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
{
    async fn handle(&self, request: Envelope, stream: StreamSink) -> anyhow::Result<Envelope> {
        let payload = request.payload().cloned().unwrap_or(Value::Null);
        let payload: O::Payload = serde_json::from_value(payload).map_err(|e| {
            BusError::bad_request(format!("Invalid {} payload: {e}", O::TYPE))
        })?;
        let output = (self.f)(payload, stream).await?;
        let result = serde_json::to_value(output).map_err(|e| {
            BusError::internal(format!("Failed to encode {} result: {e}", O::TYPE))
        })?;
        Ok(Envelope::success(&request, result))
    }
}

/// Mapping from request type to its handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, returning the handler it replaced.
    pub fn add<H: Handler>(&self, kind: impl Into<String>, handler: H) -> Option<Arc<dyn Handler>> {
        let kind = kind.into();
        debug!(kind = %kind, "Registering handler");
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(kind, Arc::new(handler))
    }

    /// Register a closure over raw envelopes.
    pub fn add_fn<F, Fut>(&self, kind: impl Into<String>, f: F) -> Option<Arc<dyn Handler>>
    where
        F: Fn(Envelope, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Envelope>> + Send + 'static,
    {
        self.add(kind, FnHandler { f })
    }

    /// Register a typed closure for operation `O`.
    pub fn add_typed<O, F, Fut>(&self, f: F) -> Option<Arc<dyn Handler>>
    where
        O: Operation,
        F: Fn(O::Payload, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
    {
        self.add(
            O::TYPE,
            TypedHandler::<O, F> {
                f,
                _op: PhantomData,
            },
        )
    }

    /// Remove the handler for `kind`. Returns whether one was registered.
    pub fn remove(&self, kind: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(kind).is_some()
    }

    /// The active handler for `kind`.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(kind).cloned()
    }

    /// Whether a handler is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(kind)
    }

    /// Registered request types, sorted.
    pub fn types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::protocol::{Ping, PingPayload, Pong};
    use courier_types::{ErrorCode, Role};
    use serde_json::json;

    fn request(kind: &str, payload: Value) -> Envelope {
        Envelope::request("r-1", Role::Ui, Role::Background, kind, payload)
    }

    #[tokio::test]
    async fn test_replacement_last_write_wins() {
        let registry = HandlerRegistry::new();
        registry.add_fn("ECHO", |req: Envelope, _s| async move {
            Ok(Envelope::success(&req, json!("first")))
        });
        let replaced = registry.add_fn("ECHO", |req: Envelope, _s| async move {
            Ok(Envelope::success(&req, json!("second")))
        });
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);

        let req = request("ECHO", json!(null));
        let handler = registry.get("ECHO").unwrap();
        let res = handler
            .handle(req.clone(), StreamSink::detached(&req))
            .await
            .unwrap();
        assert_eq!(res.outcome(), Some(&Ok(json!("second"))));
    }

    #[test]
    fn test_remove_and_types() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.add_fn("B", |req: Envelope, _s| async move {
            Ok(Envelope::success(&req, Value::Null))
        });
        registry.add_fn("A", |req: Envelope, _s| async move {
            Ok(Envelope::success(&req, Value::Null))
        });
        assert_eq!(registry.types(), vec!["A".to_string(), "B".to_string()]);
        assert!(registry.remove("A"));
        assert!(!registry.remove("A"));
        assert!(!registry.contains("A"));
        assert!(registry.contains("B"));
    }

    #[tokio::test]
    async fn test_typed_handler_wraps_output() {
        let registry = HandlerRegistry::new();
        registry.add_typed::<Ping, _, _>(|payload: PingPayload, _s| async move {
            Ok(Pong {
                t: payload.t,
                role: Role::Background,
            })
        });
        let req = request("PING", json!({"t": 123}));
        let res = registry
            .get("PING")
            .unwrap()
            .handle(req.clone(), StreamSink::detached(&req))
            .await
            .unwrap();
        assert!(res.answers(&req));
        assert_eq!(
            res.outcome(),
            Some(&Ok(json!({"t": 123, "role": "background"})))
        );
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_payload() {
        let registry = HandlerRegistry::new();
        registry.add_typed::<Ping, _, _>(|payload: PingPayload, _s| async move {
            Ok(Pong {
                t: payload.t,
                role: Role::Background,
            })
        });
        let req = request("PING", json!({"t": "not a number"}));
        let err = registry
            .get("PING")
            .unwrap()
            .handle(req.clone(), StreamSink::detached(&req))
            .await
            .unwrap_err();
        let bus = err.downcast_ref::<BusError>().unwrap();
        assert_eq!(bus.code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_stream_sink_addresses_pieces() {
        let pieces = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pieces_clone = Arc::clone(&pieces);
        let req = request("ANALYZE", json!({"big": "payload"}));
        let sink = StreamSink::new(
            &req,
            ReplySink::new(&req.id, move |r| {
                pieces_clone.lock().unwrap().push(r.unwrap());
            }),
        );
        sink.send(json!({"progress": 10}));
        sink.send_json(&json!({"progress": 20})).unwrap();

        let pieces = pieces.lock().unwrap();
        assert_eq!(pieces.len(), 2);
        assert!(pieces.iter().all(|p| p.stream && p.answers(&req)));
        assert_eq!(pieces[1].outcome(), Some(&Ok(json!({"progress": 20}))));
    }
}
