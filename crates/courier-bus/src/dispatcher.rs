//! The single entry point for inbound envelopes.
//!
//! For every accepted request the dispatcher produces exactly one terminal
//! reply, whatever the handler does: a missing handler becomes `NotFound`, a
//! handler error or panic becomes an error envelope, and a response that does
//! not answer the request becomes `Internal`. Handlers never have to worry
//! about replying twice or forgetting to reply.

use crate::registry::{HandlerRegistry, StreamSink};
use crate::transport::{InboundHook, ReplySink};
use courier_types::{BusError, Envelope, ErrorCode, ErrorPayload};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Message used when a failure carries no usable text.
pub const GENERIC_FAILURE_MESSAGE: &str = "Handler failed";

/// Routes inbound requests to registered handlers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    protocol_version: u32,
}

impl Dispatcher {
    /// Create a dispatcher over `registry` that accepts envelopes at `protocol_version`.
    pub fn new(registry: Arc<HandlerRegistry>, protocol_version: u32) -> Self {
        Self {
            registry,
            protocol_version,
        }
    }

    /// Registry handlers are looked up in.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Accept an inbound envelope. Returns `true` if a reply will be sent
    /// through `reply`.
    ///
    /// Envelopes at another protocol version and envelopes that are not
    /// requests are ignored without a reply.
    pub fn accept(&self, envelope: Envelope, reply: ReplySink) -> bool {
        if envelope.protocol_version != self.protocol_version {
            debug!(
                call_id = %envelope.id,
                kind = %envelope.kind,
                local = self.protocol_version,
                remote = envelope.protocol_version,
                "Ignoring envelope with mismatched protocol version"
            );
            return false;
        }
        if !envelope.is_request() {
            debug!(call_id = %envelope.id, kind = %envelope.kind, "Ignoring non-request envelope");
            return false;
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let stream = StreamSink::new(&envelope, reply.clone());
            let response = dispatcher.dispatch(envelope, stream).await;
            reply.reply(response);
        });
        true
    }

    /// Run the handler for `request` and produce its terminal response.
    pub async fn dispatch(&self, request: Envelope, stream: StreamSink) -> Envelope {
        let Some(handler) = self.registry.get(&request.kind) else {
            debug!(call_id = %request.id, kind = %request.kind, "No handler registered");
            let err = BusError::not_found(format!(
                "No handler registered for message type '{}'",
                request.kind
            ));
            return Envelope::failure(&request, err.to_payload());
        };

        debug!(
            call_id = %request.id,
            kind = %request.kind,
            from = %request.from,
            "Dispatching request"
        );
        let outcome = AssertUnwindSafe(handler.handle(request.clone(), stream))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) if response.answers(&request) && response.is_terminal() => response,
            Ok(Ok(response)) => {
                warn!(
                    call_id = %request.id,
                    kind = %request.kind,
                    response_id = %response.id,
                    response_kind = %response.kind,
                    "Handler returned a response that does not answer its request"
                );
                let err = BusError::internal(format!(
                    "Handler for '{}' returned a malformed response",
                    request.kind
                ));
                Envelope::failure(&request, err.to_payload())
            }
            Ok(Err(e)) => {
                let payload = normalize_error(&e);
                warn!(
                    call_id = %request.id,
                    kind = %request.kind,
                    code = %payload.code,
                    error = %e,
                    "Handler failed"
                );
                Envelope::failure(&request, payload)
            }
            Err(panic) => {
                let payload = normalize_panic(panic.as_ref());
                warn!(
                    call_id = %request.id,
                    kind = %request.kind,
                    message = %payload.message,
                    "Handler panicked"
                );
                Envelope::failure(&request, payload)
            }
        }
    }
}

impl InboundHook for Dispatcher {
    fn on_message(&self, envelope: Envelope, reply: ReplySink) -> bool {
        self.accept(envelope, reply)
    }
}

/// Convert a handler error into an on-wire error value.
///
/// A [`BusError`] anywhere in the error chain keeps its code, message and
/// details. Anything else is `Internal` with the error's own message, or a
/// generic message if it has none.
pub fn normalize_error(err: &anyhow::Error) -> ErrorPayload {
    if let Some(bus) = err.chain().find_map(|e| e.downcast_ref::<BusError>()) {
        return bus.to_payload();
    }
    let message = err.to_string();
    ErrorPayload {
        code: ErrorCode::Internal,
        message: if message.trim().is_empty() {
            GENERIC_FAILURE_MESSAGE.to_string()
        } else {
            message
        },
        details: None,
    }
}

/// Convert a captured panic into an `Internal` error value.
fn normalize_panic(panic: &(dyn Any + Send)) -> ErrorPayload {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string());
    ErrorPayload {
        code: ErrorCode::Internal,
        message,
        details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use courier_types::{Role, PROTOCOL_VERSION};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    fn request(kind: &str) -> Envelope {
        Envelope::request("d-1", Role::Content, Role::Background, kind, json!({"x": 1}))
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(HandlerRegistry::new()), PROTOCOL_VERSION)
    }

    async fn run(dispatcher: &Dispatcher, req: Envelope) -> Envelope {
        let stream = StreamSink::detached(&req);
        dispatcher.dispatch(req, stream).await
    }

    fn failure(res: &Envelope) -> &ErrorPayload {
        match res.outcome() {
            Some(Err(e)) => e,
            other => panic!("Expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_handler_is_not_found() {
        let d = dispatcher();
        let req = request("MISSING");
        let res = run(&d, req.clone()).await;
        assert!(res.answers(&req));
        assert_eq!(failure(&res).code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_success_forwarded_verbatim() {
        let d = dispatcher();
        d.registry().add_fn("ECHO", |req: Envelope, _s| async move {
            let payload = req.payload().cloned().unwrap_or(Value::Null);
            Ok(Envelope::success(&req, payload))
        });
        let res = run(&d, request("ECHO")).await;
        assert_eq!(res.outcome(), Some(&Ok(json!({"x": 1}))));
    }

    #[tokio::test]
    async fn test_coded_error_passes_through() {
        let d = dispatcher();
        d.registry().add_fn("ECHO", |_req: Envelope, _s| async move {
            Err(anyhow::Error::new(
                BusError::bad_request("bad").with_details(json!({"field": "cv"})),
            ))
        });
        let res = run(&d, request("ECHO")).await;
        let err = failure(&res);
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, "bad");
        assert_eq!(err.details, Some(json!({"field": "cv"})));
    }

    #[tokio::test]
    async fn test_context_wrapped_bus_error_keeps_code() {
        let d = dispatcher();
        d.registry().add_fn("SCORE", |_req: Envelope, _s| async move {
            let inner: Result<Envelope, BusError> = Err(BusError::unavailable("model loading"));
            inner.context("scoring failed")
        });
        let res = run(&d, request("SCORE")).await;
        assert_eq!(failure(&res).code, ErrorCode::Unavailable);
        assert_eq!(failure(&res).message, "model loading");
    }

    #[tokio::test]
    async fn test_uncoded_error_is_internal() {
        let d = dispatcher();
        d.registry().add_fn("ECHO", |_req: Envelope, _s| async move {
            Err(anyhow::anyhow!("storage offline"))
        });
        let res = run(&d, request("ECHO")).await;
        assert_eq!(failure(&res).code, ErrorCode::Internal);
        assert_eq!(failure(&res).message, "storage offline");
    }

    #[tokio::test]
    async fn test_panic_with_plain_value_is_generic_internal() {
        let d = dispatcher();
        d.registry().add_fn("BOOM", |_req: Envelope, _s| async move {
            if true {
                std::panic::panic_any(42_u32);
            }
            Err(anyhow::anyhow!("unreachable"))
        });
        let res = run(&d, request("BOOM")).await;
        assert_eq!(failure(&res).code, ErrorCode::Internal);
        assert_eq!(failure(&res).message, GENERIC_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_malformed_response_replaced() {
        let d = dispatcher();
        d.registry().add_fn("ECHO", |req: Envelope, _s| async move {
            let mut res = Envelope::success(&req, Value::Null);
            res.id = "someone-else".to_string();
            Ok(res)
        });
        let req = request("ECHO");
        let res = run(&d, req.clone()).await;
        assert!(res.answers(&req));
        assert_eq!(failure(&res).code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_accept_ignores_version_mismatch_and_responses() {
        let d = dispatcher();
        let replies = Arc::new(Mutex::new(0));
        let replies_clone = Arc::clone(&replies);
        let sink = ReplySink::new("d-1", move |_r| *replies_clone.lock().unwrap() += 1);

        let mut old = request("PING");
        old.protocol_version = PROTOCOL_VERSION + 1;
        assert!(!d.accept(old, sink.clone()));

        let response = Envelope::success(&request("PING"), Value::Null);
        assert!(!d.accept(response, sink.clone()));

        assert!(d.accept(request("PING"), sink));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*replies.lock().unwrap(), 1);
    }

    #[test]
    fn test_normalize_blank_message() {
        let payload = normalize_error(&anyhow::anyhow!("  "));
        assert_eq!(payload.message, GENERIC_FAILURE_MESSAGE);
        let payload = normalize_panic(&"index out of bounds");
        assert_eq!(payload.message, "index out of bounds");
    }
}
