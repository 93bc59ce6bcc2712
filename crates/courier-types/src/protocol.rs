//! Typed operation contracts.
//!
//! Each operation is a zero-sized marker type that ties a request type name to
//! its payload and result shapes. The caller and dispatcher stay generic over
//! [`Operation`] while call sites get full typing:
//!
//! ```
//! use courier_types::protocol::{Operation, Ping, PingPayload};
//! assert_eq!(Ping::TYPE, "PING");
//! let _payload: <Ping as Operation>::Payload = PingPayload { t: 123 };
//! ```

use crate::envelope::{response_type, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A request type together with its payload and result shapes.
pub trait Operation: Send + Sync + 'static {
    /// Request type name placed in the envelope's `type` field.
    const TYPE: &'static str;
    /// Request input.
    type Payload: Serialize + DeserializeOwned + Send + 'static;
    /// Successful result.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Type name of this operation's responses.
    fn response_type() -> String {
        response_type(Self::TYPE)
    }
}

/// Liveness probe.
#[derive(Debug, Clone, Copy)]
pub struct Ping;

/// Payload of [`Ping`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Caller-chosen timestamp echoed back in the reply.
    pub t: i64,
}

/// Result of [`Ping`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// The timestamp from the request.
    pub t: i64,
    /// Role of the context that answered.
    pub role: Role,
}

impl Operation for Ping {
    const TYPE: &'static str = "PING";
    type Payload = PingPayload;
    type Output = Pong;
}
