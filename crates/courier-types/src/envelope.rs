//! The envelope, the only unit ever placed on a transport.
//!
//! On the wire an envelope is a flat JSON object:
//!
//! ```json
//! {"protocolVersion":1,"id":"l2x9k-3f0a","from":"ui","to":"background",
//!  "type":"PING","payload":{"t":123}}
//! ```
//!
//! Responses use the type `"<request type>:RES"` and carry either
//! `ok:true, result` or `ok:false, error`. A response with `stream:true` is a
//! non-terminal piece; the terminal piece has `stream` false or absent.

use crate::error::ErrorPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Suffix appended to a request type to form its response type.
pub const RESPONSE_SUFFIX: &str = ":RES";

/// Logical role of an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    /// The long-lived background agent.
    Background,
    /// A per-page content script.
    Content,
    /// A short-lived popup or panel UI.
    Ui,
    /// Any other role name.
    Custom(String),
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Background => "background",
            Self::Content => "content",
            Self::Ui => "ui",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "background" => Self::Background,
            "content" => Self::Content,
            "ui" => Self::Ui,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle narrowing a role to one peer instance (e.g. a tab id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetContext {
    /// Numeric handle.
    Id(u64),
    /// Named handle.
    Name(String),
}

impl From<u64> for TargetContext {
    fn from(id: u64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for TargetContext {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for TargetContext {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for TargetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// What an envelope carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// An operation request with its input.
    Request { payload: Value },
    /// A response: `ok:true, result` or `ok:false, error`.
    Response(Result<Value, ErrorPayload>),
}

/// Structural validation failures when decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("response envelope '{0}' is missing the ok flag")]
    MissingOk(String),
    #[error("failed response envelope '{0}' is missing its error")]
    MissingError(String),
    #[error("request envelope '{0}' carries a response outcome")]
    OutcomeOnRequest(String),
}

/// A versioned, typed message exchanged between contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    /// Protocol version of the sender.
    pub protocol_version: u32,
    /// Correlation id shared by a request and all of its responses.
    pub id: String,
    /// Role of the sender.
    pub from: Role,
    /// Role of the intended receiver.
    pub to: Role,
    /// Optional handle narrowing `to` to one peer instance.
    pub target_context: Option<TargetContext>,
    /// Operation name, or `"<operation>:RES"` for responses.
    pub kind: String,
    /// True for a non-terminal response piece.
    pub stream: bool,
    /// Request payload or response outcome.
    pub body: Body,
}

impl Envelope {
    /// Build a request envelope at the current protocol version.
    pub fn request(
        id: impl Into<String>,
        from: Role,
        to: Role,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            id: id.into(),
            from,
            to,
            target_context: None,
            kind: kind.into(),
            stream: false,
            body: Body::Request { payload },
        }
    }

    /// Narrow the receiver to one peer instance.
    pub fn with_target(mut self, target: Option<TargetContext>) -> Self {
        self.target_context = target;
        self
    }

    /// Terminal `ok:true` response to `request`.
    pub fn success(request: &Envelope, result: Value) -> Self {
        Self::response_to(request, false, Ok(result))
    }

    /// Terminal `ok:false` response to `request`.
    pub fn failure(request: &Envelope, error: ErrorPayload) -> Self {
        Self::response_to(request, false, Err(error))
    }

    /// Non-terminal piece carrying progress or partial data for `request`.
    pub fn stream_piece(request: &Envelope, data: Value) -> Self {
        Self::response_to(request, true, Ok(data))
    }

    fn response_to(request: &Envelope, stream: bool, outcome: Result<Value, ErrorPayload>) -> Self {
        Self {
            protocol_version: request.protocol_version,
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            target_context: request.target_context.clone(),
            kind: response_type(&request.kind),
            stream,
            body: Body::Response(outcome),
        }
    }

    /// True if the body carries a request payload.
    pub fn is_request(&self) -> bool {
        matches!(self.body, Body::Request { .. })
    }

    /// True if the body carries an outcome.
    pub fn is_response(&self) -> bool {
        matches!(self.body, Body::Response(_))
    }

    /// True unless this is a non-terminal stream piece.
    pub fn is_terminal(&self) -> bool {
        !self.stream
    }

    /// Request payload, if this is a request.
    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            Body::Request { payload } => Some(payload),
            Body::Response(_) => None,
        }
    }

    /// Response outcome, if this is a response.
    pub fn outcome(&self) -> Option<&Result<Value, ErrorPayload>> {
        match &self.body {
            Body::Response(outcome) => Some(outcome),
            Body::Request { .. } => None,
        }
    }

    /// Whether this envelope is a well-formed response to `request`.
    pub fn answers(&self, request: &Envelope) -> bool {
        self.is_response() && self.id == request.id && self.kind == response_type(&request.kind)
    }
}

/// Response type for a request type.
pub fn response_type(request_type: &str) -> String {
    format!("{request_type}{RESPONSE_SUFFIX}")
}

/// Request type a response type answers, or `None` if `kind` is not a response type.
pub fn request_type_of(kind: &str) -> Option<&str> {
    kind.strip_suffix(RESPONSE_SUFFIX)
}

/// Flat wire shape of an envelope.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    protocol_version: u32,
    id: String,
    from: Role,
    to: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_context: Option<TargetContext>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "is_false")]
    stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let body = if request_type_of(&raw.kind).is_some() {
            match raw.ok {
                Some(true) => Body::Response(Ok(raw.result.unwrap_or(Value::Null))),
                Some(false) => match raw.error {
                    Some(error) => Body::Response(Err(error)),
                    None => return Err(EnvelopeError::MissingError(raw.kind)),
                },
                None => return Err(EnvelopeError::MissingOk(raw.kind)),
            }
        } else {
            if raw.ok.is_some() {
                return Err(EnvelopeError::OutcomeOnRequest(raw.kind));
            }
            Body::Request {
                payload: raw.payload.unwrap_or(Value::Null),
            }
        };

        Ok(Self {
            protocol_version: raw.protocol_version,
            id: raw.id,
            from: raw.from,
            to: raw.to,
            target_context: raw.target_context,
            kind: raw.kind,
            stream: raw.stream,
            body,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(env: Envelope) -> Self {
        let (payload, ok, result, error) = match env.body {
            Body::Request { payload } => (Some(payload), None, None, None),
            Body::Response(Ok(result)) => (None, Some(true), Some(result), None),
            Body::Response(Err(error)) => (None, Some(false), None, Some(error)),
        };
        Self {
            protocol_version: env.protocol_version,
            id: env.id,
            from: env.from,
            to: env.to,
            target_context: env.target_context,
            kind: env.kind,
            stream: env.stream,
            payload,
            ok,
            result,
            error,
        }
    }
}
