//! Core types for the Courier message bus.
//!
//! This crate defines the shared vocabulary that every execution context
//! speaks: the versioned [`Envelope`](envelope::Envelope), the error taxonomy,
//! the typed [`Operation`](protocol::Operation) contract, correlation ids and
//! bus configuration. It has no runtime behavior of its own.

pub mod config;
pub mod envelope;
pub mod error;
pub mod id;
pub mod protocol;

pub use config::{BusConfig, ConfigError};
pub use envelope::{Body, Envelope, Role, TargetContext, PROTOCOL_VERSION};
pub use error::{BusError, BusResult, ErrorCode, ErrorPayload};
pub use protocol::Operation;
