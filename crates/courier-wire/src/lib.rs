//! The courier message bus across process boundaries.
//!
//! Carries bus envelopes between processes over TCP, one long-lived
//! connection per peer pair.
//!
//! ## Architecture
//!
//! - **WireNode**: listens for and opens connections, and implements the bus
//!   [`Transport`](courier_bus::Transport) so a [`Bus`](courier_bus::Bus) can
//!   run on top of it
//! - **WireRegistry**: tracks connected nodes and the role each one plays
//! - **WireFrame**: length-prefixed JSON frames (handshake, envelopes, port close)

pub mod message;
pub mod peer;
pub mod registry;

pub use message::{WireFrame, MAX_FRAME_SIZE};
pub use peer::{WireConfig, WireError, WireNode};
pub use registry::{PeerState, WirePeer, WireRegistry};
