//! Wire frames.
//!
//! Every frame is a JSON object prefixed with a 4-byte big-endian length
//! header. A connection opens with `hello` / `hello_ack`, after which both
//! sides exchange `envelope` and `closed` frames in any order.

use courier_types::{Envelope, Role};
use serde::{Deserialize, Serialize};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// A frame on a courier wire connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WireFrame {
    /// First frame from the connecting side.
    Hello {
        node_id: String,
        role: Role,
        protocol_version: u32,
    },
    /// Accepting side's answer to a compatible `hello`.
    HelloAck {
        node_id: String,
        role: Role,
        protocol_version: u32,
    },
    /// Handshake refused; the connection closes after this frame.
    Rejected { message: String },
    /// A bus envelope, request or response.
    Envelope { envelope: Envelope },
    /// The receiver of request `id` will never answer it.
    Closed { id: String },
}

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &WireFrame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a frame.
pub fn decode_frame(body: &[u8]) -> Result<WireFrame, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_length_prefix_matches_body() {
        let frame = WireFrame::Closed {
            id: "c-1".to_string(),
        };
        let bytes = encode_frame(&frame).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(decode_frame(&bytes[4..]).unwrap(), frame);
    }

    #[test]
    fn test_hello_wire_shape() {
        let frame = WireFrame::Hello {
            node_id: "node-a".to_string(),
            role: Role::Ui,
            protocol_version: 1,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"frame": "hello", "node_id": "node-a", "role": "ui", "protocol_version": 1})
        );
    }

    #[test]
    fn test_envelope_frame_keeps_envelope_format() {
        let request = Envelope::request("m-1", Role::Ui, Role::Background, "PING", json!({"t": 5}));
        let reply = Envelope::success(&request, json!({"t": 5, "role": "background"}));
        let bytes = encode_frame(&WireFrame::Envelope {
            envelope: reply.clone(),
        })
        .unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(raw["frame"], "envelope");
        assert_eq!(raw["envelope"]["type"], "PING:RES");
        assert_eq!(raw["envelope"]["ok"], true);

        match decode_frame(&bytes[4..]).unwrap() {
            WireFrame::Envelope { envelope } => assert_eq!(envelope, reply),
            other => panic!("Expected Envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_rejected() {
        assert!(decode_frame(br#"{"frame":"gossip"}"#).is_err());
    }
}
