//! Output pipeline: structured vehicle messages bound for the host.
//!
//! The manager publishes completed diagnostic responses here; the firmware
//! main loop drains the queue into whatever transport is attached.

use arrayvec::ArrayString;
use heapless::{Deque, Vec};
use serde::Serialize;
use tracing::warn;

use crate::codec::MAX_RESPONSE_PAYLOAD;
use crate::request::MAX_DECODED_VALUE_LENGTH;

pub use crate::request::SignalName;

pub const MAX_PIPELINE_MESSAGES: usize = 32;
/// "0x" plus two hex characters per payload byte.
pub const MAX_HEX_PAYLOAD_LENGTH: usize = 2 + 2 * MAX_RESPONSE_PAYLOAD;

/// A decoded value: numeric for single-frame readings, text for reassembled
/// multi-frame payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    Num(f64),
    Text(ArrayString<MAX_DECODED_VALUE_LENGTH>),
}

/// Full details of one diagnostic response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticMessage {
    pub bus: u8,
    pub message_id: u32,
    pub mode: u8,
    pub pid: u16,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_response_code: Option<u8>,
    /// Present when the request carried a decoder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<SignalValue>,
    /// Raw payload bytes when no decoder was provided.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8, MAX_RESPONSE_PAYLOAD>,
}

/// One in-progress slice of a multi-frame response, emitted while streaming
/// is enabled. `frame` counts up from zero and resets to -1 on the final
/// slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialFrameMessage {
    pub timestamp: u64,
    pub frame: i32,
    pub message_id: u32,
    pub bus: u8,
    pub total_size: u32,
    pub mode: u8,
    pub pid: u16,
    pub value: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_response_code: Option<u8>,
    pub payload: ArrayString<MAX_HEX_PAYLOAD_LENGTH>,
}

impl PartialFrameMessage {
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Render payload bytes as a `0x`-prefixed lowercase hex string.
pub fn hex_payload(bytes: &[u8]) -> ArrayString<MAX_HEX_PAYLOAD_LENGTH> {
    let mut out = ArrayString::new();
    let _ = out.try_push_str("0x");
    for byte in bytes.iter().take(MAX_RESPONSE_PAYLOAD) {
        let _ = core::fmt::write(&mut out, format_args!("{:02x}", byte));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum VehicleMessage {
    /// A short named signal carrying a single decoded value.
    Named { name: SignalName, value: SignalValue },
    Diagnostic(DiagnosticMessage),
    Partial(PartialFrameMessage),
}

/// Bounded sink the host drains. Publishing to a full pipeline drops the
/// oldest message.
#[derive(Debug, Default)]
pub struct Pipeline {
    messages: Deque<VehicleMessage, MAX_PIPELINE_MESSAGES>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, message: VehicleMessage) {
        if self.messages.is_full() {
            warn!("pipeline full, dropping oldest vehicle message");
            self.messages.pop_front();
        }
        let _ = self.messages.push_back(message);
    }

    pub fn publish_numeric(&mut self, name: &SignalName, value: f64) {
        self.publish(VehicleMessage::Named {
            name: *name,
            value: SignalValue::Num(value),
        });
    }

    pub fn publish_text(&mut self, name: &SignalName, value: ArrayString<MAX_DECODED_VALUE_LENGTH>) {
        self.publish(VehicleMessage::Named {
            name: *name,
            value: SignalValue::Text(value),
        });
    }

    pub fn pop(&mut self) -> Option<VehicleMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_payload_rendering() {
        assert_eq!(hex_payload(&[0x1A, 0xF8]).as_str(), "0x1af8");
        assert_eq!(hex_payload(&[]).as_str(), "0x");
    }

    #[test]
    fn test_pipeline_drops_oldest_when_full() {
        let mut pipeline = Pipeline::new();
        for i in 0..(MAX_PIPELINE_MESSAGES + 1) as u16 {
            let mut name = SignalName::new();
            let _ = core::fmt::write(&mut name, format_args!("signal_{}", i));
            pipeline.publish_numeric(&name, f64::from(i));
        }
        assert_eq!(pipeline.len(), MAX_PIPELINE_MESSAGES);
        match pipeline.pop().unwrap() {
            VehicleMessage::Named { name, .. } => assert_eq!(name.as_str(), "signal_1"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_json_shape() {
        let message = PartialFrameMessage {
            timestamp: 1234,
            frame: 0,
            message_id: 0x7E8,
            bus: 1,
            total_size: 0,
            mode: 0x09,
            pid: 0x02,
            value: 0,
            success: true,
            negative_response_code: None,
            payload: hex_payload(&[0x49, 0x02]),
        };
        let json = message.to_json().unwrap();
        assert!(json.contains(r#""frame":0"#));
        assert!(json.contains(r#""payload":"0x4902""#));
        assert!(!json.contains("negative_response_code"));
    }
}
