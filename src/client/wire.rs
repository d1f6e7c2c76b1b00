//! Broker wire protocol: newline-delimited JSON frames over a byte stream.
//!
//! The frame set mirrors the protocol-level events the session machine cares
//! about: connect/acknowledge, publish/acknowledge, and disconnect. Payloads
//! are UTF-8 JSON text produced by the aggregator; the wire layer does not
//! interpret them.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Upper bound on one encoded frame, payload included.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Delivery guarantee requested for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unknown qos level {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Session open request; the broker answers with `ConnAck`.
    Connect { client_id: String },
    /// Session acknowledgement completing the handshake.
    ConnAck { accepted: bool },
    /// Application payload, either direction.
    Publish {
        id: u16,
        topic: String,
        qos: QoS,
        payload: String,
    },
    /// Delivery result for an at-least-once publish.
    PubAck { id: u16, success: bool },
    /// Orderly session teardown notification.
    Disconnect,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge,
}

pub fn encode_frame(frame: &Frame) -> Result<String, WireError> {
    let encoded = serde_json::to_string(frame)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge);
    }
    Ok(encoded)
}

pub fn decode_frame(line: &str) -> Result<Frame, WireError> {
    if line.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge);
    }
    Ok(serde_json::from_str(line)?)
}

/// Writes one frame and its line terminator, flushing so small frames are
/// never held back by buffering.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let encoded =
        encode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Topic carrying periodic telemetry reports for one device.
pub fn telemetry_topic(client_id: &str) -> String {
    format!("device/{client_id}/telemetries")
}

/// Topic carrying configuration snapshots for one device.
pub fn config_topic(client_id: &str) -> String {
    format!("device/{client_id}/configs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::Publish {
            id: 42,
            topic: telemetry_topic("wind_turbine_demo"),
            qos: QoS::AtLeastOnce,
            payload: r#"{"wind_turbine":{"output_voltage":230,"output_power":512}}"#.into(),
        };
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn qos_encodes_as_wire_integer() {
        assert_eq!(serde_json::to_string(&QoS::AtMostOnce).unwrap(), "0");
        assert_eq!(serde_json::to_string(&QoS::AtLeastOnce).unwrap(), "1");
        assert!(serde_json::from_str::<QoS>("2").is_err());
    }

    #[test]
    fn topics_use_per_device_namespace() {
        assert_eq!(telemetry_topic("dev1"), "device/dev1/telemetries");
        assert_eq!(config_topic("dev1"), "device/dev1/configs");
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(decode_frame("{\"frame\":\"nope\"}").is_err());
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = Frame::Publish {
            id: 1,
            topic: "t".into(),
            qos: QoS::AtMostOnce,
            payload: "x".repeat(MAX_FRAME_SIZE),
        };
        assert!(matches!(encode_frame(&frame), Err(WireError::FrameTooLarge)));
    }
}
