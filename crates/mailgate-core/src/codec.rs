//! Message codec for the WebSocket transport.
//!
//! One transport frame carries exactly one message. Binary frames hold CBOR,
//! text frames hold JSON; the frame type selects the [`WireFormat`].

use crate::error::GateResult;
use std::io::Cursor;

/// Encoding used for a frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// CBOR in a binary frame.
    #[default]
    Cbor,
    /// JSON in a text frame.
    Json,
}

/// Encode a serializable value in the given format.
pub fn encode<T: serde::Serialize>(value: &T, format: WireFormat) -> GateResult<Vec<u8>> {
    match format {
        WireFormat::Cbor => {
            let mut payload = Vec::new();
            ciborium::into_writer(value, &mut payload)?;
            Ok(payload)
        }
        WireFormat::Json => Ok(serde_json::to_vec(value)?),
    }
}

/// Decode a frame payload in the given format into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8], format: WireFormat) -> GateResult<T> {
    match format {
        WireFormat::Cbor => {
            let value: T = ciborium::from_reader(Cursor::new(data))?;
            Ok(value)
        }
        WireFormat::Json => Ok(serde_json::from_slice(data)?),
    }
}
