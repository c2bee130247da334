//! Tunnel protocol messages.
//!
//! Every message on the transport is one [`Message`], internally tagged by a
//! `type` field. Stream-scoped messages carry an explicit `stream_id`; there
//! is one message type per kind rather than one event name per stream.
//!
//! | Direction | `type`   | Fields                                  |
//! |-----------|----------|-----------------------------------------|
//! | c→g       | `open`   | `request_id`, `host`, `port`            |
//! | g→c       | `opened` | `request_id`, `stream_id`               |
//! | both      | `data`   | `stream_id`, `data`, `ack` (c→g only)   |
//! | g→c       | `ack`    | `stream_id`, `ack`                      |
//! | both      | `end`    | `stream_id`                             |
//! | g→c       | `error`  | `stream_id`, `message`, `request_id`    |
//! | g→c       | `close`  | `stream_id`                             |
//! | c→g       | `ping`   | `id`                                    |
//! | g→c       | `pong`   | `id`                                    |

use serde::{Deserialize, Serialize};

/// Identifier of a stream within one session. Allocated by the gateway,
/// starting at 1.
pub type StreamId = u32;

/// A single tunnel protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Request a new stream to `host:port`. `request_id` is chosen by the
    /// client and echoed in the reply.
    Open {
        request_id: u32,
        host: String,
        port: u16,
    },

    /// The TCP connection for `request_id` is established.
    Opened { request_id: u32, stream_id: StreamId },

    /// Payload bytes for a stream. A client may attach an `ack` token to be
    /// told when the bytes were written to the destination socket.
    Data {
        stream_id: StreamId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u32>,
    },

    /// Write acknowledgement for a `data` message that carried `ack`.
    Ack { stream_id: StreamId, ack: u32 },

    /// Half-close. From the client: shut down the write side towards the
    /// destination. From the gateway: the destination closed its write side.
    End { stream_id: StreamId },

    /// Socket error on a stream. `request_id` is set when the error is the
    /// failure of the `open` with that id.
    Error {
        stream_id: StreamId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u32>,
    },

    /// The destination connection is fully closed. The id is never reused.
    Close { stream_id: StreamId },

    Ping { id: u64 },

    Pong { id: u64 },
}

impl Message {
    /// The stream this message refers to, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Message::Opened { stream_id, .. }
            | Message::Data { stream_id, .. }
            | Message::Ack { stream_id, .. }
            | Message::End { stream_id }
            | Message::Error { stream_id, .. }
            | Message::Close { stream_id } => Some(*stream_id),
            Message::Open { .. } | Message::Ping { .. } | Message::Pong { .. } => None,
        }
    }

    /// Short name of the message kind, matching the wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open { .. } => "open",
            Message::Opened { .. } => "opened",
            Message::Data { .. } => "data",
            Message::Ack { .. } => "ack",
            Message::End { .. } => "end",
            Message::Error { .. } => "error",
            Message::Close { .. } => "close",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }
}

// ── Byte payload serde ───────────────────────────────────────────────

/// Serializes `Vec<u8>` as a native byte string (CBOR) and accepts either a
/// byte string or a sequence of integers (JSON arrays) when deserializing.
mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}
