// src/core/message.rs

//! The decoded NetworkMessage model and the codec collaborator interface.
//!
//! The wire format itself is out of scope for the control plane: a codec is
//! supplied at construction and consumed through the staged
//! `decode_headers` / `decode_payload` / `decode_footers` contract, which
//! lets the security pass run between header and payload decoding.

use crate::core::errors::PubSubError;
use crate::core::value::{PublisherId, Variant};
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Which optional header sections are present in a NetworkMessage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NetworkMessageContentFlags: u32 {
        const PUBLISHER_ID    = 1 << 0;
        const GROUP_HEADER    = 1 << 1;
        const WRITER_GROUP_ID = 1 << 2;
        const PAYLOAD_HEADER  = 1 << 3;
        const TIMESTAMP       = 1 << 4;
        const SECURITY_HEADER = 1 << 5;
        const PROMOTED_FIELDS = 1 << 6;
    }
}

mod content_flags_serde {
    use super::NetworkMessageContentFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        flags: &NetworkMessageContentFlags,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(flags.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NetworkMessageContentFlags, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(NetworkMessageContentFlags::from_bits_truncate(bits))
    }
}

/// The security section of a NetworkMessage header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecurityHeader {
    pub security_token_id: u32,
    #[serde(default)]
    pub message_nonce: Bytes,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub encrypted: bool,
}

/// One dataset message inside a NetworkMessage payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetMessage {
    pub data_set_writer_id: u16,
    #[serde(default)]
    pub sequence_number: u16,
    pub fields: Vec<Variant>,
}

/// A fully or partially decoded NetworkMessage. `decode_headers` fills the
/// header fields; `decode_payload` fills `messages`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkMessage {
    #[serde(default, with = "content_flags_serde")]
    pub content: NetworkMessageContentFlags,
    #[serde(default)]
    pub publisher_id: Option<PublisherId>,
    #[serde(default)]
    pub writer_group_id: Option<u16>,
    #[serde(default)]
    pub security: Option<SecurityHeader>,
    #[serde(default)]
    pub messages: Vec<DataSetMessage>,
}

impl NetworkMessage {
    /// Releases all owned buffers. Idempotent.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Staged decoder/encoder for NetworkMessages, supplied at stack
/// construction. All calls run under the service mutex.
pub trait NetworkMessageCodec: Send + Sync {
    fn decode_headers(&self, buffer: &Bytes, pos: &mut usize)
    -> Result<NetworkMessage, PubSubError>;

    fn decode_payload(
        &self,
        buffer: &Bytes,
        pos: &mut usize,
        nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError>;

    fn decode_footers(
        &self,
        buffer: &Bytes,
        pos: &mut usize,
        nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError>;

    fn encode(&self, nm: &NetworkMessage) -> Result<Bytes, PubSubError>;
}

/// Reference codec for the JSON message mapping.
///
/// JSON has no incremental framing, so the whole document is parsed during
/// the header stage; the payload and footer stages are no-ops. Trailing
/// bytes after the JSON value (for example a detached signature) are left
/// for the security layer.
#[derive(Debug, Default, Clone)]
pub struct JsonNetworkMessageCodec;

impl NetworkMessageCodec for JsonNetworkMessageCodec {
    fn decode_headers(
        &self,
        buffer: &Bytes,
        pos: &mut usize,
    ) -> Result<NetworkMessage, PubSubError> {
        let mut stream =
            serde_json::Deserializer::from_slice(&buffer[*pos..]).into_iter::<NetworkMessage>();
        let nm = stream
            .next()
            .ok_or_else(|| PubSubError::Decode("empty buffer".to_string()))??;
        *pos += stream.byte_offset();
        Ok(nm)
    }

    fn decode_payload(
        &self,
        _buffer: &Bytes,
        _pos: &mut usize,
        _nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError> {
        // Parsed together with the headers.
        Ok(())
    }

    fn decode_footers(
        &self,
        _buffer: &Bytes,
        _pos: &mut usize,
        _nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError> {
        Ok(())
    }

    fn encode(&self, nm: &NetworkMessage) -> Result<Bytes, PubSubError> {
        Ok(Bytes::from(serde_json::to_vec(nm)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trip() {
        let codec = JsonNetworkMessageCodec;
        let nm = NetworkMessage {
            content: NetworkMessageContentFlags::PUBLISHER_ID
                | NetworkMessageContentFlags::WRITER_GROUP_ID,
            publisher_id: Some(PublisherId::UInt16(7)),
            writer_group_id: Some(1),
            security: None,
            messages: vec![DataSetMessage {
                data_set_writer_id: 1,
                sequence_number: 3,
                fields: vec![Variant::UInt32(42), Variant::Bool(true)],
            }],
        };

        let encoded = codec.encode(&nm).unwrap();
        let mut pos = 0;
        let mut decoded = codec.decode_headers(&encoded, &mut pos).unwrap();
        codec.decode_payload(&encoded, &mut pos, &mut decoded).unwrap();
        codec.decode_footers(&encoded, &mut pos, &mut decoded).unwrap();
        assert_eq!(decoded, nm);
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn json_codec_rejects_garbage() {
        let codec = JsonNetworkMessageCodec;
        let mut pos = 0;
        let err = codec
            .decode_headers(&Bytes::from_static(b"not-json"), &mut pos)
            .unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));
    }
}
