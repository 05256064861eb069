// Pluggable wire codec
//
// The plane moves opaque payloads; the serializer turns a RoutedMessage
// into the bytes carried inside a frame and back. Implementations must be
// deterministic and self-describing for the types they register.

use bytes::Bytes;

use crate::error::{MeshError, Result};
use crate::types::RoutedMessage;

/// Cap on decoded message size, independent of the per-frame limit.
/// Prevents memory exhaustion from hostile length fields inside the payload.
pub const MAX_DECODE_SIZE: usize = 16_777_216; // 16MB

/// Codec contract consumed by senders and the inbound delivery path.
pub trait Serializer: Send + Sync {
    /// Identifier advertised in the node's address so peers can detect
    /// codec mismatches.
    fn serializer_id(&self) -> u32;

    fn serialize(&self, message: &RoutedMessage) -> Result<Bytes>;

    fn deserialize(&self, data: &[u8]) -> Result<RoutedMessage>;
}

/// Default bincode codec.
#[derive(Debug, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for BincodeSerializer {
    fn serializer_id(&self) -> u32 {
        1
    }

    fn serialize(&self, message: &RoutedMessage) -> Result<Bytes> {
        bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<RoutedMessage> {
        bincode::serde::decode_from_slice(
            data,
            bincode::config::standard().with_limit::<MAX_DECODE_SIZE>(),
        )
        .map(|(message, _)| message)
        .map_err(|e| MeshError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_round_trip() {
        let serializer = BincodeSerializer::new();
        let message = RoutedMessage {
            container_indexes: vec![0, 3],
            key: Bytes::from_static(b"user-42"),
            payload: Bytes::from_static(b"payload bytes"),
        };

        let wire = serializer.serialize(&message).unwrap();
        let back = serializer.deserialize(&wire).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_garbage_rejected() {
        let serializer = BincodeSerializer::new();
        assert!(serializer.deserialize(&[0xff; 3]).is_err());
    }
}
