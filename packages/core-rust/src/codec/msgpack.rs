//! `MsgPack` wire format.
//!
//! Structs are written as maps with field names so peers in other languages
//! can decode them without sharing a positional schema.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CodecError, WireFormat};

pub(super) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode {
        format: WireFormat::MsgPack,
        reason: e.to_string(),
    })
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode {
        format: WireFormat::MsgPack,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Score {
        player: u32,
        points: i64,
    }

    #[test]
    fn writes_field_names() {
        let bytes = encode(&Score {
            player: 1,
            points: -5,
        })
        .unwrap();
        // fixmap with two entries
        assert_eq!(bytes[0], 0x82);
        assert!(bytes.windows(6).any(|w| w == b"player"));
    }

    #[test]
    fn truncated_input_fails() {
        let bytes = encode(&Score {
            player: 9,
            points: 1000,
        })
        .unwrap();
        let err = decode::<Score>(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err.code(), 2);
    }
}
