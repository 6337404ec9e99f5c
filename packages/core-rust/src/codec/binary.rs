//! Schema-typed binary wire format.
//!
//! Fields are laid out positionally in declaration order, so both peers must
//! agree on the exact Rust type for each message id. Input is never trusted
//! to size allocations beyond what it actually contains, and a payload must
//! be consumed exactly: trailing bytes fail the decode, so header-less trial
//! decoding does not settle on a shorter type that happens to fit a prefix.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CodecError, WireFormat};

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(super) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    options().serialize(value).map_err(|e| CodecError::Encode {
        format: WireFormat::Binary,
        reason: e.to_string(),
    })
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    options()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)
        .map_err(|e| CodecError::Decode {
            format: WireFormat::Binary,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        entity: u64,
        x: f32,
        y: f32,
    }

    #[test]
    fn layout_is_positional() {
        let bytes = encode(&Position {
            entity: 1,
            x: 0.0,
            y: 0.0,
        })
        .unwrap();
        assert_eq!(bytes.len(), 8 + 4 + 4);
        assert_eq!(&bytes[..8], &1u64.to_le_bytes());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&7u32).unwrap();
        assert_eq!(decode::<u32>(&bytes).unwrap(), 7);
        bytes.push(0);
        assert_eq!(decode::<u32>(&bytes).unwrap_err().code(), 4);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        // A Vec<u8> claiming u64::MAX elements backed by three bytes.
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let err = decode::<Vec<u8>>(&bytes).unwrap_err();
        assert_eq!(err.code(), 4);
    }
}
