//! JSON wire format.
//!
//! JSON bodies carry no type marker of their own; framed messages are typed by
//! the header's message id, header-less lines by trial decoding.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CodecError, WireFormat};

pub(super) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode {
        format: WireFormat::Json,
        reason: e.to_string(),
    })
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
        format: WireFormat::Json,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        room: String,
        text: String,
    }

    #[test]
    fn tolerates_trailing_newline() {
        let chat: Chat = decode(b"{\"room\":\"lobby\",\"text\":\"hi\"}\n").unwrap();
        assert_eq!(chat.room, "lobby");
    }

    #[test]
    fn decode_error_carries_format() {
        let err = decode::<Chat>(b"{\"room\":1}").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Decode {
                format: WireFormat::Json,
                ..
            }
        ));
        assert_eq!(err.code(), 6);
    }
}
