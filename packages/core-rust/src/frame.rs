//! Fixed-size binary frame header.
//!
//! Every framed message on the wire is a 9-byte header followed by
//! `length` bytes of payload:
//!
//! | field | width | meaning |
//! |---|---|---|
//! | `length` | 4 | payload byte count |
//! | `id` | 2 | message id, selects the registered request type |
//! | `index` | 2 | sequence index, combined with `id` into a [`Tag`] |
//! | `flags` | 1 | bit0 encrypted, bit1 compressed |
//!
//! All multi-byte fields are big-endian (network order). Peers that relied on
//! a native little-endian layout must be upgraded together with this crate.

use bytes::{Buf, BufMut};

use crate::message::Tag;

/// Size of the encoded header in bytes.
pub const HEAD_SIZE: usize = 9;

/// Default upper bound for a single frame's payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 1024 * 1024;

/// Payload is encrypted.
pub const FLAG_ENCRYPTED: u8 = 1 << 0;

/// Payload is compressed.
pub const FLAG_COMPRESSED: u8 = 1 << 1;

/// Errors produced while decoding a frame.
///
/// On stream transports every variant is connection-fatal: once a header
/// cannot be trusted, byte alignment with the peer is lost.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {available} bytes available, header needs {HEAD_SIZE}")]
    TooShort { available: usize },
    #[error("frame too long: payload length {length} exceeds maximum {max}")]
    TooLong { length: u32, max: u32 },
    #[error("frame incomplete: header announces {expected} payload bytes, {available} present")]
    Incomplete { expected: usize, available: usize },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHead {
    /// Payload byte count.
    pub length: u32,
    /// Message id.
    pub id: u16,
    /// Sequence index.
    pub index: u16,
    /// Flag bitmask (`FLAG_ENCRYPTED`, `FLAG_COMPRESSED`).
    pub flags: u8,
}

impl MessageHead {
    /// Creates a header with no payload and no flags.
    #[must_use]
    pub fn new(id: u16, index: u16) -> Self {
        Self {
            length: 0,
            id,
            index,
            flags: 0,
        }
    }

    /// Decodes a header from the first [`HEAD_SIZE`] bytes of `buf`.
    ///
    /// The length field is validated against `max_payload` before the caller
    /// allocates anything for the payload.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` if fewer than [`HEAD_SIZE`] bytes are
    /// available and `FrameError::TooLong` if the length field exceeds
    /// `max_payload`, regardless of how many bytes follow.
    pub fn decode(buf: &[u8], max_payload: u32) -> Result<Self, FrameError> {
        if buf.len() < HEAD_SIZE {
            return Err(FrameError::TooShort {
                available: buf.len(),
            });
        }

        let mut cursor = &buf[..HEAD_SIZE];
        let head = Self {
            length: cursor.get_u32(),
            id: cursor.get_u16(),
            index: cursor.get_u16(),
            flags: cursor.get_u8(),
        };

        if head.length > max_payload {
            return Err(FrameError::TooLong {
                length: head.length,
                max: max_payload,
            });
        }
        Ok(head)
    }

    /// Writes the header fields in wire order.
    pub fn encode_into<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.length);
        dst.put_u16(self.id);
        dst.put_u16(self.index);
        dst.put_u8(self.flags);
    }

    /// Returns the header as a fixed-size byte array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEAD_SIZE] {
        let mut out = [0u8; HEAD_SIZE];
        self.encode_into(&mut &mut out[..]);
        out
    }

    /// Correlation tag for this header.
    #[must_use]
    pub fn tag(&self) -> Tag {
        Tag::new(self.id, self.index)
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

impl std::fmt::Display for MessageHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "len:{} id:{} index:{} flags:{:#04b}",
            self.length, self.id, self.index, self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_fields_big_endian_in_order() {
        let head = MessageHead {
            length: 0x0102_0304,
            id: 0x0506,
            index: 0x0708,
            flags: FLAG_COMPRESSED,
        };
        assert_eq!(
            head.to_bytes(),
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x02]
        );
    }

    #[test]
    fn decode_rejects_short_input() {
        for len in 0..HEAD_SIZE {
            let buf = vec![0u8; len];
            assert_eq!(
                MessageHead::decode(&buf, DEFAULT_MAX_PAYLOAD),
                Err(FrameError::TooShort { available: len })
            );
        }
    }

    #[test]
    fn decode_rejects_length_over_maximum_even_with_bytes_present() {
        let head = MessageHead {
            length: 17,
            ..MessageHead::new(1, 1)
        };
        let mut buf = head.to_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 17]);

        assert_eq!(
            MessageHead::decode(&buf, 16),
            Err(FrameError::TooLong { length: 17, max: 16 })
        );
        assert!(MessageHead::decode(&buf, 17).is_ok());
    }

    #[test]
    fn flag_helpers() {
        let mut head = MessageHead::new(3, 4);
        assert!(!head.is_encrypted());
        assert!(!head.is_compressed());
        head.flags |= FLAG_ENCRYPTED | FLAG_COMPRESSED;
        assert!(head.is_encrypted());
        assert!(head.is_compressed());
    }

    proptest! {
        #[test]
        fn header_round_trips(length in 0u32..=DEFAULT_MAX_PAYLOAD, id: u16, index: u16, flags: u8) {
            let head = MessageHead { length, id, index, flags };
            let decoded = MessageHead::decode(&head.to_bytes(), DEFAULT_MAX_PAYLOAD).unwrap();
            prop_assert_eq!(decoded, head);
        }

        #[test]
        fn short_input_always_fails(bytes in proptest::collection::vec(any::<u8>(), 0..HEAD_SIZE)) {
            let is_too_short = matches!(
                MessageHead::decode(&bytes, u32::MAX),
                Err(FrameError::TooShort { .. })
            );
            prop_assert!(is_too_short);
        }
    }
}
