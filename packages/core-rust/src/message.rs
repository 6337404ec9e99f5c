//! In-memory message representation and reply correlation tags.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{FrameError, MessageHead, HEAD_SIZE};

/// 32-bit correlation key: `id << 16 | index`.
///
/// A request and its reply share a tag. Tags are only unique among one
/// connection's in-flight callbacks at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tag(pub u32);

impl Tag {
    #[must_use]
    pub const fn new(id: u16, index: u16) -> Self {
        Self(((id as u32) << 16) | index as u32)
    }

    #[must_use]
    pub const fn id(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[must_use]
    pub const fn index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id(), self.index())
    }
}

/// A request value produced by a codec, type-erased so it can ride on a
/// [`Message`] through handler dispatch.
#[derive(Clone)]
pub struct ParsedRequest {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl ParsedRequest {
    pub fn new<T: Any + Send + Sync>(name: &'static str, value: T) -> Self {
        Self {
            name,
            value: Arc::new(value),
        }
    }

    pub(crate) fn from_arc(name: &'static str, value: Arc<dyn Any + Send + Sync>) -> Self {
        Self { name, value }
    }

    /// Rust type name of the registered request.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.name
    }

    /// Borrows the request as `T`, or `None` if it is another type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for ParsedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedRequest")
            .field("type", &self.name)
            .finish_non_exhaustive()
    }
}

/// One unit of traffic: an optional header, the payload, the request parsed
/// from it (if a codec ran), and opaque user data.
///
/// Messages without a header belong to line-delimited connections.
#[derive(Clone, Default)]
pub struct Message {
    pub head: Option<MessageHead>,
    pub payload: Bytes,
    request: Option<ParsedRequest>,
    user: Option<Arc<dyn Any + Send + Sync>>,
}

impl Message {
    /// A framed message carrying `payload`.
    pub fn framed(id: u16, index: u16, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let mut head = MessageHead::new(id, index);
        head.length = payload_len(&payload);
        Self {
            head: Some(head),
            payload,
            ..Self::default()
        }
    }

    /// A framed message from an already decoded header, keeping its flags.
    /// The length field is recomputed from `payload`.
    pub fn from_parts(head: MessageHead, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            head: Some(MessageHead {
                length: payload_len(&payload),
                ..head
            }),
            payload,
            ..Self::default()
        }
    }

    /// A framed message with an empty payload, used for acks and pings.
    #[must_use]
    pub fn tagged(id: u16, index: u16) -> Self {
        Self::framed(id, index, Bytes::new())
    }

    /// A framed message with id and index zero.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::framed(0, 0, payload)
    }

    /// A header-less message for line-delimited connections.
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// A header-less message holding `text` followed by a newline.
    #[must_use]
    pub fn line(text: &str) -> Self {
        let mut buf = BytesMut::with_capacity(text.len() + 1);
        buf.put_slice(text.as_bytes());
        buf.put_u8(b'\n');
        Self::raw(buf.freeze())
    }

    /// Decodes a complete frame: header followed by exactly the announced
    /// payload. Trailing bytes beyond the payload are ignored.
    ///
    /// # Errors
    ///
    /// Propagates header errors and returns `FrameError::Incomplete` when
    /// fewer payload bytes are present than the header announces.
    pub fn decode(buf: &[u8], max_payload: u32) -> Result<Self, FrameError> {
        let head = MessageHead::decode(buf, max_payload)?;
        let expected = head.length as usize;
        let body = &buf[HEAD_SIZE..];
        if body.len() < expected {
            return Err(FrameError::Incomplete {
                expected,
                available: body.len(),
            });
        }
        Ok(Self {
            head: Some(head),
            payload: Bytes::copy_from_slice(&body[..expected]),
            ..Self::default()
        })
    }

    /// Encodes the message for the wire.
    ///
    /// The header's length field is recomputed from the actual payload.
    /// Header-less messages encode to their bare payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let Some(head) = self.head else {
            return self.payload.clone();
        };
        let mut buf = BytesMut::with_capacity(HEAD_SIZE + self.payload.len());
        self.encode_into(&head, &mut buf);
        buf.freeze()
    }

    /// Appends the wire form to `dst`, recomputing the length field.
    pub fn encode_into(&self, head: &MessageHead, dst: &mut BytesMut) {
        let head = MessageHead {
            length: payload_len(&self.payload),
            ..*head
        };
        dst.reserve(HEAD_SIZE + self.payload.len());
        head.encode_into(dst);
        dst.put_slice(&self.payload);
    }

    /// Replaces the payload and keeps the header's length in step.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        if let Some(head) = self.head.as_mut() {
            head.length = payload_len(&self.payload);
        }
    }

    /// Copies id and index from `other` so this message answers it.
    #[must_use]
    pub fn with_tag_of(mut self, other: &Message) -> Self {
        if let (Some(head), Some(theirs)) = (self.head.as_mut(), other.head.as_ref()) {
            head.id = theirs.id;
            head.index = theirs.index;
        }
        self
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.head.map_or(0, |h| h.length)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.head.map_or(0, |h| h.id)
    }

    #[must_use]
    pub fn index(&self) -> u16 {
        self.head.map_or(0, |h| h.index)
    }

    #[must_use]
    pub fn flags(&self) -> u8 {
        self.head.map_or(0, |h| h.flags)
    }

    /// Correlation tag; zero for header-less messages.
    #[must_use]
    pub fn tag(&self) -> Tag {
        self.head.map_or(Tag(0), |h| h.tag())
    }

    pub fn set_request(&mut self, request: ParsedRequest) {
        self.request = Some(request);
    }

    #[must_use]
    pub fn parsed(&self) -> Option<&ParsedRequest> {
        self.request.as_ref()
    }

    /// Borrows the parsed request as `T`.
    #[must_use]
    pub fn request<T: Any>(&self) -> Option<&T> {
        self.request.as_ref().and_then(|r| r.downcast_ref::<T>())
    }

    pub fn set_user<T: Any + Send + Sync>(&mut self, user: T) {
        self.user = Some(Arc::new(user));
    }

    #[must_use]
    pub fn user<T: Any>(&self) -> Option<&T> {
        self.user.as_deref().and_then(|u| u.downcast_ref::<T>())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("head", &self.head)
            .field("payload_len", &self.payload.len())
            .field("request", &self.request)
            .field("has_user", &self.user.is_some())
            .finish()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn payload_len(payload: &Bytes) -> u32 {
    // Payloads are bounded by the configured maximum, which is a u32.
    payload.len() as u32
}
