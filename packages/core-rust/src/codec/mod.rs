//! Pluggable request codecs.
//!
//! A [`Codec`] owns the table of request types a connection understands and
//! one [`WireFormat`] used to decode them. Dispatch works in two modes:
//!
//! - **Framed** messages select their request type directly by message id.
//! - **Header-less** (line mode) messages are tried against every registered
//!   type in registration order until one decodes.
//!
//! What happens when parsing fails is the codec's [`FailurePolicy`].

pub mod binary;
pub mod json;
pub mod msgpack;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::{Message, ParsedRequest};

/// Serialization format backing a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Self-describing JSON text; the frame's message id tags the type.
    Json,
    /// Compact `MsgPack` maps with named fields.
    MsgPack,
    /// Schema-typed positional binary: field layout comes from the Rust type.
    Binary,
}

impl WireFormat {
    /// Encodes `value` in this format.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the value cannot be represented.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => json::encode(value),
            Self::MsgPack => msgpack::encode(value),
            Self::Binary => binary::encode(value),
        }
    }

    /// Decodes a `T` from `bytes` in this format.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes do not describe a `T`.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => json::decode(bytes),
            Self::MsgPack => msgpack::decode(bytes),
            Self::Binary => binary::decode(bytes),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
            Self::Binary => "binary",
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a connection does with a frame its codec cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Reply at once with an error message carrying the request's tag, then
    /// treat the frame as handled. Suited to browser clients.
    #[default]
    SendRemind,
    /// Tear the connection down. Suited to trusted internal links.
    Close,
    /// Drop the frame silently and keep the connection open.
    Continue,
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{format} decode failed: {reason}")]
    Decode { format: WireFormat, reason: String },
    #[error("{format} encode failed: {reason}")]
    Encode { format: WireFormat, reason: String },
    #[error("message id {id} has no registered request type")]
    UnknownMessage { id: u16 },
    #[error("{format} payload is empty and cannot be matched to a request type")]
    EmptyPayload { format: WireFormat },
    #[error("no registered request type accepts the {format} payload")]
    NoMatchingType { format: WireFormat },
}

impl CodecError {
    /// Numeric code sent to peers in remind replies.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Decode { format, .. }
            | Self::EmptyPayload { format }
            | Self::NoMatchingType { format } => match format {
                WireFormat::MsgPack => 2,
                WireFormat::Binary => 4,
                WireFormat::Json => 6,
            },
            Self::Encode { format, .. } => match format {
                WireFormat::MsgPack => 1,
                WireFormat::Binary => 3,
                WireFormat::Json => 5,
            },
            Self::UnknownMessage { .. } => 26,
        }
    }
}

/// Body of the canned reply sent under [`FailurePolicy::SendRemind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i32,
    pub error: String,
}

/// The capability a connection consumes to turn inbound frames into requests.
pub trait RequestCodec: Send + Sync + fmt::Debug {
    fn format(&self) -> WireFormat;

    fn failure_policy(&self) -> FailurePolicy;

    /// Parses the client payload into a typed request.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` when no registered type accepts the payload.
    fn parse_request(&self, msg: &Message) -> Result<ParsedRequest, CodecError>;

    /// Builds the reply sent under [`FailurePolicy::SendRemind`], tagged to
    /// match `request` when it carries a header.
    fn remind_message(&self, err: &CodecError, request: &Message) -> Message;
}

type DecodeFn =
    Box<dyn Fn(WireFormat, &[u8]) -> Result<Arc<dyn Any + Send + Sync>, CodecError> + Send + Sync>;

struct RequestType {
    id: u16,
    name: &'static str,
    decode: DecodeFn,
    empty: fn() -> Arc<dyn Any + Send + Sync>,
}

/// Request-type table plus a wire format and failure policy.
pub struct Codec {
    format: WireFormat,
    policy: FailurePolicy,
    types: Vec<RequestType>,
    by_id: HashMap<u16, usize>,
}

impl Codec {
    #[must_use]
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            policy: FailurePolicy::default(),
            types: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    #[must_use]
    pub fn json() -> Self {
        Self::new(WireFormat::Json)
    }

    #[must_use]
    pub fn msgpack() -> Self {
        Self::new(WireFormat::MsgPack)
    }

    #[must_use]
    pub fn binary() -> Self {
        Self::new(WireFormat::Binary)
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Registers `T` as the request type for message id `id`.
    ///
    /// Registering an id twice replaces the earlier type but keeps its
    /// position in the header-less trial order. A framed message with an
    /// empty payload parses to `T::default()`.
    pub fn register<T>(&mut self, id: u16) -> &mut Self
    where
        T: DeserializeOwned + Default + Send + Sync + 'static,
    {
        fn empty<T: Default + Send + Sync + 'static>() -> Arc<dyn Any + Send + Sync> {
            Arc::new(T::default())
        }

        let entry = RequestType {
            id,
            name: std::any::type_name::<T>(),
            decode: Box::new(|format, bytes| {
                format
                    .decode::<T>(bytes)
                    .map(|value| Arc::new(value) as Arc<dyn Any + Send + Sync>)
            }),
            empty: empty::<T>,
        };

        if let Some(&slot) = self.by_id.get(&id) {
            self.types[slot] = entry;
        } else {
            self.by_id.insert(id, self.types.len());
            self.types.push(entry);
        }
        self
    }

    #[must_use]
    pub fn is_registered(&self, id: u16) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Registered message ids in trial order.
    #[must_use]
    pub fn registered_ids(&self) -> Vec<u16> {
        self.types.iter().map(|t| t.id).collect()
    }

    /// Serializes a typed response in this codec's format.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the value cannot be serialized.
    pub fn pack_response<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        self.format.encode(value).map(Bytes::from)
    }

    /// Decodes a typed value in this codec's format.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` on malformed input.
    pub fn unpack<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.format.decode(bytes)
    }

    /// Packs `value` into a message answering `request`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the value cannot be serialized.
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        request: &Message,
        value: &T,
    ) -> Result<Message, CodecError> {
        let packed = self.pack_response(value)?;
        Ok(self.wrap_for(request, packed))
    }

    fn wrap_for(&self, request: &Message, payload: Bytes) -> Message {
        match request.head {
            Some(head) => Message::framed(head.id, head.index, payload),
            None if self.format == WireFormat::Json => {
                let mut line = BytesMut::with_capacity(payload.len() + 1);
                line.put_slice(&payload);
                line.put_u8(b'\n');
                Message::raw(line.freeze())
            }
            None => Message::raw(payload),
        }
    }
}

impl RequestCodec for Codec {
    fn format(&self) -> WireFormat {
        self.format
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    fn parse_request(&self, msg: &Message) -> Result<ParsedRequest, CodecError> {
        let Some(head) = msg.head else {
            if msg.payload.is_empty() {
                return Err(CodecError::EmptyPayload {
                    format: self.format,
                });
            }
            return self
                .types
                .iter()
                .find_map(|t| {
                    (t.decode)(self.format, &msg.payload)
                        .ok()
                        .map(|value| ParsedRequest::from_arc(t.name, value))
                })
                .ok_or(CodecError::NoMatchingType {
                    format: self.format,
                });
        };

        let entry = self
            .by_id
            .get(&head.id)
            .map(|&slot| &self.types[slot])
            .ok_or(CodecError::UnknownMessage { id: head.id })?;

        let value = if msg.payload.is_empty() {
            (entry.empty)()
        } else {
            (entry.decode)(self.format, &msg.payload)?
        };
        Ok(ParsedRequest::from_arc(entry.name, value))
    }

    fn remind_message(&self, err: &CodecError, request: &Message) -> Message {
        let reply = ErrorReply {
            code: err.code(),
            error: err.to_string(),
        };
        let payload = self
            .format
            .encode(&reply)
            .map_or_else(|_| Bytes::from(reply.error.clone()), Bytes::from);
        self.wrap_for(request, payload)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("format", &self.format)
            .field("policy", &self.policy)
            .field("ids", &self.registered_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Login {
        user: String,
        token: String,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
        y: i32,
    }

    fn codec(format: WireFormat) -> Codec {
        let mut codec = Codec::new(format);
        codec.register::<Login>(1).register::<Move>(2);
        codec
    }

    #[test]
    fn framed_dispatch_selects_type_by_id() {
        for format in [WireFormat::Json, WireFormat::MsgPack, WireFormat::Binary] {
            let codec = codec(format);
            let payload = format.encode(&Move { x: 3, y: -4 }).unwrap();
            let msg = Message::framed(2, 1, payload);

            let parsed = codec.parse_request(&msg).unwrap();
            assert_eq!(
                parsed.downcast_ref::<Move>(),
                Some(&Move { x: 3, y: -4 }),
                "{format}"
            );
        }
    }

    #[test]
    fn framed_dispatch_does_not_fall_back_to_other_types() {
        let codec = codec(WireFormat::Json);
        let payload = json::encode(&Move { x: 1, y: 1 }).unwrap();
        let msg = Message::framed(1, 1, payload);
        assert!(matches!(
            codec.parse_request(&msg),
            Err(CodecError::Decode {
                format: WireFormat::Json,
                ..
            })
        ));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let codec = codec(WireFormat::MsgPack);
        let msg = Message::framed(99, 0, &b"\x80"[..]);
        let err = codec.parse_request(&msg).unwrap_err();
        assert_eq!(err, CodecError::UnknownMessage { id: 99 });
        assert_eq!(err.code(), 26);
    }

    #[test]
    fn empty_framed_payload_parses_to_default() {
        let codec = codec(WireFormat::Json);
        let parsed = codec.parse_request(&Message::tagged(2, 5)).unwrap();
        assert_eq!(parsed.downcast_ref::<Move>(), Some(&Move::default()));
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Box3 {
        x: i32,
        y: i32,
        z: i32,
    }

    #[test]
    fn headless_binary_reaches_longer_type_registered_later() {
        let mut codec = Codec::binary();
        codec.register::<Move>(2).register::<Box3>(3);

        let wide = Box3 { x: 1, y: 2, z: 3 };
        let msg = Message::raw(binary::encode(&wide).unwrap());
        let parsed = codec.parse_request(&msg).unwrap();
        assert_eq!(parsed.downcast_ref::<Box3>(), Some(&wide));

        let narrow = Message::raw(binary::encode(&Move { x: 5, y: 6 }).unwrap());
        let parsed = codec.parse_request(&narrow).unwrap();
        assert_eq!(parsed.downcast_ref::<Move>(), Some(&Move { x: 5, y: 6 }));
    }

    #[test]
    fn header_less_tries_types_in_registration_order() {
        let codec = codec(WireFormat::Json);
        let msg = Message::raw(&br#"{"x":5,"y":6}"#[..]);
        let parsed = codec.parse_request(&msg).unwrap();
        assert_eq!(parsed.downcast_ref::<Move>(), Some(&Move { x: 5, y: 6 }));

        let msg = Message::raw(&br#"{"user":"a","token":"b"}"#[..]);
        let parsed = codec.parse_request(&msg).unwrap();
        assert!(parsed.downcast_ref::<Login>().is_some());
    }

    #[test]
    fn header_less_failures() {
        let codec = codec(WireFormat::Json);
        assert_eq!(
            codec.parse_request(&Message::raw(Bytes::new())).unwrap_err(),
            CodecError::EmptyPayload {
                format: WireFormat::Json
            }
        );
        assert_eq!(
            codec.parse_request(&Message::raw(&b"nope"[..])).unwrap_err(),
            CodecError::NoMatchingType {
                format: WireFormat::Json
            }
        );
    }

    #[test]
    fn re_registering_replaces_type_in_place() {
        let mut codec = codec(WireFormat::Json);
        codec.register::<Login>(2);
        assert_eq!(codec.registered_ids(), vec![1, 2]);
        let msg = Message::framed(2, 0, &br#"{"user":"u","token":"t"}"#[..]);
        assert!(codec.parse_request(&msg).unwrap().downcast_ref::<Login>().is_some());
    }

    #[test]
    fn remind_message_copies_request_tag() {
        let codec = codec(WireFormat::MsgPack);
        let request = Message::framed(77, 3, &b"\xc1"[..]);
        let err = codec.parse_request(&request).unwrap_err();

        let remind = codec.remind_message(&err, &request);
        assert_eq!(remind.tag(), request.tag());
        let body: ErrorReply = codec.unpack(&remind.payload).unwrap();
        assert_eq!(body.code, 26);
    }

    #[test]
    fn json_line_reply_is_newline_terminated() {
        let codec = codec(WireFormat::Json);
        let reply = codec.reply(&Message::line("{}"), &Move { x: 1, y: 2 }).unwrap();
        assert!(reply.head.is_none());
        assert_eq!(&reply.payload[..], b"{\"x\":1,\"y\":2}\n");
    }

    #[test]
    fn default_policy_is_send_remind() {
        assert_eq!(Codec::json().failure_policy(), FailurePolicy::SendRemind);
        assert_eq!(
            Codec::binary()
                .with_failure_policy(FailurePolicy::Close)
                .failure_policy(),
            FailurePolicy::Close
        );
    }
}
