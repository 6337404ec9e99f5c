//! Connections, their pipeline, and TCP transports.

pub mod config;
pub mod connection;
pub mod handler;
pub mod module;
pub mod registry;
pub mod transport;

pub use config::{EndpointConfig, MsgQueConfig};
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionKind, ConnectionOptions, Framing, NetKind, Pipeline,
    Reply,
};
pub use handler::{ConnectionUser, MessageHandler, MessagePost, RouteFn, Router};
pub use module::{MsgQueModule, RuntimeStats};
pub use registry::ConnectionRegistry;
pub use transport::{attach_stream, drive_stream, FrameCodec, RawLineCodec, TransportError};
