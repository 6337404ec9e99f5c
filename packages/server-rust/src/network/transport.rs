//! Stream transports: frame codecs and the per-connection read/write loops.
//!
//! A byte stream is split into halves. The write half is owned by a task
//! that drains the connection's outbound channel, batching queued messages
//! into one flush unless the connection asked for `send_fast`. The read half
//! decodes messages with [`FrameCodec`] or [`RawLineCodec`] and dispatches
//! them until the peer hangs up, a decode fails, the connection idles past
//! its timeout, it is closed locally, or the pool starts retiring.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures_util::{SinkExt, Stream, StreamExt};
use msgque_core::{FrameError, Message, MessageHead, RequestCodec, HEAD_SIZE};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, ConnectionOptions, Framing, Pipeline};
use super::handler::MessageHandler;

/// Errors that end a stream transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("line exceeds {max} bytes without a newline")]
    LineTooLong { max: usize },
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// Header-prefixed framing. Header-less messages are written as their bare
/// payload, so the same encoder serves line-mode connections.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        if src.len() < HEAD_SIZE {
            return Ok(None);
        }

        // The length is checked against the limit before reserving for it.
        let head = MessageHead::decode(&src[..HEAD_SIZE], self.max_payload)?;
        let total = HEAD_SIZE + head.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEAD_SIZE);
        let payload = src.split_to(head.length as usize).freeze();
        Ok(Some(Message::from_parts(head, payload)))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        match msg.head {
            Some(head) => msg.encode_into(&head, dst),
            None => dst.extend_from_slice(&msg.payload),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RawLineCodec
// ---------------------------------------------------------------------------

/// Newline-delimited messages without a header. The trailing `\n` (and a
/// preceding `\r`) are stripped.
#[derive(Debug, Clone, Copy)]
pub struct RawLineCodec {
    max_len: usize,
}

impl RawLineCodec {
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Decoder for RawLineCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_len {
                return Err(TransportError::LineTooLong { max: self.max_len });
            }
            return Ok(None);
        };
        if pos > self.max_len {
            return Err(TransportError::LineTooLong { max: self.max_len });
        }

        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Ok(Some(Message::raw(line.freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split().freeze();
        Ok(Some(Message::raw(rest)))
    }
}

// ---------------------------------------------------------------------------
// Read and write loops
// ---------------------------------------------------------------------------

/// Opens a connection over `io`, runs the handler's connect hook, and drives
/// the stream on the connection's executor.
///
/// Returns the handle immediately; the hook and loops run in the background.
pub fn attach_stream<IO>(
    pipeline: &Pipeline,
    options: ConnectionOptions,
    handler: Arc<dyn MessageHandler>,
    codec: Option<Arc<dyn RequestCodec>>,
    io: IO,
) -> Arc<ConnectionHandle>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (conn, rx) = pipeline.open(options, handler, codec);
    let task_conn = Arc::clone(&conn);
    pipeline.executor.submit(async move {
        let _close = CloseOnDrop(&task_conn);
        let handler = Arc::clone(task_conn.handler());
        if !handler.on_new_connection(&task_conn).await {
            debug!(conn = %task_conn.id(), "connection refused by handler");
            return;
        }
        drive_stream(Arc::clone(&task_conn), rx, io).await;
    });
    conn
}

/// Closes the connection when dropped, including while unwinding from a
/// handler panic.
struct CloseOnDrop<'a>(&'a ConnectionHandle);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Runs the read loop on the current task and the write loop on the pool.
/// Closes the connection when reading ends or a handler panics.
pub async fn drive_stream<IO>(conn: Arc<ConnectionHandle>, rx: mpsc::Receiver<Message>, io: IO)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let _close = CloseOnDrop(&conn);
    let (reader, writer) = tokio::io::split(io);
    let config = Arc::clone(&conn.pipeline().config);

    let writer_conn = Arc::clone(&conn);
    conn.pipeline()
        .executor
        .submit(write_loop(writer_conn, rx, writer));

    match conn.framing() {
        Framing::Framed => {
            let frames = FramedRead::with_capacity(
                reader,
                FrameCodec::new(config.max_payload_len),
                config.read_buffer_size,
            );
            read_loop(&conn, frames).await;
        }
        Framing::Line => {
            let lines = FramedRead::with_capacity(
                reader,
                RawLineCodec::new(config.max_payload_len as usize),
                config.read_buffer_size,
            );
            read_loop(&conn, lines).await;
        }
    }
}

async fn read_loop<S>(conn: &Arc<ConnectionHandle>, mut frames: S)
where
    S: Stream<Item = Result<Message, TransportError>> + Unpin,
{
    let mut closed = conn.closed_receiver();
    let mut retiring = conn.pipeline().executor.retirement();
    let timer = tokio::time::sleep(conn.effective_timeout());
    tokio::pin!(timer);

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    if !conn.dispatch(msg).await {
                        debug!(conn = %conn.id(), "handler stopped connection");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(conn = %conn.id(), error = %e, "read failed");
                    break;
                }
                None => {
                    debug!(conn = %conn.id(), "peer closed");
                    break;
                }
            },
            () = &mut timer => {
                if conn.is_expired(Instant::now(), Some(timer.as_mut())) {
                    info!(conn = %conn.id(), timeout_s = conn.effective_timeout().as_secs(), "connection timed out");
                    break;
                }
            }
            // Map to owned values so no watch guard lives across the select.
            _ = async { closed.wait_for(|c| *c).await.is_ok() } => break,
            _ = async { retiring.wait_for(|r| *r).await.is_ok() } => {
                debug!(conn = %conn.id(), "pool retiring, closing connection");
                break;
            }
        }
    }
}

async fn write_loop<W>(conn: Arc<ConnectionHandle>, mut rx: mpsc::Receiver<Message>, writer: W)
where
    W: AsyncWrite + Send + Unpin,
{
    let max_payload = conn.pipeline().config.max_payload_len;
    let mut sink = FramedWrite::new(writer, FrameCodec::new(max_payload));

    'outer: loop {
        let Some(msg) = rx.recv().await else {
            // The channel was swapped by set_multiplex, or the connection closed.
            match conn.take_replacement_rx() {
                Some(next) => {
                    rx = next;
                    continue;
                }
                None => break,
            }
        };

        if let Err(e) = sink.feed(msg).await {
            warn!(conn = %conn.id(), error = %e, "write failed");
            break;
        }
        if !conn.is_send_fast() {
            while let Ok(msg) = rx.try_recv() {
                if let Err(e) = sink.feed(msg).await {
                    warn!(conn = %conn.id(), error = %e, "write failed");
                    break 'outer;
                }
            }
        }
        if let Err(e) = sink.flush().await {
            warn!(conn = %conn.id(), error = %e, "flush failed");
            break;
        }
    }

    let _ = sink.close().await;
    conn.close();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BufMut;
    use msgque_core::{Codec, DEFAULT_MAX_PAYLOAD};
    use serde::{Deserialize, Serialize};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::network::connection::test_support::{pipeline, pipeline_with, NullHandler};
    use crate::network::handler::Router;

    fn echo_router() -> Arc<dyn MessageHandler> {
        Arc::new(Router::new().fallback(|conn, msg| async move { conn.send(msg).await }))
    }

    #[test]
    fn frame_codec_waits_for_full_frame() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_PAYLOAD);
        let wire = Message::framed(4, 2, &b"hello"[..]).encode();

        let mut buf = BytesMut::from(&wire[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&wire[5..11]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&wire[11..]);
        buf.put_slice(&wire[..3]);

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.id(), 4);
        assert_eq!(msg.index(), 2);
        assert_eq!(&msg.payload[..], b"hello");
        assert_eq!(buf.len(), 3, "next frame's bytes stay buffered");
    }

    #[test]
    fn frame_codec_rejects_oversized_header_early() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        buf.put_u16(1);
        buf.put_u16(1);
        buf.put_u8(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Frame(FrameError::TooLong { length: 17, max: 16 }))
        ));
    }

    #[test]
    fn frame_codec_encodes_headless_as_bare_payload() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_PAYLOAD);
        let mut dst = BytesMut::new();
        codec.encode(Message::line("ok"), &mut dst).unwrap();
        codec.encode(Message::tagged(1, 1), &mut dst).unwrap();
        assert_eq!(&dst[..3], b"ok\n");
        assert_eq!(dst.len(), 3 + HEAD_SIZE);
    }

    #[test]
    fn line_codec_splits_and_strips() {
        let mut codec = RawLineCodec::new(64);
        let mut buf = BytesMut::from(&b"first\r\nsecond\npart"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().payload[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().payload[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let tail = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(&tail.payload[..], b"part");
        assert!(tail.head.is_none());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn line_codec_enforces_limit() {
        let mut codec = RawLineCodec::new(4);
        let mut buf = BytesMut::from(&b"toolong"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::LineTooLong { max: 4 })
        ));
    }

    #[tokio::test]
    async fn framed_echo_over_duplex() {
        let pipeline = pipeline();
        let (mut client, server) = tokio::io::duplex(4096);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), echo_router(), None, server);

        client
            .write_all(&Message::framed(3, 1, &b"ping"[..]).encode())
            .await
            .unwrap();

        let mut replies = FramedRead::new(&mut client, FrameCodec::new(DEFAULT_MAX_PAYLOAD));
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply.tag(), msgque_core::Tag::new(3, 1));
        assert_eq!(&reply.payload[..], b"ping");
        assert!(!conn.is_stopped());
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[tokio::test]
    async fn codec_reply_over_duplex() {
        let pipeline = pipeline();
        let mut codec = Codec::msgpack();
        codec.register::<Echo>(1);
        let codec = Arc::new(codec);

        let replier = Arc::clone(&codec);
        let router = Router::new().route(1, move |conn, msg| {
            let codec = Arc::clone(&replier);
            async move {
                let text = msg.request::<Echo>().map(|e| e.text.to_uppercase()).unwrap_or_default();
                match codec.reply(&msg, &Echo { text }) {
                    Ok(reply) => conn.send(reply).await,
                    Err(_) => false,
                }
            }
        });

        let (mut client, server) = tokio::io::duplex(4096);
        let _conn = attach_stream(
            &pipeline,
            ConnectionOptions::default(),
            Arc::new(router),
            Some(codec.clone()),
            server,
        );

        let body = rmp_serde::to_vec_named(&Echo { text: "hi".into() }).unwrap();
        client.write_all(&Message::framed(1, 9, body).encode()).await.unwrap();

        let mut replies = FramedRead::new(&mut client, FrameCodec::new(DEFAULT_MAX_PAYLOAD));
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply.index(), 9);
        let echo: Echo = rmp_serde::from_slice(&reply.payload).unwrap();
        assert_eq!(echo.text, "HI");
    }

    #[tokio::test]
    async fn line_mode_echo() {
        let pipeline = pipeline();
        let options = ConnectionOptions {
            framing: Framing::Line,
            ..ConnectionOptions::default()
        };
        let router = Router::new().fallback(|conn, msg| async move {
            let text = String::from_utf8_lossy(&msg.payload).into_owned();
            conn.send_line(&format!("echo {text}")).await
        });
        let (mut client, server) = tokio::io::duplex(4096);
        let _conn = attach_stream(&pipeline, options, Arc::new(router), None, server);

        client.write_all(b"hello\r\n").await.unwrap();
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo hello\n");
    }

    #[tokio::test]
    async fn peer_hangup_closes_and_deregisters() {
        let pipeline = pipeline();
        let (client, server) = tokio::io::duplex(1024);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), NullHandler::arc(), None, server);
        assert_eq!(pipeline.registry.count(), 1);

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert_eq!(pipeline.registry.count(), 0);
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let pipeline = pipeline_with(|c| c.max_payload_len = 8);
        let (mut client, server) = tokio::io::duplex(1024);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), NullHandler::arc(), None, server);

        client
            .write_all(&Message::framed(1, 1, vec![0u8; 9]).encode())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let pipeline = pipeline_with(|c| c.default_timeout = Duration::from_secs(5));
        let (_client, server) = tokio::io::duplex(1024);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), NullHandler::arc(), None, server);

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(60), conn.closed()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retiring_pool_closes_connections() {
        let pipeline = pipeline();
        let (_client, server) = tokio::io::duplex(1024);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), NullHandler::arc(), None, server);

        pipeline.executor.retire_idle();
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    }

    struct Refuse;

    #[async_trait::async_trait]
    impl MessageHandler for Refuse {
        async fn on_new_connection(&self, _conn: &Arc<ConnectionHandle>) -> bool {
            false
        }

        async fn on_message(&self, _conn: &Arc<ConnectionHandle>, _msg: Message) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn refused_connection_is_closed() {
        let pipeline = pipeline();
        let (_client, server) = tokio::io::duplex(1024);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), Arc::new(Refuse), None, server);
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert_eq!(pipeline.registry.count(), 0);
    }

    async fn explode(_conn: Arc<ConnectionHandle>, _msg: Message) -> bool {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn handler_panic_closes_connection() {
        let pipeline = pipeline();
        let (mut client, server) = tokio::io::duplex(1024);
        let router = Router::new().fallback(explode);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), Arc::new(router), None, server);

        client
            .write_all(&Message::framed(1, 0, &b"boom"[..]).encode())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();

        assert!(conn.is_stopped());
        assert_eq!(pipeline.registry.count(), 0);
        assert!(
            pipeline
                .executor
                .general()
                .wait_for_zero(Duration::from_millis(1), Some(Duration::from_secs(1)))
                .await
        );
        assert_eq!(pipeline.executor.stats().failures, 1);

        // The write loop ended too, so the peer sees end of stream.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    struct PanicOnConnect;

    #[async_trait::async_trait]
    impl MessageHandler for PanicOnConnect {
        async fn on_new_connection(&self, _conn: &Arc<ConnectionHandle>) -> bool {
            panic!("connect hook bug")
        }

        async fn on_message(&self, _conn: &Arc<ConnectionHandle>, _msg: Message) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn connect_hook_panic_closes_connection() {
        let pipeline = pipeline();
        let (_client, server) = tokio::io::duplex(1024);
        let conn = attach_stream(&pipeline, ConnectionOptions::default(), Arc::new(PanicOnConnect), None, server);
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert_eq!(pipeline.registry.count(), 0);
        assert!(
            pipeline
                .executor
                .general()
                .wait_for_zero(Duration::from_millis(1), Some(Duration::from_secs(1)))
                .await
        );
        assert_eq!(pipeline.executor.stats().failures, 1);
    }
}
