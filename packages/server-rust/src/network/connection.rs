//! Per-connection state and the send/receive pipeline.
//!
//! A [`ConnectionHandle`] owns the sender half of a bounded outbound channel
//! (the transport's write loop holds the receiver), a table of pending reply
//! callbacks keyed by [`Tag`], and group memberships. Inbound messages go
//! through [`ConnectionHandle::dispatch`], which unseals the payload, applies
//! the codec, and then routes to a callback, a post target, or the handler.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use msgque_core::{FailurePolicy, Message, PayloadCipher, PayloadTransform, RequestCodec, Tag};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use super::config::MsgQueConfig;
use super::handler::{ConnectionUser, MessageHandler};
use super::registry::ConnectionRegistry;
use crate::runtime::pool::Executor;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A listening endpoint.
    Listen,
    /// An outbound connection we dialed.
    Dial,
    /// An inbound connection a listener accepted.
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetKind {
    Tcp,
    Udp,
    WebSocket,
}

/// How bytes on the transport are split into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 9-byte header followed by the payload.
    Framed,
    /// Newline-delimited, header-less messages.
    Line,
}

/// Outcome delivered to a pending callback.
#[derive(Debug)]
pub enum Reply {
    /// A message with the callback's tag arrived.
    Answered(Message),
    /// The connection closed, or the callback was replaced or abandoned,
    /// before an answer arrived.
    NoAnswer,
    /// The request could not be queued for sending.
    SendFailed,
}

impl Reply {
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Answered(msg) => Some(msg),
            Self::NoAnswer | Self::SendFailed => None,
        }
    }

    #[must_use]
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered(_))
    }
}

/// Per-connection settings chosen by whoever opens the connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub kind: ConnectionKind,
    pub net: NetKind,
    pub framing: Framing,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Inactivity timeout. Zero uses [`MsgQueConfig::default_timeout`].
    pub timeout: Duration,
    /// Dispatch inbound messages on the pool instead of the read loop.
    pub multiplex: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Accept,
            net: NetKind::Tcp,
            framing: Framing::Framed,
            local_addr: None,
            remote_addr: None,
            timeout: Duration::ZERO,
            multiplex: false,
        }
    }
}

/// Services shared by every connection of one module.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub config: Arc<MsgQueConfig>,
    pub transform: PayloadTransform,
    pub executor: Executor,
    pub registry: Arc<ConnectionRegistry>,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: MsgQueConfig, executor: Executor) -> Self {
        let transform = PayloadTransform::new(config.max_payload_len)
            .with_auto_encrypt(config.auto_encrypt)
            .with_auto_compress(config.auto_compress_len);
        Self {
            config: Arc::new(config),
            transform,
            executor,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Installs the cipher used for encrypted payloads.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.transform = self.transform.with_cipher(cipher);
        self
    }

    /// Creates and registers a connection, returning its handle and the
    /// receiver the transport's write loop must drain.
    pub fn open(
        &self,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
        codec: Option<Arc<dyn RequestCodec>>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_channel_capacity);
        let (closed, _) = watch::channel(false);

        let handle = Arc::new(ConnectionHandle {
            id: self.registry.allocate_id(),
            kind: options.kind,
            net: options.net,
            framing: options.framing,
            local_addr: options.local_addr,
            remote_addr: options.remote_addr,
            real_remote_addr: RwLock::new(None),
            tx: RwLock::new(Some(tx)),
            replacement_rx: Mutex::new(None),
            available: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            multiplex: AtomicBool::new(options.multiplex),
            send_fast: AtomicBool::new(false),
            timeout_secs: AtomicU64::new(options.timeout.as_secs()),
            last_activity: Mutex::new(Instant::now()),
            callbacks: Mutex::new(HashMap::new()),
            next_callback: AtomicU64::new(0),
            groups: RwLock::new(HashSet::new()),
            user: RwLock::new(None),
            handler,
            codec,
            closed,
            pipeline: self.clone(),
            connected_at: Instant::now(),
        });

        self.registry.insert(&handle);
        debug!(conn = %handle.id, kind = ?handle.kind, "connection opened");
        (handle, rx)
    }
}

struct PendingCallback {
    generation: u64,
    tx: oneshot::Sender<Reply>,
}

/// Handle to a single connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    kind: ConnectionKind,
    net: NetKind,
    framing: Framing,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    real_remote_addr: RwLock<Option<String>>,
    tx: RwLock<Option<mpsc::Sender<Message>>>,
    replacement_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    available: AtomicBool,
    stopped: AtomicBool,
    multiplex: AtomicBool,
    send_fast: AtomicBool,
    timeout_secs: AtomicU64,
    last_activity: Mutex<Instant>,
    callbacks: Mutex<HashMap<Tag, PendingCallback>>,
    next_callback: AtomicU64,
    groups: RwLock<HashSet<String>>,
    user: RwLock<Option<Arc<dyn ConnectionUser>>>,
    handler: Arc<dyn MessageHandler>,
    codec: Option<Arc<dyn RequestCodec>>,
    closed: watch::Sender<bool>,
    pipeline: Pipeline,
    connected_at: Instant,
}

impl ConnectionHandle {
    // -- identity and attributes ---------------------------------------------

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    #[must_use]
    pub fn net(&self) -> NetKind {
        self.net
    }

    #[must_use]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    #[must_use]
    pub fn codec(&self) -> Option<&Arc<dyn RequestCodec>> {
        self.codec.as_ref()
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Records the client address reported by a proxy in front of us.
    pub fn set_real_remote_addr(&self, addr: impl Into<String>) {
        *self.real_remote_addr.write() = Some(addr.into());
    }

    /// The proxy-reported address if set, else the socket peer address.
    #[must_use]
    pub fn real_remote_addr(&self) -> Option<String> {
        self.real_remote_addr
            .read()
            .clone()
            .or_else(|| self.remote_addr.map(|a| a.to_string()))
    }

    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.real_remote_addr.read().is_some()
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_multiplex(&self) -> bool {
        self.multiplex.load(Ordering::SeqCst)
    }

    /// Switches multiplexed dispatch and returns the previous setting.
    ///
    /// With `capacity > 0` a new outbound channel of that size replaces the
    /// current one; the write loop finishes the old channel, then continues
    /// on the new one.
    pub fn set_multiplex(&self, multiplex: bool, capacity: usize) -> bool {
        let previous = self.multiplex.swap(multiplex, Ordering::SeqCst);
        // close() sets `stopped` before taking this lock, so checking under
        // it never installs a channel after close() has cleared them.
        let mut tx = self.tx.write();
        if capacity > 0 && !self.is_stopped() {
            let (new_tx, rx) = mpsc::channel(capacity);
            *self.replacement_rx.lock() = Some(rx);
            *tx = Some(new_tx);
        }
        previous
    }

    /// Takes the receiver installed by [`set_multiplex`](Self::set_multiplex).
    pub fn take_replacement_rx(&self) -> Option<mpsc::Receiver<Message>> {
        self.replacement_rx.lock().take()
    }

    #[must_use]
    pub fn is_send_fast(&self) -> bool {
        self.send_fast.load(Ordering::SeqCst)
    }

    /// Makes the write loop flush after every message instead of batching.
    pub fn set_send_fast(&self, fast: bool) {
        self.send_fast.store(fast, Ordering::SeqCst);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_secs.store(timeout.as_secs(), Ordering::SeqCst);
    }

    /// The inactivity timeout in force, resolving 0 to the configured default.
    #[must_use]
    pub fn effective_timeout(&self) -> Duration {
        match self.timeout_secs.load(Ordering::SeqCst) {
            0 => self.pipeline.config.default_timeout,
            secs => Duration::from_secs(secs),
        }
    }

    // -- groups and user data ------------------------------------------------

    pub fn join_group(&self, group: impl Into<String>) {
        self.groups.write().insert(group.into());
    }

    pub fn leave_group(&self, group: &str) {
        self.groups.write().remove(group);
    }

    pub fn clear_groups(&self) {
        self.groups.write().clear();
    }

    #[must_use]
    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.read().contains(group)
    }

    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.groups.read().iter().cloned().collect()
    }

    pub fn set_user(&self, user: Arc<dyn ConnectionUser>) {
        *self.user.write() = Some(user);
    }

    #[must_use]
    pub fn user(&self) -> Option<Arc<dyn ConnectionUser>> {
        self.user.read().clone()
    }

    // -- send path -----------------------------------------------------------

    fn sender(&self) -> Option<mpsc::Sender<Message>> {
        self.tx.read().clone()
    }

    fn seal(&self, msg: &mut Message) -> bool {
        match self.pipeline.transform.seal(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %self.id, msg_id = msg.id(), error = %e, "dropping outbound message");
                false
            }
        }
    }

    /// Seals and queues `msg`.
    ///
    /// When the outbound channel is full this logs a warning and waits for
    /// room rather than dropping the message. Returns `false` if the
    /// connection is closed or sealing failed.
    pub async fn send(&self, mut msg: Message) -> bool {
        if self.is_stopped() || !self.seal(&mut msg) {
            return false;
        }
        let Some(tx) = self.sender() else {
            return false;
        };

        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(conn = %self.id, capacity = tx.max_capacity(), "outbound channel full, waiting");
                tx.send(msg).await.is_ok()
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Seals and queues `msg` without waiting. Returns `false` when the
    /// channel is full or closed.
    pub fn try_send(&self, mut msg: Message) -> bool {
        if self.is_stopped() || !self.seal(&mut msg) {
            return false;
        }
        self.sender().is_some_and(|tx| tx.try_send(msg).is_ok())
    }

    /// Sends `text` as a header-less message.
    pub async fn send_str(&self, text: &str) -> bool {
        self.send(Message::raw(text.to_owned())).await
    }

    /// Sends `text` followed by a newline as a header-less message.
    pub async fn send_line(&self, text: &str) -> bool {
        self.send(Message::line(text)).await
    }

    /// Sends `msg` and arranges for the reply with the same tag to be
    /// delivered to `reply` instead of the handler.
    ///
    /// The callback is registered before the message is queued so a fast
    /// reply cannot overtake it. A second callback for the same tag replaces
    /// the first, which receives [`Reply::NoAnswer`]. If the send fails,
    /// `reply` receives [`Reply::SendFailed`] at once.
    pub async fn send_with_callback(&self, msg: Message, reply: oneshot::Sender<Reply>) -> bool {
        if msg.head.is_none() {
            let _ = reply.send(Reply::SendFailed);
            return false;
        }

        let tag = msg.tag();
        let generation = self.next_callback.fetch_add(1, Ordering::Relaxed);
        let replaced = self.callbacks.lock().insert(
            tag,
            PendingCallback {
                generation,
                tx: reply,
            },
        );
        if let Some(previous) = replaced {
            let _ = previous.tx.send(Reply::NoAnswer);
        }

        // close() marks the connection stopped before it drains the table,
        // so either it resolves our entry or we see the flag here.
        if !self.is_stopped() && self.send(msg).await {
            return true;
        }

        let mut callbacks = self.callbacks.lock();
        if callbacks.get(&tag).is_some_and(|p| p.generation == generation) {
            if let Some(pending) = callbacks.remove(&tag) {
                let _ = pending.tx.send(Reply::SendFailed);
            }
        }
        false
    }

    /// Sends `msg` and waits for the reply with the same tag.
    pub async fn request(&self, msg: Message) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.send_with_callback(msg, tx).await;
        rx.await.unwrap_or(Reply::NoAnswer)
    }

    /// Abandons the pending callback for `tag`; its waiter gets
    /// [`Reply::NoAnswer`]. Returns `false` if nothing was pending.
    pub fn del_callback(&self, tag: Tag) -> bool {
        let removed = self.callbacks.lock().remove(&tag);
        match removed {
            Some(pending) => {
                let _ = pending.tx.send(Reply::NoAnswer);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    // -- receive path --------------------------------------------------------

    /// Entry point for the read loop.
    ///
    /// Multiplexed connections process on the pool and always return `true`;
    /// if processing later reports stop, the connection is closed. Otherwise
    /// the message is processed inline and the result returned.
    pub async fn dispatch(self: &Arc<Self>, msg: Message) -> bool {
        if self.is_multiplex() {
            let conn = Arc::clone(self);
            self.pipeline.executor.submit(async move {
                if !conn.process(msg).await {
                    conn.close();
                }
            });
            return true;
        }
        self.process(msg).await
    }

    /// Unseals, parses, and routes one inbound message. Returns `false` when
    /// the connection should stop.
    pub async fn process(self: &Arc<Self>, mut msg: Message) -> bool {
        self.touch();

        if let Err(e) = self.pipeline.transform.unseal(&mut msg) {
            warn!(conn = %self.id, msg_id = msg.id(), error = %e, "dropping frame: payload unseal failed");
            return false;
        }

        if let Some(codec) = &self.codec {
            match codec.parse_request(&msg) {
                Ok(request) => msg.set_request(request),
                Err(e) => {
                    return match codec.failure_policy() {
                        FailurePolicy::SendRemind => {
                            debug!(conn = %self.id, msg_id = msg.id(), error = %e, "parse failed, sending remind");
                            let remind = codec.remind_message(&e, &msg);
                            self.send(remind).await;
                            true
                        }
                        FailurePolicy::Close => {
                            warn!(conn = %self.id, msg_id = msg.id(), error = %e, "parse failed, closing");
                            false
                        }
                        FailurePolicy::Continue => {
                            debug!(conn = %self.id, msg_id = msg.id(), error = %e, "parse failed, dropping frame");
                            true
                        }
                    };
                }
            }
        }

        if msg.head.is_some() {
            let pending = self.callbacks.lock().remove(&msg.tag());
            if let Some(pending) = pending {
                let _ = pending.tx.send(Reply::Answered(msg));
                return true;
            }
        }

        if let Some(user) = self.user() {
            if let Some(poster) = user.poster() {
                poster.post(self, msg);
                return true;
            }
        }

        if let Some(route) = self.handler.route(msg.id()) {
            return route(Arc::clone(self), msg).await;
        }
        self.handler.on_message(self, msg).await
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Reports whether the connection has been idle past its timeout.
    ///
    /// When not expired, `timer` (if given) is reset to fire exactly at the
    /// next possible expiry.
    pub fn is_expired(&self, now: Instant, timer: Option<Pin<&mut Sleep>>) -> bool {
        let deadline = *self.last_activity.lock() + self.effective_timeout();
        if now >= deadline {
            return true;
        }
        if let Some(timer) = timer {
            timer.reset(deadline);
        }
        false
    }

    // -- close path ----------------------------------------------------------

    /// Closes the connection. Repeated calls are no-ops.
    ///
    /// Drops the outbound sender (the write loop drains what is queued and
    /// exits), resolves every pending callback with [`Reply::NoAnswer`],
    /// and deregisters from the registry.
    pub fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.available.store(false, Ordering::SeqCst);

        self.tx.write().take();
        self.replacement_rx.lock().take();

        let pending: Vec<PendingCallback> =
            self.callbacks.lock().drain().map(|(_, p)| p).collect();
        for callback in pending {
            let _ = callback.tx.send(Reply::NoAnswer);
        }

        self.pipeline.registry.remove(self.id);
        self.closed.send_replace(true);

        if std::panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_connection_closed(self)))
            .is_err()
        {
            warn!(conn = %self.id, "close handler panicked");
        }
        info!(conn = %self.id, "connection closed");
    }

    /// Receiver flipped to `true` once [`close`](Self::close) runs.
    #[must_use]
    pub fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Resolves when the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("net", &self.net)
            .field("framing", &self.framing)
            .field("remote_addr", &self.remote_addr)
            .field("stopped", &self.is_stopped())
            .field("multiplex", &self.is_multiplex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use msgque_core::Message;

    use super::{ConnectionHandle, Pipeline};
    use crate::network::config::MsgQueConfig;
    use crate::network::handler::MessageHandler;
    use crate::runtime::config::PoolConfig;
    use crate::runtime::pool::Executor;

    pub(crate) fn pipeline() -> Pipeline {
        pipeline_with(|_| {})
    }

    pub(crate) fn pipeline_with(configure: impl FnOnce(&mut MsgQueConfig)) -> Pipeline {
        let mut config = MsgQueConfig::default();
        configure(&mut config);
        Pipeline::new(config, Executor::new(&PoolConfig::default()))
    }

    /// Accepts everything and does nothing.
    pub(crate) struct NullHandler;

    impl NullHandler {
        pub(crate) fn arc() -> Arc<dyn MessageHandler> {
            Arc::new(Self)
        }
    }

    #[async_trait]
    impl MessageHandler for NullHandler {
        async fn on_message(&self, _conn: &Arc<ConnectionHandle>, _msg: Message) -> bool {
            true
        }
    }
}
