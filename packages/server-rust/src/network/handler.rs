//! Capabilities a connection calls into when messages arrive.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use msgque_core::Message;

use super::connection::ConnectionHandle;

/// Per-message-id handler. Returns `false` to stop processing the connection.
pub type RouteFn =
    Arc<dyn Fn(Arc<ConnectionHandle>, Message) -> BoxFuture<'static, bool> + Send + Sync>;

/// Receives connection lifecycle events and inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once a connection is accepted or dialed, before its read loop
    /// starts. Returning `false` closes it.
    async fn on_new_connection(&self, _conn: &Arc<ConnectionHandle>) -> bool {
        true
    }

    /// Called exactly once when a connection closes.
    fn on_connection_closed(&self, _conn: &ConnectionHandle) {}

    /// Handler dedicated to message id `id`, if any. Takes precedence over
    /// [`on_message`](Self::on_message).
    fn route(&self, _id: u16) -> Option<RouteFn> {
        None
    }

    /// Catch-all for messages without a dedicated route.
    async fn on_message(&self, conn: &Arc<ConnectionHandle>, msg: Message) -> bool;
}

/// Out-of-band receiver for inbound messages, consulted before the handler.
pub trait MessagePost: Send + Sync {
    fn post(&self, conn: &Arc<ConnectionHandle>, msg: Message);
}

/// Application object attached to a connection.
pub trait ConnectionUser: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// When present, inbound messages not claimed by a callback go here
    /// instead of to the handler.
    fn poster(&self) -> Option<&dyn MessagePost> {
        None
    }
}

/// A [`MessageHandler`] built from per-id closures plus an optional fallback.
#[derive(Default)]
pub struct Router {
    routes: HashMap<u16, RouteFn>,
    fallback: Option<RouteFn>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes message id `id` to `f`, replacing any earlier route.
    #[must_use]
    pub fn route<F, Fut>(mut self, id: u16, f: F) -> Self
    where
        F: Fn(Arc<ConnectionHandle>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.routes.insert(id, boxed(f));
        self
    }

    /// Handles every message without a route. Without a fallback such
    /// messages are dropped and the connection stays open.
    #[must_use]
    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ConnectionHandle>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.fallback = Some(boxed(f));
        self
    }

    #[must_use]
    pub fn has_route(&self, id: u16) -> bool {
        self.routes.contains_key(&id)
    }
}

fn boxed<F, Fut>(f: F) -> RouteFn
where
    F: Fn(Arc<ConnectionHandle>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(
        move |conn: Arc<ConnectionHandle>, msg: Message| -> BoxFuture<'static, bool> {
            Box::pin(f(conn, msg))
        },
    )
}

#[async_trait]
impl MessageHandler for Router {
    fn route(&self, id: u16) -> Option<RouteFn> {
        self.routes.get(&id).cloned()
    }

    async fn on_message(&self, conn: &Arc<ConnectionHandle>, msg: Message) -> bool {
        match &self.fallback {
            Some(fallback) => fallback(Arc::clone(conn), msg).await,
            None => {
                tracing::debug!(conn = %conn.id(), msg_id = msg.id(), "no route for message");
                true
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.routes.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("Router")
            .field("routes", &ids)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
