//! Message-queue module with deferred startup lifecycle.
//!
//! `new()` creates the executor, registry, and shutdown coordinator,
//! `start()` binds the TCP listener, and `serve()` accepts connections. The
//! split lets the application register storage and cache layers or exit
//! hooks on the coordinator between `start()` and `serve()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use msgque_core::{PayloadCipher, RequestCodec};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::config::EndpointConfig;
use super::connection::{ConnectionHandle, ConnectionKind, ConnectionOptions, NetKind, Pipeline};
use super::handler::MessageHandler;
use super::registry::ConnectionRegistry;
use super::transport::attach_stream;
use crate::runtime::config::RuntimeConfig;
use crate::runtime::pool::{Executor, PoolStats};
use crate::runtime::shutdown::ShutdownCoordinator;

/// Point-in-time view of a running module.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStats {
    pub pool: PoolStats,
    pub connections: usize,
    pub uptime: Duration,
}

/// Owns the pooled executor, the connection pipeline, and the shutdown
/// coordinator for one process.
pub struct MsgQueModule {
    config: RuntimeConfig,
    listener: Option<TcpListener>,
    executor: Executor,
    pipeline: Pipeline,
    shutdown: Arc<ShutdownCoordinator>,
    accept_options: ConnectionOptions,
    started_at: Instant,
}

impl MsgQueModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let executor = Executor::new(&config.pool);
        let pipeline = Pipeline::new(config.msgque.clone(), executor.clone());
        let shutdown = Arc::new(ShutdownCoordinator::new(
            config.shutdown.clone(),
            executor.clone(),
        ));
        Self {
            config,
            listener: None,
            executor,
            pipeline,
            shutdown,
            accept_options: ConnectionOptions::default(),
            started_at: Instant::now(),
        }
    }

    /// Installs the cipher used for encrypted payloads.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.pipeline = self.pipeline.with_cipher(cipher);
        self
    }

    /// Template for accepted connections. Kind, net, and addresses are
    /// always overwritten per socket.
    #[must_use]
    pub fn with_accept_options(mut self, options: ConnectionOptions) -> Self {
        self.accept_options = options;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.pipeline.registry)
    }

    #[must_use]
    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the TCP listener and returns the bound address, which carries
    /// the OS-assigned port when `endpoint.port` is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self, endpoint: &EndpointConfig) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(endpoint.addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "listener bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Accepts connections until the pool starts retiring.
    ///
    /// Every accepted socket becomes an `Accept` connection served by
    /// `handler` (and `codec`, when given).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's local address cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        codec: Option<Arc<dyn RequestCodec>>,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .expect("start() must be called before serve()");
        let local_addr = listener.local_addr()?;
        let mut retiring = self.executor.retirement();
        info!(%local_addr, "accepting connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        self.accept(stream, local_addr, remote, &handler, codec.as_ref());
                    }
                    Err(e) => {
                        // Per-connection failures such as EMFILE; keep listening.
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = async { retiring.wait_for(|r| *r).await.is_ok() } => break,
            }
        }

        info!("listener closed");
        Ok(())
    }

    fn accept(
        &self,
        stream: TcpStream,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        handler: &Arc<dyn MessageHandler>,
        codec: Option<&Arc<dyn RequestCodec>>,
    ) {
        if let Err(e) = stream.set_nodelay(self.config.msgque.tcp_nodelay) {
            debug!(%remote_addr, error = %e, "set_nodelay failed");
        }
        let options = ConnectionOptions {
            kind: ConnectionKind::Accept,
            net: NetKind::Tcp,
            local_addr: Some(local_addr),
            remote_addr: Some(remote_addr),
            ..self.accept_options.clone()
        };
        let conn = attach_stream(
            &self.pipeline,
            options,
            Arc::clone(handler),
            codec.cloned(),
            stream,
        );
        debug!(conn = %conn.id(), %remote_addr, "accepted");
    }

    /// Dials `endpoint` and returns the new `Dial` connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection cannot be established.
    pub async fn connect(
        &self,
        endpoint: &EndpointConfig,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
        codec: Option<Arc<dyn RequestCodec>>,
    ) -> anyhow::Result<Arc<ConnectionHandle>> {
        let stream = TcpStream::connect(endpoint.addr()).await?;
        if let Err(e) = stream.set_nodelay(self.config.msgque.tcp_nodelay) {
            debug!(error = %e, "set_nodelay failed");
        }
        let options = ConnectionOptions {
            kind: ConnectionKind::Dial,
            net: NetKind::Tcp,
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
            ..options
        };
        let conn = attach_stream(&self.pipeline, options, handler, codec, stream);
        info!(conn = %conn.id(), addr = %endpoint.addr(), "dialed");
        Ok(conn)
    }

    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.executor.stats(),
            connections: self.pipeline.registry.count(),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for MsgQueModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgQueModule")
            .field("listening", &self.listener.is_some())
            .field("connections", &self.pipeline.registry.count())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}
