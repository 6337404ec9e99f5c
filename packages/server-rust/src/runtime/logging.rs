//! Log output routed through a logging-category task.
//!
//! [`LogPipe`] is a `tracing_subscriber` writer that hands each formatted
//! line to a drain task submitted with `Executor::submit_logging`. When the
//! shutdown sequence closes logging, the drain task writes whatever is still
//! queued, flushes the sink, and exits.

use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::pool::Executor;

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync + 'static {
    fn write(&self, line: &str);

    fn flush(&self) {}
}

/// Writes lines to standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn write(&self, line: &str) {
        // Nowhere left to report a failed log write.
        let _ = io::stdout().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = io::stdout().lock().flush();
    }
}

/// Cloneable handle feeding the logging drain task.
#[derive(Debug, Clone)]
pub struct LogPipe {
    tx: mpsc::UnboundedSender<String>,
}

impl LogPipe {
    /// Starts the drain task writing into `sink`.
    ///
    /// If logging has already been closed the drain task is refused and
    /// lines written to the pipe are discarded.
    pub fn spawn(executor: &Executor, sink: Arc<dyn LogSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut closed = executor.logging_closure();

        executor.submit_logging(async move {
            loop {
                tokio::select! {
                    line = rx.recv() => match line {
                        Some(line) => sink.write(&line),
                        None => break,
                    },
                    _ = async { closed.wait_for(|c| *c).await.is_ok() } => {
                        while let Ok(line) = rx.try_recv() {
                            sink.write(&line);
                        }
                        break;
                    }
                }
            }
            sink.flush();
        });

        Self { tx }
    }

    /// Queues one line. Returns `false` once the drain task has exited.
    pub fn write_line(&self, line: impl Into<String>) -> bool {
        self.tx.send(line.into()).is_ok()
    }
}

impl<'a> MakeWriter<'a> for LogPipe {
    type Writer = PipeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        PipeWriter {
            tx: self.tx.clone(),
            buf: Vec::new(),
        }
    }
}

/// Buffers one formatted event and queues it on flush or drop.
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<String>,
    buf: Vec<u8>,
}

impl Write for PipeWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            let _ = self.tx.send(line);
        }
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Installs the global `tracing` subscriber writing through `pipe`.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(pipe: LogPipe, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(pipe),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(pipe)
                    .with_ansi(false),
            )
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
