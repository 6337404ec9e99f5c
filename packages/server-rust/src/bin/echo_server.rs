//! Echo server: answers every message with itself.
//!
//! Message id 1 is decoded with the selected codec as `{"text": ...}` and
//! answered with the text upper-cased. Everything else is echoed verbatim.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use msgque_core::{ChaChaCipher, Codec, RequestCodec, WireFormat};
use msgque_server::network::{ConnectionOptions, EndpointConfig, Framing, MsgQueModule, Router};
use msgque_server::runtime::{init_tracing, ConsoleSink, LogPipe, RuntimeConfig};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecArg {
    None,
    Json,
    Msgpack,
    Binary,
}

/// Command-line interface for the echo server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host address to bind to
    #[arg(long, env = "MSGQUE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to (0 picks a free port)
    #[arg(long, env = "MSGQUE_PORT", default_value_t = 7070)]
    port: u16,

    /// Request codec applied to inbound messages
    #[arg(long, value_enum, default_value_t = CodecArg::Json)]
    codec: CodecArg,

    /// Newline-delimited messages instead of 9-byte headers
    #[arg(long)]
    line: bool,

    /// Compress outbound payloads at least this many bytes (0 disables)
    #[arg(long, env = "MSGQUE_COMPRESS_LEN", default_value_t = 0)]
    compress_len: u32,

    /// Largest accepted payload in bytes
    #[arg(long, env = "MSGQUE_MAX_PAYLOAD")]
    max_payload: Option<u32>,

    /// Idle timeout in seconds for connections
    #[arg(long, env = "MSGQUE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Worker count above which finished workers exit instead of idling
    #[arg(long, env = "MSGQUE_SOFT_CEILING")]
    soft_ceiling: Option<usize>,

    /// How long shutdown waits for in-flight tasks, in milliseconds
    #[arg(long, env = "MSGQUE_DRAIN_MS")]
    drain_ms: Option<u64>,

    /// 32-byte pre-shared key; enables payload encryption
    #[arg(long, env = "MSGQUE_PSK")]
    psk: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Echo {
    text: String,
}

fn runtime_config(args: &Args) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.msgque.auto_compress_len = args.compress_len;
    config.msgque.auto_encrypt = args.psk.is_some();
    if let Some(max) = args.max_payload {
        config.msgque.max_payload_len = max;
    }
    if let Some(secs) = args.timeout_secs {
        config.msgque.default_timeout = Duration::from_secs(secs);
    }
    if let Some(ceiling) = args.soft_ceiling {
        config.pool.soft_ceiling = ceiling;
    }
    if let Some(ms) = args.drain_ms {
        config.shutdown.drain_timeout = Duration::from_millis(ms);
    }
    config
}

fn build_codec(arg: CodecArg) -> Option<Arc<Codec>> {
    let format = match arg {
        CodecArg::None => return None,
        CodecArg::Json => WireFormat::Json,
        CodecArg::Msgpack => WireFormat::MsgPack,
        CodecArg::Binary => WireFormat::Binary,
    };
    let mut codec = Codec::new(format);
    codec.register::<Echo>(1);
    Some(Arc::new(codec))
}

fn echo_router(codec: Option<Arc<Codec>>) -> Router {
    let router = Router::new().fallback(|conn, msg| async move { conn.send(msg).await });
    let Some(codec) = codec else {
        return router;
    };

    router.route(1, move |conn, msg| {
        let codec = Arc::clone(&codec);
        async move {
            let text = msg
                .request::<Echo>()
                .map(|echo| echo.text.to_uppercase())
                .unwrap_or_default();
            match codec.reply(&msg, &Echo { text }) {
                Ok(reply) => conn.send(reply).await,
                Err(e) => {
                    error!(conn = %conn.id(), error = %e, "failed to encode reply");
                    false
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut module = MsgQueModule::new(runtime_config(&args));
    if let Some(psk) = &args.psk {
        let key: [u8; 32] = psk
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow::anyhow!("--psk must be exactly 32 bytes, got {}", psk.len()))?;
        module = module.with_cipher(Arc::new(ChaChaCipher::new(&key)));
    }
    if args.line {
        module = module.with_accept_options(ConnectionOptions {
            framing: Framing::Line,
            ..ConnectionOptions::default()
        });
    }

    let pipe = LogPipe::spawn(module.executor(), Arc::new(ConsoleSink));
    init_tracing(pipe, args.json_logs)?;

    let endpoint = EndpointConfig {
        host: args.host.clone(),
        port: args.port,
    };
    let addr = module.start(&endpoint).await?;
    info!(%addr, codec = ?args.codec, line = args.line, "echo server listening");

    let codec = build_codec(args.codec);
    let handler = Arc::new(echo_router(codec.clone()));
    let request_codec = codec.map(|c| c as Arc<dyn RequestCodec>);

    let coordinator = module.shutdown_coordinator();
    let registry = module.registry();
    coordinator.at_exit(move || {
        info!(open_connections = registry.count(), "echo server exiting");
    });

    tokio::spawn(async move {
        if let Err(e) = module.serve(handler, request_codec).await {
            error!(error = %e, "serve failed");
        }
    });

    coordinator.wait_for_exit(Vec::new()).await;
    Ok(())
}
