//! Loopback call binary entry point
//!
//! Negotiates two peer connections inside this process, sends a few
//! messages from one to the other and hangs up.
//!
//! # Usage
//!
//! ```bash
//! # Data channel call over real webrtc-rs peer connections
//! cargo run -p peerlink-loopback-call -- --message hello --message world
//!
//! # Media stream call over the in-memory engine
//! cargo run -p peerlink-loopback-call -- --engine memory --data-path media-stream
//!
//! # Use a STUN server and an unreliable channel
//! cargo run -p peerlink-loopback-call -- \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --unreliable
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use peerlink_webrtc::{
    DataChannelMode, DataPathState, LoopbackCall, MemoryEngine, NegotiationConfig,
    PeerConnectionFactory, RtcEngine, SyntheticCapture, DEFAULT_MAX_MESSAGE_SIZE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Loopback WebRTC call
///
/// Runs both ends of a call in one process and prints the negotiation trace.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peer connection engine
    #[arg(short, long, default_value = "webrtc", env = "LOOPBACK_ENGINE")]
    engine: Engine,

    /// Data path negotiated between the two endpoints
    #[arg(long, default_value = "data-channel", env = "LOOPBACK_DATA_PATH")]
    data_path: DataPath,

    /// STUN servers (comma-separated); host candidates only when empty
    #[arg(long, value_delimiter = ',', env = "LOOPBACK_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Message to send once the data channel is open (repeatable)
    #[arg(short, long = "message", default_value = "Hello from localPeerConnection")]
    messages: Vec<String>,

    /// Unordered data channel without retransmits
    #[arg(long, default_value_t = false, env = "LOOPBACK_UNRELIABLE")]
    unreliable: bool,

    /// Largest payload accepted by send, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE, env = "LOOPBACK_MAX_MESSAGE_SIZE")]
    max_message_size: usize,

    /// Seconds to keep the call up after sending (Ctrl+C ends early)
    #[arg(long, default_value_t = 1, env = "LOOPBACK_HOLD_SECS")]
    hold_secs: u64,

    /// Seconds to wait for negotiation and the data path to open
    #[arg(long, default_value_t = 15, env = "LOOPBACK_TIMEOUT_SECS")]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Engine {
    /// webrtc-rs peer connections (real ICE/DTLS/SCTP)
    Webrtc,
    /// In-process engine, no networking
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum DataPath {
    DataChannel,
    MediaStream,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, hanging up...");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Hang-up already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("Graceful hang-up timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("loopback-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = ?args.engine,
        data_path = ?args.data_path,
        "Loopback call starting"
    );

    let config = build_config(&args);
    config.validate().context("Invalid negotiation configuration")?;

    let factory: Arc<dyn PeerConnectionFactory> = match args.engine {
        Engine::Webrtc => Arc::new(RtcEngine),
        Engine::Memory => Arc::new(MemoryEngine::default()),
    };

    let mut call = LoopbackCall::new(config, factory, Arc::new(SyntheticCapture::new()))?;

    // Print the trace as it happens
    let mut diagnostics = call.diagnostics().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(diagnostic) = diagnostics.recv().await {
            println!("{}", diagnostic);
        }
    });

    call.on_receive(|payload| {
        println!("Received: {}", String::from_utf8_lossy(&payload));
    });

    let result = run_call(&mut call, &args, &shutdown_flag).await;

    call.hang_up().await;
    info!("Call ended");

    // Let the last diagnostics drain
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    result
}

async fn run_call(
    call: &mut LoopbackCall,
    args: &Args,
    shutdown_flag: &AtomicBool,
) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(args.timeout_secs);

    call.start().await.context("Failed to start call")?;
    call.call().await.context("Failed to begin negotiation")?;

    let Some(session) = call.session() else {
        bail!("No session after call");
    };

    let snapshot = tokio::time::timeout(timeout, session.settled())
        .await
        .context("Negotiation timed out")?;
    if let Some(failure) = snapshot.failure {
        bail!("Negotiation failed: {}", failure);
    }
    info!(session_id = %session.id(), state = %snapshot.state, "Negotiation settled");

    tokio::time::timeout(timeout, session.data_path().wait_for(DataPathState::Open))
        .await
        .context("Data path did not open in time")??;

    if let Some(setup_time) = session.data_path().setup_time() {
        info!(setup_ms = setup_time.as_secs_f64() * 1000.0, "Data path open");
    }

    match args.data_path {
        DataPath::DataChannel => {
            for message in &args.messages {
                call.send(message.clone()).await?;
                info!(bytes = message.len(), "Sent message");
            }
        }
        DataPath::MediaStream => {
            if let Some(stream) = session.data_path().remote_stream() {
                info!(
                    stream_id = %stream.id,
                    tracks = stream.tracks.len(),
                    "Receiving remote stream"
                );
            }
        }
    }

    let hold_until = Instant::now() + Duration::from_secs(args.hold_secs);
    while Instant::now() < hold_until {
        if shutdown_flag.load(Ordering::SeqCst) {
            warn!("Shutdown signal received");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}

fn build_config(args: &Args) -> NegotiationConfig {
    let base = match args.data_path {
        DataPath::DataChannel => NegotiationConfig::data_channel(),
        DataPath::MediaStream => NegotiationConfig::media_stream(),
    };
    let mode = if args.unreliable {
        DataChannelMode::Unreliable
    } else {
        DataChannelMode::Reliable
    };

    let mut config = base
        .with_ice_servers(args.stun_servers.clone())
        .with_channel_mode(mode);
    config.max_message_size = args.max_message_size;
    config
}

fn init_tracing() {
    // RUST_LOG overrides the default filter
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
