// main.rs

use std::{sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use metrics::{Metrics, MetricsBuilder};
use tokio::{runtime, time as tokioTime};
use tracing::{info, instrument, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

mod directory;
mod handlers;
mod ingest;
mod packaging;
mod reconcile;
mod router;
mod services;
mod transcode;
mod types;

use directory::{InMemoryDirectory, SessionDirectory};
use services::session_hub::SessionHub;
use services::source_manager::SourceManager;
use types::{
    IngestConfig, OverflowPolicy, PackagingConfig, ReconcilerConfig, RelayConfig, Services,
};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
enum LogLevel {
    Trace = 0, // Designates very fine-grained informational events, extremely verbose.
    Debug = 1, // Designates fine-grained informational events.
    Info = 2,  // Designates informational messages.
    Warn = 3,  // Designates hazardous situations.
    Error = 4, // Designates very serious errors.
}

#[derive(Parser, Debug)]
#[command(author, version, about = "relay-server")]
struct Args {
    // Set the port number
    #[arg(short, long, default_value = "3001")]
    port: u16,
    // Set the log level (possible values: error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
    /// Root directory for per-(session, participant) packaging output
    #[arg(short, long, default_value = "./media")]
    media_root: std::path::PathBuf,
    /// Transcoder binary
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,
    /// UDP port shared by the per-participant relay addresses
    #[arg(long, default_value_t = 4055)]
    relay_port: u16,
    /// Ingest buffer capacity, in frames
    #[arg(long, default_value_t = 64)]
    ingest_capacity: usize,
    /// What to do with inbound frames when the ingest buffer is full
    #[arg(long, value_enum, default_value_t = OverflowPolicy::DropOldest)]
    ingest_policy: OverflowPolicy,
    /// DASH segment duration, in seconds
    #[arg(long, default_value_t = 1)]
    seg_duration: u32,
    /// DASH live window size, in segments
    #[arg(long, default_value_t = 5)]
    window_size: u32,
    /// Extra segments kept beyond the live window
    #[arg(long, default_value_t = 5)]
    extra_window_size: u32,
    /// Packaging attempts before the failure is terminal
    #[arg(long, default_value_t = 3)]
    package_attempts: u32,
    /// Fixed backoff between packaging attempts, in milliseconds
    #[arg(long, default_value_t = 2000)]
    package_backoff_ms: u64,
    /// Reconciliation period per output directory, in seconds
    #[arg(long, default_value_t = 10)]
    reconcile_interval_secs: u64,
    /// Consecutive idle cycles before a reconciler retires
    #[arg(long, default_value_t = 10)]
    reconcile_idle_cycles: u32,
    /// Grace period before a stopped transcoder is force-killed, in seconds
    #[arg(long, default_value_t = 5)]
    stop_grace_secs: u64,
    /// JSON roster mapping tokens to participants: {token: {participant_id, session_id}}
    #[arg(long)]
    roster: Option<std::path::PathBuf>,
}

#[instrument(skip_all)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let args = Args::parse();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(match args.log_level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        });

    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    info!("{:?}", args);

    let runtime = runtime::Builder::new_multi_thread()
        .thread_name_fn(|| {
            static ATOMIC_ID: std::sync::atomic::AtomicUsize =
                std::sync::atomic::AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("MAIN_R w-{}", id)
        })
        .enable_all()
        .build()
        .unwrap();

    // Build the metrics instance; components register their own instruments
    // against it lazily.
    let metrics = MetricsBuilder::new().add_label("mode", "relay").build();
    runtime.spawn(update_metrics_loop(Arc::new(metrics)));

    // External collaborator: the roster-backed user/session directory.
    let directory: Arc<dyn SessionDirectory> = match &args.roster {
        Some(path) => Arc::new(InMemoryDirectory::from_roster_file(path)?),
        None => {
            warn!("no roster provided; every connection will be rejected");
            Arc::new(InMemoryDirectory::new())
        }
    };

    let config = Arc::new(RelayConfig {
        ffmpeg: args.ffmpeg.clone(),
        media_root: args.media_root.clone(),
        relay_port: args.relay_port,
        stop_grace: Duration::from_secs(args.stop_grace_secs),
        ingest: IngestConfig {
            capacity: args.ingest_capacity,
            policy: args.ingest_policy,
        },
        packaging: PackagingConfig {
            segment_duration_secs: args.seg_duration,
            window_size: args.window_size,
            extra_window_size: args.extra_window_size,
            max_attempts: args.package_attempts,
            retry_backoff: Duration::from_millis(args.package_backoff_ms),
        },
        reconciler: ReconcilerConfig {
            interval: Duration::from_secs(args.reconcile_interval_secs),
            max_idle_cycles: args.reconcile_idle_cycles,
        },
    });

    // Initialize services
    let sources = Arc::new(SourceManager::new(
        config.media_root.clone(),
        config.relay_port,
        config.stop_grace,
    ));
    let hub = Arc::new(SessionHub::new());
    // External collaborator: archival of an ended session's assets hangs off
    // this callback and is owned outside the relay core.
    hub.set_session_ended_callback(Arc::new(|session_id| {
        info!("session {} ended, requesting archival", session_id);
    }));

    let services = Services {
        sources,
        hub,
        directory,
        config,
    };

    // Create router
    let app = router::create_router(services);

    runtime.block_on(async move {
        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", args.port).parse().unwrap();
        let sock = socket2::Socket::new(
            match addr {
                std::net::SocketAddr::V4(_) => socket2::Domain::IPV4,
                std::net::SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM, // Will become SOCK_CLOEXEC internally on Linux
            None,
        )
        .unwrap();

        sock.set_reuse_address(true).unwrap();
        #[cfg(unix)]
        sock.set_reuse_port(true).unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.bind(&addr.into()).unwrap();
        sock.listen(1024).unwrap();

        let listener = tokio::net::TcpListener::from_std(sock.into()).unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

#[instrument(skip_all)]
async fn update_metrics_loop(metrics: Arc<Metrics>) {
    let mut interval = tokioTime::interval(tokioTime::Duration::from_secs(1));
    loop {
        metrics.update();
        interval.tick().await;
    }
}
