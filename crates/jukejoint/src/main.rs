use anyhow::{Context, Result};
use clap::Parser;
use jukeconf::JukeConfig;
use jukejoint::auth::HeaderAuth;
use jukejoint::bridge::ObserverBridge;
use jukejoint::bus::EventBus;
use jukejoint::endpoints::HttpEndpoints;
use jukejoint::media::MediaStore;
use jukejoint::pipeline::GenerationPipeline;
use jukejoint::room::RoomManager;
use jukejoint::scheduler::Schedulers;
use jukejoint::store::{SqliteStore, Store};
use jukejoint::sync::RoomEventSync;
use jukejoint::web::{self, reqlog::RequestLog, AppState};
use jukeproto::Event;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long a temporary playlist survives without a heartbeat.
const TEMP_PLAYLIST_TTL: Duration = Duration::from_secs(3600);

/// The Jukejoint server
///
/// Runs the song generation pipeline and the multi-device playback rooms.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/jukejoint/config.toml
/// 3. ~/.config/jukejoint/config.toml
/// 4. ./jukejoint.toml (or --config path)
/// 5. Environment variables (API_PORT, ALLOWED_ORIGINS, ...)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./jukejoint.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = JukeConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.infra.logging.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("📋 Configuration loaded from:");
    for path in &sources.files {
        info!("   - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   Environment overrides: {:?}", sources.env_overrides);
    }

    let state_dir = &config.infra.paths.state_dir;
    std::fs::create_dir_all(state_dir).context("Failed to create state directory")?;
    info!("Using state directory: {}", state_dir.display());

    // --- Store ---
    info!("🗄️  Opening store...");
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(config.infra.paths.db_path()).context("Failed to open store")?);

    // --- Media ---
    let media = Arc::new(
        MediaStore::new(config.infra.paths.media_dir()).context("Failed to prepare media dir")?,
    );
    info!("   Media dir: {}", media.dir().display());

    // --- Event bus ---
    info!("🚌 Starting event bus...");
    let bus = EventBus::new(
        config.infra.logging.handler_slow_ms,
        config.infra.logging.event_bus_trace,
    );

    let shutdown = CancellationToken::new();

    // --- Endpoint schedulers ---
    info!("⚙️  Starting endpoint schedulers...");
    let schedulers = Schedulers::new(&config.bootstrap.models, shutdown.clone());
    info!(
        "   llm x{}  image x{}  audio x{}",
        config.bootstrap.models.llm_concurrency,
        config.bootstrap.models.image_concurrency,
        config.bootstrap.models.audio_concurrency
    );

    // --- Generation pipeline ---
    info!("🎼 Starting generation pipeline...");
    let endpoints = Arc::new(HttpEndpoints::new(&config.bootstrap.models));
    let pipeline = GenerationPipeline::new(
        store.clone(),
        endpoints,
        schedulers.clone(),
        media.clone(),
        bus.clone(),
        &config.bootstrap.pipeline,
        shutdown.clone(),
    );
    let _pipeline_subs = pipeline.attach();
    info!(
        "   poll every {}ms, {} attempts max",
        config.bootstrap.pipeline.poll_interval_ms, config.bootstrap.pipeline.poll_max_attempts
    );

    // --- Rooms + event sync ---
    info!("🏠 Creating room manager...");
    let manager = RoomManager::new(store.clone());
    let sync = RoomEventSync::new(manager.clone(), store.clone(), bus.clone());
    let _sync_subs = sync.attach();

    // --- Observer bridge ---
    let bridge = ObserverBridge::new();
    let _bridge_sub = bridge.attach(&bus);
    info!("📢 Observer bridge attached");

    // --- Request log ---
    let reqlog = Arc::new(RequestLog::new(config.infra.logging.slow_request_ms));
    let _summary_task = reqlog.spawn_summary_task(
        Duration::from_millis(config.infra.logging.summary_interval_ms),
        shutdown.clone(),
    );

    // --- Temporary playlist cleanup ---
    {
        let store = store.clone();
        let bus = bus.clone();
        let interval = Duration::from_millis(config.infra.cleanup.temp_playlist_interval_ms);
        let ct = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.delete_expired_temporary_playlists(TEMP_PLAYLIST_TTL).await {
                            Ok(removed) => {
                                for playlist_id in removed {
                                    bus.emit(Event::PlaylistDeleted { playlist_id });
                                }
                            }
                            Err(error) => {
                                tracing::warn!(error = %error, "temp playlist sweep failed");
                            }
                        }
                    }
                    _ = ct.cancelled() => break,
                }
            }
        });
    }

    // --- HTTP + WebSocket listener ---
    let app_state = AppState {
        store,
        manager: manager.clone(),
        sync,
        bridge,
        schedulers,
        pipeline,
        media,
        auth: Arc::new(HeaderAuth),
        bus,
        reqlog: reqlog.clone(),
        started_at: Instant::now(),
    };
    let app = web::router(app_state, &config.infra.server.allowed_origins);

    let bind_addr: std::net::SocketAddr = config
        .infra
        .server
        .bind_addr()
        .parse()
        .context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;

    info!("🎵 Jukejoint starting on http://{bind_addr}");
    info!("   Room socket:     ws://{bind_addr}/ws/room");
    info!("   Observer socket: ws://{bind_addr}/ws/events");
    info!("   Health:          GET http://{bind_addr}/health");
    info!("   Worker status:   GET http://{bind_addr}/api/worker/status");

    let server_ct = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_ct.cancelled().await;
        info!("Server shutdown signal received");
    });
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Server shutdown with error: {e:?}");
        }
    });

    info!("🎵 Server ready. Drop a coin in!");

    // Handle both SIGINT (Ctrl+C) and SIGTERM
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    // Closes device sockets, cancels in-flight jobs, stops the loops.
    shutdown.cancel();
    manager.dispose_all().await;
    reqlog.flush_summary();
    let _ = server_task.await;

    info!("Shutdown complete");
    Ok(())
}
