use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camwall::audio::PlaybackContext;
use camwall::config::{ensure_camera_ids, AppConfig, CameraConfig, ConfigStore};
use camwall::events::{EventBus, SessionEvent};
use camwall::stream::{self, FfmpegRunner, RestartPolicy, SessionDeps, SessionRegistry};

/// Metrics sampling interval
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// CamWall command line arguments
#[derive(Parser, Debug)]
#[command(name = "camwall")]
#[command(version, about = "Self-healing multi-camera RTSP viewer core", long_about = None)]
struct CliArgs {
    /// Settings file (default: <config dir>/camwall/settings.json)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Open these URLs instead of the configured cameras (repeatable)
    #[arg(short = 'u', long = "url", value_name = "URL")]
    urls: Vec<String>,

    /// Use RTSP over TCP for --url cameras
    #[arg(long)]
    tcp: bool,

    /// Start recording on every camera right away
    #[arg(long)]
    record: bool,

    /// Let FFmpeg log at debug level
    #[arg(long)]
    debug_streams: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);
    tracing::info!("Starting CamWall v{}", env!("CARGO_PKG_VERSION"));

    stream::init_ffmpeg(args.debug_streams)?;

    let config_path = args.config.clone().unwrap_or_else(ConfigStore::default_path);
    let config_store = ConfigStore::open(&config_path).await?;
    let config = load_cameras(&config_store, &args).await?;

    let enabled: Vec<(usize, CameraConfig)> = config
        .cameras
        .iter()
        .cloned()
        .enumerate()
        .filter(|(_, c)| !c.disabled)
        .collect();
    if enabled.is_empty() {
        anyhow::bail!(
            "No enabled cameras (config: {}); pass --url or add cameras",
            config_path.display()
        );
    }

    let recordings_root = config.recordings_root();
    tracing::info!("Recordings directory: {}", recordings_root.display());

    let playback = Arc::new(PlaybackContext::new(config.audio.clone()));
    let events = Arc::new(EventBus::new());
    spawn_event_logger(events.subscribe());

    let registry = Arc::new(SessionRegistry::new(SessionDeps {
        runner: Arc::new(FfmpegRunner::new(playback, recordings_root)),
        events,
        diagnostics: config.diagnostics,
        policy: RestartPolicy::default(),
    }));

    for (index, camera) in enabled {
        let session = registry.open(camera, index).await?;
        if args.record {
            session.set_recording(true);
        }
    }

    if args.urls.is_empty() {
        spawn_config_watcher(config_store.clone(), registry.clone());
        spawn_reload_listener(config_store.clone());
    }
    spawn_resume_listener(registry.clone());

    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            result = &mut shutdown_signal => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                for (key, m) in registry.sample_all().await {
                    tracing::info!(
                        camera = %key,
                        fps = format_args!("{:.1}", m.fps),
                        kbps = format_args!("{:.0}", m.bitrate_kbps),
                        drops = format_args!("{:.1}%", m.drops_pct),
                        cpu = format_args!("{:.0}%", m.cpu_pct),
                        health = m.health,
                        "stream metrics"
                    );
                }
            }
        }
    }

    registry.close_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Cameras from `--url`, or the stored configuration with ids assigned
async fn load_cameras(store: &ConfigStore, args: &CliArgs) -> anyhow::Result<AppConfig> {
    let mut config = (*store.get()).clone();

    if !args.urls.is_empty() {
        config.cameras = args
            .urls
            .iter()
            .map(|url| CameraConfig::for_url(url.clone()).with_tcp(args.tcp))
            .collect();
        ensure_camera_ids(&mut config.cameras);
        return Ok(config);
    }

    if ensure_camera_ids(&mut config.cameras) {
        store
            .update(|c| {
                ensure_camera_ids(&mut c.cameras);
            })
            .await?;
        config = (*store.get()).clone();
        tracing::info!("Assigned camera ids, saved to {}", store.path().display());
    }
    Ok(config)
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camwall=error",
        LogLevel::Warn => "camwall=warn",
        LogLevel::Info => "camwall=info",
        LogLevel::Verbose => "camwall=debug",
        LogLevel::Debug => "camwall=debug",
        LogLevel::Trace => "camwall=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Log session events as they happen
fn spawn_event_logger(mut rx: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::StateChanged { camera, state }) => {
                    tracing::debug!("[{}] State: {}", camera, state)
                }
                Ok(SessionEvent::AttemptFailed {
                    camera,
                    error,
                    retry_in_ms,
                }) => tracing::info!("[{}] Reconnecting in {}ms after: {}", camera, retry_in_ms, error),
                Ok(SessionEvent::RecordingStarted { camera, path }) => {
                    tracing::info!("[{}] Recording to {}", camera, path.display())
                }
                Ok(SessionEvent::RecordingStopped { camera, path }) => {
                    tracing::info!("[{}] Recording saved: {}", camera, path.display())
                }
                Ok(SessionEvent::Closed { camera }) => tracing::debug!("[{}] Closed", camera),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged, {} events skipped", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Apply store changes (from `SIGHUP` reloads) to the open sessions
fn spawn_config_watcher(store: ConfigStore, registry: Arc<SessionRegistry>) {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        loop {
            let change = match rx.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let config = store.get();
            for key in change.cameras {
                let Some(camera) = config.camera(&key) else {
                    if registry.close(&key).await.is_ok() {
                        tracing::info!("[{}] Removed from config, closed", key);
                    }
                    continue;
                };
                if camera.disabled {
                    let _ = registry.close(&key).await;
                } else if registry.get(&key).await.is_some() {
                    let _ = registry.restart_with(&key, camera.clone(), "settings changed").await;
                } else {
                    let index = config
                        .cameras
                        .iter()
                        .position(|c| c.key() == key)
                        .unwrap_or(config.cameras.len());
                    if let Err(e) = registry.open(camera.clone(), index).await {
                        tracing::warn!("[{}] Failed to open: {}", key, e);
                    }
                }
            }
        }
    });
}

/// `SIGHUP` re-reads the settings file; the config watcher applies the result
fn spawn_reload_listener(store: ConfigStore) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Reload signal unavailable: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match store.reload().await {
                Ok(change) => tracing::info!(
                    "Reloaded {}, {} camera(s) changed",
                    store.path().display(),
                    change.cameras.len()
                ),
                Err(e) => tracing::warn!("Reload of {} failed: {}", store.path().display(), e),
            }
        }
    });
}

/// `SIGUSR1` tells us the host just resumed from sleep
fn spawn_resume_listener(registry: Arc<SessionRegistry>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut resumed = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Resume signal unavailable: {}", e);
                return;
            }
        };
        while resumed.recv().await.is_some() {
            registry.on_resume_from_sleep().await;
        }
    });
}
