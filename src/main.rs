use clap::Parser;
use flagwall::capture::{run_rotation, CaptureWriter};
use flagwall::config;
use flagwall::console;
use flagwall::net::{run_accept_loop, Listener};
use flagwall::state::{AppState, LogHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::reload;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "flagwall", version, about = "Intercepting TCP proxy with flag redaction and traffic capture")]
struct Args {
    /// Config file (.toml, .json, .yaml); defaults to flagwall.* in the
    /// working directory plus FLAGWALL_ environment overrides.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force debug-level logging regardless of the config.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let initial_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let (level_layer, level_handle) = reload::Layer::new(initial_level);
    tracing_subscriber::registry()
        .with(level_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = match &args.config {
        Some(path) => config::load_from_path(path).await?,
        None => config::load_from_env_or_file().await?,
    };

    if !args.debug {
        if let Ok(level) = cfg.proxy.log_level.parse::<LevelFilter>() {
            if let Err(e) = level_handle.reload(level) {
                warn!(error = %e, "failed to apply configured log level");
            }
        } else {
            warn!(level = %cfg.proxy.log_level, "unrecognized log level; keeping info");
        }
    }
    let log = LogHandle::new(level_handle, initial_level);

    console::raise_fd_limit(cfg.proxy.fd_limit);

    let capture = if cfg.capture.enabled {
        Some(Arc::new(CaptureWriter::new(&cfg.capture)?))
    } else {
        None
    };

    let (reload_tx, reload_rx) = mpsc::channel(4);
    let state = Arc::new(AppState::new(
        cfg.clone(),
        capture.clone(),
        reload_tx,
        args.config.clone(),
        Some(log),
    )?);

    let listener = Listener::build(&cfg)?;
    let accept_task = tokio::spawn(run_accept_loop(listener, state.clone(), reload_rx));

    if let Some(writer) = capture {
        tokio::spawn(run_rotation(
            writer,
            Duration::from_secs(cfg.capture.rotate_secs),
            state.shutdown.clone(),
        ));
    }

    // Watch whichever config file is in play: the explicit one, or the
    // default file the figment stack picked up from the working dir.
    let watch_path = args
        .config
        .clone()
        .or_else(|| config::default_config_file_in(std::path::Path::new(".")));
    if let Some(path) = watch_path {
        tokio::spawn(watch_config(state.clone(), path));
    }

    tokio::spawn(console::run_console(state.clone()));

    shutdown_signal(state.shutdown.clone()).await;
    info!("shutting down");

    // Let in-flight connections drain, bounded.
    let drain = async {
        while state.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(
            active = state.active_connections(),
            "drain timeout; closing remaining connections"
        );
    }
    let _ = accept_task.await;

    info!("bye");
    Ok(())
}

/// Resolves on ctrl-c, SIGTERM, or a console-initiated shutdown, and
/// cancels the token either way.
async fn shutdown_signal(token: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }
    token.cancel();
}

/// Polls the config file's mtime; a change rebuilds the filter context
/// without touching the listener.
async fn watch_config(state: Arc<AppState>, path: PathBuf) {
    let mut last = config::file_mtime(&path);
    let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let current = config::file_mtime(&path);
                if current.is_some() && current != last {
                    last = current;
                    info!(path = %path.display(), "config file changed");
                    if let Err(e) = state.reload().await {
                        error!(error = %e, "config reload failed; previous filters kept");
                    }
                }
            }
        }
    }
}
