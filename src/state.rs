//! Process-wide shared state.
//!
//! Mutable state is narrow on purpose: the config and filter context
//! are immutable snapshots republished atomically on reload, the
//! session cache and capture writer carry their own synchronization,
//! and everything else per connection is exclusively owned by its
//! handler task.

use crate::capture::CaptureWriter;
use crate::config::{self, Config};
use crate::error::Result;
use crate::filter::{FilterContext, SessionCache};
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::reload;
use tracing_subscriber::Registry;

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Console-steerable log verbosity, backed by the subscriber's reload
/// handle.
pub struct LogHandle {
    handle: reload::Handle<LevelFilter, Registry>,
    index: AtomicUsize,
}

impl LogHandle {
    pub fn new(handle: reload::Handle<LevelFilter, Registry>, initial: LevelFilter) -> Self {
        let index = LEVELS.iter().position(|l| *l == initial).unwrap_or(2);
        Self {
            handle,
            index: AtomicUsize::new(index),
        }
    }

    pub fn raise(&self) -> LevelFilter {
        self.step(1)
    }

    pub fn lower(&self) -> LevelFilter {
        self.step(-1)
    }

    fn step(&self, delta: isize) -> LevelFilter {
        let current = self.index.load(Ordering::Relaxed) as isize;
        let next = (current + delta).clamp(0, LEVELS.len() as isize - 1) as usize;
        self.index.store(next, Ordering::Relaxed);
        let level = LEVELS[next];
        if let Err(e) = self.handle.reload(level) {
            warn!(error = %e, "failed to adjust log level");
        }
        level
    }
}

pub struct AppState {
    config: ArcSwap<Config>,
    filters: ArcSwap<FilterContext>,
    pub sessions: Arc<SessionCache>,
    pub capture: Option<Arc<CaptureWriter>>,
    pub shutdown: CancellationToken,
    pub reload_tx: mpsc::Sender<()>,
    pub config_path: Option<PathBuf>,
    pub log: Option<LogHandle>,
    active: AtomicUsize,
}

impl AppState {
    pub fn new(
        config: Config,
        capture: Option<Arc<CaptureWriter>>,
        reload_tx: mpsc::Sender<()>,
        config_path: Option<PathBuf>,
        log: Option<LogHandle>,
    ) -> Result<Self> {
        let filters = FilterContext::build(&config.filters)?;
        let sessions = Arc::new(SessionCache::new(&config.filters.session));
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            filters: ArcSwap::new(Arc::new(filters)),
            sessions,
            capture,
            shutdown: CancellationToken::new(),
            reload_tx,
            config_path,
            log,
            active: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Snapshot taken once per connection at accept time; a reload
    /// never retrofits a live connection.
    pub fn filters(&self) -> Arc<FilterContext> {
        self.filters.load_full()
    }

    /// Re-read the config and publish a fresh filter context. The
    /// session cache persists across reloads so compromise marks
    /// survive a filter change.
    pub async fn reload(&self) -> Result<Arc<Config>> {
        let config = match &self.config_path {
            Some(path) => config::load_from_path(path).await?,
            None => config::load_from_env_or_file().await?,
        };
        let filters = FilterContext::build(&config.filters)?;
        let config = Arc::new(config);
        self.filters.store(Arc::new(filters));
        self.config.store(config.clone());
        info!("configuration reloaded");
        Ok(config)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            state: self.clone(),
        }
    }
}

/// Decrements the live-connection counter when the handler task ends,
/// however it ends.
pub struct ConnectionGuard {
    state: Arc<AppState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::Relaxed);
    }
}
