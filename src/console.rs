//! Interactive operator console on stdin.
//!
//! Single-letter commands, unknown input ignored:
//!   q        graceful shutdown
//!   r        reload config, swap filters, rebuild listener
//!   i        pid and live connection count
//!   + / -    raise / lower log verbosity
//!   u [n]    report or raise the open-file limit

use crate::state::AppState;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

pub async fn run_console(state: Arc<AppState>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            // stdin closed or unreadable; the console just goes quiet.
            Ok(None) | Err(_) => break,
        };

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("q") => {
                info!("console: shutdown requested");
                state.shutdown.cancel();
                break;
            }
            Some("r") => match state.reload().await {
                Ok(_) => {
                    if state.reload_tx.send(()).await.is_err() {
                        warn!("accept loop is gone; filter reload applied anyway");
                    }
                }
                Err(e) => error!(error = %e, "reload failed; previous state kept"),
            },
            Some("i") => {
                info!(
                    pid = std::process::id(),
                    active = state.active_connections(),
                    "status"
                );
            }
            Some("+") => {
                if let Some(log) = &state.log {
                    info!(level = %log.raise(), "log level raised");
                }
            }
            Some("-") => {
                if let Some(log) = &state.log {
                    info!(level = %log.lower(), "log level lowered");
                }
            }
            Some("u") => match parts.next().map(str::parse::<u64>) {
                None => report_fd_limit(),
                Some(Ok(n)) => raise_fd_limit(n),
                Some(Err(_)) => warn!("console: u takes a numeric limit"),
            },
            _ => {}
        }
    }
}

fn report_fd_limit() {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => info!(soft, hard, "open-file limit"),
        Err(e) => warn!(error = %e, "cannot read open-file limit"),
    }
}

pub fn raise_fd_limit(target: u64) {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => {
            if soft >= target {
                info!(soft, "open-file limit already sufficient");
                return;
            }
            let new_hard = hard.max(target);
            match setrlimit(Resource::RLIMIT_NOFILE, target, new_hard) {
                Ok(()) => info!(soft = target, hard = new_hard, "open-file limit raised"),
                Err(e) => warn!(error = %e, target, "failed to raise open-file limit"),
            }
        }
        Err(e) => warn!(error = %e, "cannot read open-file limit"),
    }
}
