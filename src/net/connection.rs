//! Per-connection relay: two half-duplex pumps multiplexed in one task.
//!
//! A connection exclusively owns its histories, reframers, and capture
//! session. The filter context is the snapshot taken at accept time;
//! reloads never touch a live connection.

use crate::capture::CaptureSession;
use crate::filter::{ChainOutcome, Direction, FilterContext, SessionCache};
use crate::history::History;
use crate::http::{Reframed, Reframer};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Active,
    Closing,
    Closed,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Connection {
    id: String,
    state: ConnState,
    filters: Arc<FilterContext>,
    sessions: Arc<SessionCache>,
    client_history: History,
    server_history: History,
    client_reframer: Option<Reframer>,
    server_reframer: Option<Reframer>,
    capture: Option<CaptureSession>,
    idle_timeout: Option<Duration>,
}

async fn idle_gate(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

impl Connection {
    pub fn new(
        id: String,
        filters: Arc<FilterContext>,
        sessions: Arc<SessionCache>,
        capture: Option<CaptureSession>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let cap = filters.history_cap;
        let reframing = filters.http_reframing;
        Self {
            id,
            state: ConnState::Connecting,
            filters,
            sessions,
            client_history: History::new(cap),
            server_history: History::new(cap),
            client_reframer: reframing.then(Reframer::new),
            server_reframer: reframing.then(Reframer::new),
            capture,
            idle_timeout,
        }
    }

    /// Relay until EOF, error, filter close, idle timeout, or shutdown.
    /// Teardown always closes both sides and flushes the capture FIN.
    pub async fn run(
        mut self,
        client: Box<dyn AsyncStream>,
        upstream: Box<dyn AsyncStream>,
        shutdown: CancellationToken,
    ) {
        self.state = ConnState::Active;
        debug!(conn_id = %self.id, "connection active");

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(upstream);
        let mut client_buf = vec![0u8; READ_BUF];
        let mut server_buf = vec![0u8; READ_BUF];

        loop {
            let flow = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(conn_id = %self.id, "shutdown requested");
                    Flow::Stop
                }
                _ = idle_gate(self.idle_timeout) => {
                    debug!(conn_id = %self.id, "idle timeout");
                    Flow::Stop
                }
                res = client_read.read(&mut client_buf) => match res {
                    Ok(0) => {
                        self.flush_reframer(Direction::ClientToServer, &mut server_write).await;
                        debug!(conn_id = %self.id, "client closed");
                        Flow::Stop
                    }
                    Ok(n) => {
                        self.relay_chunk(
                            Direction::ClientToServer,
                            &client_buf[..n],
                            &mut server_write,
                        )
                        .await
                    }
                    Err(e) => {
                        warn!(conn_id = %self.id, error = %e, "client read failed");
                        Flow::Stop
                    }
                },
                res = server_read.read(&mut server_buf) => match res {
                    Ok(0) => {
                        self.flush_reframer(Direction::ServerToClient, &mut client_write).await;
                        debug!(conn_id = %self.id, "upstream closed");
                        Flow::Stop
                    }
                    Ok(n) => {
                        self.relay_chunk(
                            Direction::ServerToClient,
                            &server_buf[..n],
                            &mut client_write,
                        )
                        .await
                    }
                    Err(e) => {
                        warn!(conn_id = %self.id, error = %e, "upstream read failed");
                        Flow::Stop
                    }
                },
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        self.teardown(client_write, server_write).await;
    }

    /// Both sockets come down together; safe to call on a connection
    /// that is already closing.
    async fn teardown<A, B>(&mut self, mut client_write: A, mut server_write: B)
    where
        A: AsyncWrite + Unpin,
        B: AsyncWrite + Unpin,
    {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closing;
        let _ = client_write.shutdown().await;
        let _ = server_write.shutdown().await;
        if let Some(capture) = &mut self.capture {
            capture.finish(&self.id);
        }
        self.state = ConnState::Closed;
        debug!(conn_id = %self.id, "connection closed");
    }

    async fn relay_chunk<W: AsyncWrite + Unpin>(
        &mut self,
        direction: Direction,
        data: &[u8],
        out: &mut W,
    ) -> Flow {
        match direction {
            Direction::ClientToServer => self.client_history.push(data),
            Direction::ServerToClient => self.server_history.push(data),
        }
        if let Some(capture) = &mut self.capture {
            capture.record(direction, data, &self.id);
        }

        let reframer = match direction {
            Direction::ClientToServer => self.client_reframer.as_mut(),
            Direction::ServerToClient => self.server_reframer.as_mut(),
        };
        let (units, is_http) = match reframer {
            Some(reframer) => match reframer.push(data, &self.id) {
                Reframed::Messages(msgs) => (msgs, true),
                Reframed::Passthrough(raw) => (vec![raw], false),
                Reframed::Pending => return Flow::Continue,
            },
            None => (vec![Bytes::copy_from_slice(data)], false),
        };

        self.forward_units(direction, units, is_http, out).await
    }

    /// EOF path: whatever the reframer still buffers goes out raw.
    async fn flush_reframer<W: AsyncWrite + Unpin>(&mut self, direction: Direction, out: &mut W) {
        let reframer = match direction {
            Direction::ClientToServer => self.client_reframer.as_mut(),
            Direction::ServerToClient => self.server_reframer.as_mut(),
        };
        let Some(leftover) = reframer.and_then(|r| r.drain()) else {
            return;
        };
        debug!(
            conn_id = %self.id,
            direction = direction.as_str(),
            bytes = leftover.len(),
            "flushing buffered bytes at close"
        );
        self.forward_units(direction, vec![leftover], false, out)
            .await;
    }

    async fn forward_units<W: AsyncWrite + Unpin>(
        &mut self,
        direction: Direction,
        units: Vec<Bytes>,
        is_http: bool,
        out: &mut W,
    ) -> Flow {
        for unit in units {
            let outcome = self.filters.run(
                direction,
                unit,
                &self.client_history,
                &self.server_history,
                &self.id,
                &self.sessions,
                is_http,
            );
            match outcome {
                ChainOutcome::Forward(bytes) => {
                    if let Err(e) = out.write_all(&bytes).await {
                        warn!(conn_id = %self.id, error = %e, "relay write failed");
                        return Flow::Stop;
                    }
                }
                ChainOutcome::Close => return Flow::Stop,
            }
        }
        Flow::Continue
    }
}
