//! Ordered per-direction transform chains over relayed chunks.
//!
//! Filters are pure: (direction, chunk, histories, connection id) in,
//! verdict out. The active set lives in an immutable [`FilterContext`]
//! that reload publishes atomically; a running connection keeps the
//! context it loaded at accept time.

pub mod guards;
pub mod redactor;
pub mod session;

use crate::config::FilterConfig;
use crate::error::{ConfigError, FilterError, Result};
use crate::history::History;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error};

pub use redactor::FlagRedactor;
pub use session::SessionCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client->server",
            Direction::ServerToClient => "server->client",
        }
    }
}

/// Everything a filter may look at. Chunk and histories are borrowed
/// from the owning connection; the session cache is the one deliberately
/// shared piece of state.
pub struct FilterInput<'a> {
    pub direction: Direction,
    pub chunk: &'a [u8],
    pub client_history: &'a History,
    pub server_history: &'a History,
    pub conn_id: &'a str,
    pub sessions: &'a SessionCache,
    /// True when the chunk is a reassembled HTTP message rather than a
    /// raw stream fragment.
    pub is_http: bool,
}

pub enum FilterVerdict {
    Pass,
    Replace(Bytes),
    Close,
}

pub trait ChunkFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, input: &FilterInput<'_>) -> std::result::Result<FilterVerdict, FilterError>;
}

pub enum ChainOutcome {
    Forward(Bytes),
    Close,
}

/// Immutable snapshot of compiled filter state. Built fresh at startup
/// and on every reload, never mutated in place.
pub struct FilterContext {
    client_chain: Vec<Arc<dyn ChunkFilter>>,
    server_chain: Vec<Arc<dyn ChunkFilter>>,
    pub http_reframing: bool,
    pub history_cap: usize,
}

impl FilterContext {
    pub fn build(cfg: &FilterConfig) -> Result<Self> {
        let flag_pattern = crate::config::compile_pattern(&cfg.flag_pattern)?;
        if flag_pattern.is_match(cfg.flag_replacement.as_bytes()) {
            return Err(ConfigError::Validation(format!(
                "Flag replacement '{}' matches the flag pattern; redaction would not be idempotent",
                cfg.flag_replacement
            ))
            .into());
        }

        let mut client_chain: Vec<Arc<dyn ChunkFilter>> = Vec::new();
        let mut server_chain: Vec<Arc<dyn ChunkFilter>> = Vec::new();

        if cfg.session.enabled {
            let observer = Arc::new(session::SessionObserver::new(&cfg.session.cookie_name)?);
            client_chain.push(observer.clone());
            server_chain.push(observer);
        }

        if !cfg.suspicious_patterns.is_empty() {
            client_chain.push(Arc::new(guards::SuspicionFilter::new(
                &cfg.suspicious_patterns,
                &cfg.session.cookie_name,
                cfg.block_suspicious,
            )?));
        }

        if !cfg.guards.allowed_methods.is_empty()
            || cfg.guards.max_parameter_count.is_some()
            || cfg.guards.max_parameter_length.is_some()
            || cfg.guards.reject_nonprintable_params
            || !cfg.guards.user_agent_allowlist.is_empty()
            || !cfg.guards.user_agent_denylist.is_empty()
            || !cfg.guards.allowed_encodings.is_empty()
        {
            client_chain.push(Arc::new(guards::RequestGuards::new(
                &cfg.guards,
                &cfg.session.cookie_name,
                cfg.block_suspicious,
            )?));
        }

        if cfg.session.enabled {
            server_chain.push(Arc::new(session::CompromisedSessionGate::new(
                &cfg.session.cookie_name,
                cfg.block_suspicious,
            )?));
        }

        if cfg.guards.detect_duplicate_flags {
            server_chain.push(Arc::new(guards::DuplicateFlagFilter::new(
                flag_pattern.clone(),
            )));
        }

        // The redactor runs last so every response leaves scrubbed no
        // matter what the earlier filters decided.
        server_chain.push(Arc::new(FlagRedactor::new(
            flag_pattern,
            cfg.flag_replacement.as_bytes().to_vec(),
            cfg.block_suspicious,
        )));

        Ok(Self {
            client_chain,
            server_chain,
            http_reframing: cfg.http_reframing,
            history_cap: cfg.history_cap,
        })
    }

    pub fn chain_len(&self, direction: Direction) -> usize {
        match direction {
            Direction::ClientToServer => self.client_chain.len(),
            Direction::ServerToClient => self.server_chain.len(),
        }
    }

    /// Run the directional chain over one chunk. A filter error aborts
    /// only this chunk: it is logged and treated as force-close.
    pub fn run(
        &self,
        direction: Direction,
        chunk: Bytes,
        client_history: &History,
        server_history: &History,
        conn_id: &str,
        sessions: &SessionCache,
        is_http: bool,
    ) -> ChainOutcome {
        let chain = match direction {
            Direction::ClientToServer => &self.client_chain,
            Direction::ServerToClient => &self.server_chain,
        };

        let mut current = chunk;
        for filter in chain {
            let input = FilterInput {
                direction,
                chunk: &current,
                client_history,
                server_history,
                conn_id,
                sessions,
                is_http,
            };
            match filter.apply(&input) {
                Ok(FilterVerdict::Pass) => {}
                Ok(FilterVerdict::Replace(replacement)) => {
                    debug!(
                        conn_id = %conn_id,
                        filter = filter.name(),
                        direction = direction.as_str(),
                        "chunk rewritten"
                    );
                    current = replacement;
                }
                Ok(FilterVerdict::Close) => {
                    debug!(
                        conn_id = %conn_id,
                        filter = filter.name(),
                        direction = direction.as_str(),
                        "filter forced close"
                    );
                    return ChainOutcome::Close;
                }
                Err(e) => {
                    error!(
                        conn_id = %conn_id,
                        filter = filter.name(),
                        error = %e,
                        "filter failed; closing connection"
                    );
                    return ChainOutcome::Close;
                }
            }
        }
        ChainOutcome::Forward(current)
    }
}
