//! Session tracking: a shared TTL-bounded map from application session
//! tokens to a compromise flag, plus the filters that feed and consume
//! it.

use super::{ChunkFilter, Direction, FilterInput, FilterVerdict};
use crate::config::SessionConfig;
use crate::error::{FilterError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use regex::bytes::Regex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Clone, Copy)]
struct SessionEntry {
    compromised: bool,
    expires_at: Instant,
}

/// Shared across all connections; every access goes through the inner
/// map's own synchronization. Entries expire lazily after the TTL, at
/// which point a returning session counts as fresh again.
pub struct SessionCache {
    entries: DashMap<String, SessionEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl SessionCache {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self::with_ttl(Duration::from_secs(cfg.ttl_secs), cfg.max_entries)
    }

    pub fn with_ttl(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Register a session the first time it is seen. An expired entry is
    /// replaced with a fresh, uncompromised one.
    pub fn observe(&self, token: &str) {
        if self.entries.len() >= self.max_entries {
            self.purge_expired();
        }
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(token.to_string())
            .or_insert(SessionEntry {
                compromised: false,
                expires_at: now + self.ttl,
            });
        if entry.expires_at <= now {
            *entry = SessionEntry {
                compromised: false,
                expires_at: now + self.ttl,
            };
        }
    }

    pub fn mark_compromised(&self, token: &str) {
        self.entries.insert(
            token.to_string(),
            SessionEntry {
                compromised: true,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn is_compromised(&self, token: &str) -> bool {
        match self.entries.get(token) {
            Some(entry) => entry.compromised && entry.expires_at > Instant::now(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

pub(crate) fn cookie_regex(cookie_name: &str) -> Result<Regex> {
    crate::config::compile_pattern(&format!(
        r"(?i)cookie:[^\r\n]*?\b{}=([^;\r\n ]+)",
        regex::escape(cookie_name)
    ))
}

fn extract_token(re: &Regex, data: &[u8]) -> Option<String> {
    // The request most recently appended to history carries the cookie
    // that the next response belongs to, so take the last match.
    re.captures_iter(data)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

/// Registers session tokens as they appear in Cookie / Set-Cookie
/// framing metadata. Never alters traffic.
pub struct SessionObserver {
    cookie_re: Regex,
}

impl SessionObserver {
    pub fn new(cookie_name: &str) -> Result<Self> {
        Ok(Self {
            cookie_re: cookie_regex(cookie_name)?,
        })
    }
}

impl ChunkFilter for SessionObserver {
    fn name(&self) -> &'static str {
        "session-observer"
    }

    fn apply(&self, input: &FilterInput<'_>) -> std::result::Result<FilterVerdict, FilterError> {
        if let Some(token) = extract_token(&self.cookie_re, input.chunk) {
            debug!(conn_id = %input.conn_id, session = %token, "observed session");
            input.sessions.observe(&token);
        }
        Ok(FilterVerdict::Pass)
    }
}

/// Server-to-client gate: once a session is marked compromised, every
/// response tied to it is treated as hostile until the TTL lapses.
pub struct CompromisedSessionGate {
    cookie_re: Regex,
    block: bool,
}

impl CompromisedSessionGate {
    pub fn new(cookie_name: &str, block: bool) -> Result<Self> {
        Ok(Self {
            cookie_re: cookie_regex(cookie_name)?,
            block,
        })
    }

    fn session_for_response(&self, input: &FilterInput<'_>) -> Option<String> {
        extract_token(&self.cookie_re, input.chunk)
            .or_else(|| extract_token(&self.cookie_re, input.client_history.as_slice()))
    }
}

impl ChunkFilter for CompromisedSessionGate {
    fn name(&self) -> &'static str {
        "compromised-session-gate"
    }

    fn apply(&self, input: &FilterInput<'_>) -> std::result::Result<FilterVerdict, FilterError> {
        if input.direction != Direction::ServerToClient {
            return Ok(FilterVerdict::Pass);
        }
        let Some(token) = self.session_for_response(input) else {
            return Ok(FilterVerdict::Pass);
        };
        if !input.sessions.is_compromised(&token) {
            return Ok(FilterVerdict::Pass);
        }

        info!(conn_id = %input.conn_id, session = %token, "response for compromised session");
        if self.block {
            if input.is_http {
                Ok(FilterVerdict::Replace(Bytes::from_static(
                    super::redactor::BLOCK_RESPONSE,
                )))
            } else {
                Ok(FilterVerdict::Close)
            }
        } else {
            // Downstream redactor scrubs any flag the response carries.
            Ok(FilterVerdict::Pass)
        }
    }
}
