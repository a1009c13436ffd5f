//! Request-side guard filters and response-side anomaly detectors.
//!
//! Guards never rewrite request bytes: a violation either force-closes
//! the connection (block mode) or marks the session compromised so the
//! response side redacts unconditionally.

use super::session::cookie_regex;
use super::{ChunkFilter, Direction, FilterInput, FilterVerdict};
use crate::config::GuardConfig;
use crate::error::{FilterError, Result};
use regex::bytes::Regex;
use tracing::{debug, info, warn};

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| crate::config::compile_pattern(p))
        .collect()
}

/// Marks the chunk's session compromised (when one is extractable from
/// the request or its history) and picks the verdict for a violation.
fn punish(
    input: &FilterInput<'_>,
    cookie_re: &Regex,
    block: bool,
    filter: &'static str,
    reason: &str,
) -> FilterVerdict {
    debug!(
        conn_id = %input.conn_id,
        filter = filter,
        reason = reason,
        "request flagged"
    );

    let token = cookie_re
        .captures_iter(input.chunk)
        .last()
        .or_else(|| cookie_re.captures_iter(input.client_history.as_slice()).last())
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned());
    if let Some(token) = token {
        info!(conn_id = %input.conn_id, session = %token, "session marked compromised");
        input.sessions.mark_compromised(&token);
    }

    if block {
        FilterVerdict::Close
    } else {
        FilterVerdict::Pass
    }
}

/// Matches configured byte regexes against the request chunk and the
/// retained request history.
pub struct SuspicionFilter {
    patterns: Vec<Regex>,
    cookie_re: Regex,
    block: bool,
}

impl SuspicionFilter {
    pub fn new(patterns: &[String], cookie_name: &str, block: bool) -> Result<Self> {
        Ok(Self {
            patterns: compile_all(patterns)?,
            cookie_re: cookie_regex(cookie_name)?,
            block,
        })
    }
}

impl ChunkFilter for SuspicionFilter {
    fn name(&self) -> &'static str {
        "suspicion"
    }

    fn apply(&self, input: &FilterInput<'_>) -> std::result::Result<FilterVerdict, FilterError> {
        if input.direction != Direction::ClientToServer {
            return Ok(FilterVerdict::Pass);
        }
        let hit = self.patterns.iter().any(|re| {
            re.is_match(input.chunk) || re.is_match(input.client_history.as_slice())
        });
        if !hit {
            return Ok(FilterVerdict::Pass);
        }
        Ok(punish(
            input,
            &self.cookie_re,
            self.block,
            self.name(),
            "suspicious pattern matched",
        ))
    }
}

/// HTTP request hygiene checks: method allow-list, query parameter
/// limits, printable-parameter enforcement, User-Agent allow/deny.
/// Chunks that do not look like an HTTP request pass through.
pub struct RequestGuards {
    allowed_methods: Vec<String>,
    max_parameter_count: Option<usize>,
    max_parameter_length: Option<usize>,
    reject_nonprintable: bool,
    ua_allowlist: Vec<Regex>,
    ua_denylist: Vec<Regex>,
    allowed_encodings: Vec<String>,
    request_line_re: Regex,
    user_agent_re: Regex,
    accept_encoding_re: Regex,
    cookie_re: Regex,
    block: bool,
}

impl RequestGuards {
    pub fn new(cfg: &GuardConfig, cookie_name: &str, block: bool) -> Result<Self> {
        Ok(Self {
            allowed_methods: cfg.allowed_methods.clone(),
            max_parameter_count: cfg.max_parameter_count,
            max_parameter_length: cfg.max_parameter_length,
            reject_nonprintable: cfg.reject_nonprintable_params,
            ua_allowlist: compile_all(&cfg.user_agent_allowlist)?,
            ua_denylist: compile_all(&cfg.user_agent_denylist)?,
            allowed_encodings: cfg
                .allowed_encodings
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            request_line_re: crate::config::compile_pattern(
                r"^([A-Z]+) (\S+) HTTP/\d(?:\.\d)?",
            )?,
            user_agent_re: crate::config::compile_pattern(r"(?i)user-agent: *([^\r\n]*)")?,
            accept_encoding_re: crate::config::compile_pattern(
                r"(?i)accept-encoding: *([^\r\n]*)",
            )?,
            cookie_re: cookie_regex(cookie_name)?,
            block,
        })
    }

    fn violation(&self, chunk: &[u8]) -> Option<String> {
        let caps = self.request_line_re.captures(chunk)?;
        let method = String::from_utf8_lossy(caps.get(1)?.as_bytes()).into_owned();
        let path = caps.get(2)?.as_bytes();

        if !self.allowed_methods.is_empty() && !self.allowed_methods.contains(&method) {
            return Some(format!("method '{method}' not allowed"));
        }

        if let Some(query) = path.splitn(2, |&b| b == b'?').nth(1) {
            let params: Vec<&[u8]> = query.split(|&b| b == b'&').collect();
            if let Some(max) = self.max_parameter_count {
                if params.len() > max {
                    return Some(format!("too many parameters: {}", params.len()));
                }
            }
            for param in &params {
                let value = param.splitn(2, |&b| b == b'=').nth(1).unwrap_or(param);
                if let Some(max) = self.max_parameter_length {
                    if value.len() > max {
                        return Some(format!("parameter too long: {}", value.len()));
                    }
                }
                if self.reject_nonprintable
                    && value.iter().any(|&b| !(0x20..=0x7e).contains(&b) && b != b'\t')
                {
                    return Some("non-printable byte in parameter".into());
                }
            }
        }

        let user_agent = self
            .user_agent_re
            .captures(chunk)
            .and_then(|c| c.get(1))
            .map(|m| m.as_bytes().to_vec())
            .unwrap_or_default();
        if !self.ua_allowlist.is_empty()
            && !self.ua_allowlist.iter().any(|re| re.is_match(&user_agent))
        {
            return Some(format!(
                "User-Agent not allowlisted: {}",
                String::from_utf8_lossy(&user_agent)
            ));
        }
        if self.ua_denylist.iter().any(|re| re.is_match(&user_agent)) {
            return Some(format!(
                "User-Agent denylisted: {}",
                String::from_utf8_lossy(&user_agent)
            ));
        }

        if !self.allowed_encodings.is_empty() {
            if let Some(header) = self
                .accept_encoding_re
                .captures(chunk)
                .and_then(|c| c.get(1))
            {
                for coding in String::from_utf8_lossy(header.as_bytes()).split(',') {
                    // Strip quality parameters like "gzip;q=0.8".
                    let coding = coding
                        .split(';')
                        .next()
                        .unwrap_or("")
                        .trim()
                        .to_ascii_lowercase();
                    if coding.is_empty() {
                        continue;
                    }
                    if !self.allowed_encodings.contains(&coding) {
                        return Some(format!("encoding '{coding}' not allowed"));
                    }
                }
            }
        }

        None
    }
}

impl ChunkFilter for RequestGuards {
    fn name(&self) -> &'static str {
        "request-guards"
    }

    fn apply(&self, input: &FilterInput<'_>) -> std::result::Result<FilterVerdict, FilterError> {
        if input.direction != Direction::ClientToServer {
            return Ok(FilterVerdict::Pass);
        }
        match self.violation(input.chunk) {
            None => Ok(FilterVerdict::Pass),
            Some(reason) => Ok(punish(
                input,
                &self.cookie_re,
                self.block,
                self.name(),
                &reason,
            )),
        }
    }
}

/// More than one flag in a single response is treated as exfiltration
/// in bulk; the event is logged loudly. Redaction itself is left to the
/// chain's final redactor.
pub struct DuplicateFlagFilter {
    pattern: Regex,
}

impl DuplicateFlagFilter {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

impl ChunkFilter for DuplicateFlagFilter {
    fn name(&self) -> &'static str {
        "duplicate-flags"
    }

    fn apply(&self, input: &FilterInput<'_>) -> std::result::Result<FilterVerdict, FilterError> {
        if input.direction != Direction::ServerToClient {
            return Ok(FilterVerdict::Pass);
        }
        let count = self.pattern.find_iter(input.chunk).count();
        if count > 1 {
            warn!(
                conn_id = %input.conn_id,
                count = count,
                "multiple flags in one response"
            );
        }
        Ok(FilterVerdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SessionCache;
    use crate::history::History;
    use std::time::Duration;

    fn input<'a>(
        chunk: &'a [u8],
        histories: &'a (History, History),
        sessions: &'a SessionCache,
    ) -> FilterInput<'a> {
        FilterInput {
            direction: Direction::ClientToServer,
            chunk,
            client_history: &histories.0,
            server_history: &histories.1,
            conn_id: "10.0.0.9:5555",
            sessions,
            is_http: true,
        }
    }

    #[test]
    fn suspicious_request_marks_session() {
        let filter = SuspicionFilter::new(&["evilbanana".into()], "session", false).unwrap();
        let histories = (History::new(1024), History::new(1024));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"GET /?q=evilbanana HTTP/1.1\r\nCookie: session=tok1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));
        assert!(sessions.is_compromised("tok1"));
    }

    #[test]
    fn suspicious_request_closes_in_block_mode() {
        let filter = SuspicionFilter::new(&["evil".into()], "session", true).unwrap();
        let histories = (History::new(1024), History::new(1024));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"GET /?q=evil HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));
    }

    #[test]
    fn history_lookback_catches_earlier_payload() {
        let filter = SuspicionFilter::new(&["evil".into()], "session", true).unwrap();
        let mut client_history = History::new(1024);
        client_history.push(b"GET /?q=evil HTTP/1.1\r\n\r\n");
        let histories = (client_history, History::new(1024));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"GET /innocent HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));
    }

    fn guards(cfg: GuardConfig, block: bool) -> RequestGuards {
        RequestGuards::new(&cfg, "session", block).unwrap()
    }

    #[test]
    fn disallowed_method_flagged() {
        let filter = guards(
            GuardConfig {
                allowed_methods: vec!["GET".into(), "POST".into()],
                ..Default::default()
            },
            true,
        );
        let histories = (History::new(64), History::new(64));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"TRACE / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));

        let chunk = b"GET / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));
    }

    #[test]
    fn parameter_limits_enforced() {
        let filter = guards(
            GuardConfig {
                max_parameter_count: Some(2),
                max_parameter_length: Some(5),
                ..Default::default()
            },
            true,
        );
        let histories = (History::new(64), History::new(64));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"GET /?a=1&b=2&c=3 HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));

        let chunk = b"GET /?a=123456 HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));

        let chunk = b"GET /?a=123&b=45 HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));
    }

    #[test]
    fn user_agent_lists_enforced() {
        let filter = guards(
            GuardConfig {
                user_agent_allowlist: vec!["CHECKER".into()],
                user_agent_denylist: vec!["curl".into()],
                ..Default::default()
            },
            true,
        );
        let histories = (History::new(64), History::new(64));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"GET / HTTP/1.1\r\nUser-Agent: CHECKER/1.0\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));

        let chunk = b"GET / HTTP/1.1\r\nUser-Agent: curl/8.0\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));

        let chunk = b"GET / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));
    }

    #[test]
    fn encoding_allowlist_enforced() {
        let filter = guards(
            GuardConfig {
                allowed_encodings: vec!["gzip".into(), "identity".into()],
                ..Default::default()
            },
            true,
        );
        let histories = (History::new(64), History::new(64));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"GET / HTTP/1.1\r\nAccept-Encoding: gzip, identity;q=0.5\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));

        let chunk = b"GET / HTTP/1.1\r\nAccept-Encoding: br\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Close
        ));

        // No header at all is fine.
        let chunk = b"GET / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));
    }

    #[test]
    fn non_request_chunks_pass() {
        let filter = guards(
            GuardConfig {
                allowed_methods: vec!["GET".into()],
                ..Default::default()
            },
            true,
        );
        let histories = (History::new(64), History::new(64));
        let sessions = SessionCache::with_ttl(Duration::from_secs(30), 100);

        let chunk = b"\x01\x02binary protocol bytes";
        assert!(matches!(
            filter.apply(&input(chunk, &histories, &sessions)).unwrap(),
            FilterVerdict::Pass
        ));
    }
}
