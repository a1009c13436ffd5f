//! Flag redaction: the canonical last-line-of-defense filter.

use super::{ChunkFilter, Direction, FilterInput, FilterVerdict};
use crate::error::FilterError;
use bytes::Bytes;
use regex::bytes::Regex;
use tracing::warn;

/// Canned response substituted for message-oriented traffic when the
/// proxy is configured to drop suspicious exchanges outright.
pub const BLOCK_RESPONSE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\
\r\n\
<!doctype html>\n\
<html lang=en>\n\
<title>500 Internal Server Error</title>\n\
<h1>Internal Server Error</h1>\n\
<p>The server encountered an internal error and was unable to complete your request.</p>";

pub struct FlagRedactor {
    pattern: Regex,
    replacement: Vec<u8>,
    block: bool,
}

impl FlagRedactor {
    pub fn new(pattern: Regex, replacement: Vec<u8>, block: bool) -> Self {
        Self {
            pattern,
            replacement,
            block,
        }
    }

    /// Replace every flag-shaped token, logging one event per match.
    /// Idempotent: the replacement never matches the pattern (enforced
    /// at context build time).
    pub fn scrub(&self, data: &[u8], conn_id: &str) -> Option<Bytes> {
        let matches = self.pattern.find_iter(data).count();
        if matches == 0 {
            return None;
        }
        for m in self.pattern.find_iter(data) {
            warn!(
                conn_id = %conn_id,
                flag = %String::from_utf8_lossy(m.as_bytes()),
                "redacted flag"
            );
        }
        let scrubbed = self
            .pattern
            .replace_all(data, self.replacement.as_slice())
            .into_owned();
        Some(Bytes::from(scrubbed))
    }
}

impl ChunkFilter for FlagRedactor {
    fn name(&self) -> &'static str {
        "flag-redactor"
    }

    fn apply(&self, input: &FilterInput<'_>) -> Result<FilterVerdict, FilterError> {
        if input.direction != Direction::ServerToClient {
            return Ok(FilterVerdict::Pass);
        }

        match self.scrub(input.chunk, input.conn_id) {
            None => Ok(FilterVerdict::Pass),
            Some(_) if self.block => {
                if input.is_http {
                    Ok(FilterVerdict::Replace(Bytes::from_static(BLOCK_RESPONSE)))
                } else {
                    Ok(FilterVerdict::Close)
                }
            }
            Some(scrubbed) => Ok(FilterVerdict::Replace(scrubbed)),
        }
    }
}
