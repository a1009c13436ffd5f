//! HTTP/1.x reframing: reassembles chunk-boundary-agnostic TCP data
//! into whole request/response messages so filters see structured
//! units instead of fragments.
//!
//! Degradation contract: anything that fails to parse, or that
//! outgrows the buffer without completing, is flushed through
//! unmodified. A parsing bug must never drop bytes or kill the
//! connection.

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Upper bound on buffered bytes while waiting for a message to
/// complete; beyond this the buffer is flushed raw.
pub const MAX_BUFFERED: usize = 256 * 1024;

fn start_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Z]+ \S+ HTTP/\d(?:\.\d)?|HTTP/\d(?:\.\d)? \d{3}[^\r\n]*)$").unwrap()
    })
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^:\r\n]+): *([^\r\n]*)$").unwrap())
}

pub enum Reframed {
    /// One or more complete messages, canonically re-serialized.
    Messages(Vec<Bytes>),
    /// Unparseable or oversized data, flushed through as-is.
    Passthrough(Bytes),
    /// Waiting for more bytes.
    Pending,
}

enum Extract {
    Message(Bytes),
    Incomplete,
    Malformed(&'static str),
}

/// One per direction per connection; exclusively owned by its handler.
pub struct Reframer {
    buf: BytesMut,
    limit: usize,
}

impl Reframer {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFERED)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8], conn_id: &str) -> Reframed {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            match self.try_extract() {
                Extract::Message(msg) => messages.push(msg),
                Extract::Incomplete => break,
                Extract::Malformed(reason) => {
                    debug!(
                        conn_id = %conn_id,
                        reason = reason,
                        buffered = self.buf.len(),
                        "malformed HTTP framing; passing through raw"
                    );
                    let raw = self.buf.split().freeze();
                    return if messages.is_empty() {
                        Reframed::Passthrough(raw)
                    } else {
                        messages.push(raw);
                        Reframed::Messages(messages)
                    };
                }
            }
        }

        if !messages.is_empty() {
            return Reframed::Messages(messages);
        }
        if self.buf.len() > self.limit {
            debug!(
                conn_id = %conn_id,
                buffered = self.buf.len(),
                "reframe buffer overflow; passing through raw"
            );
            return Reframed::Passthrough(self.buf.split().freeze());
        }
        Reframed::Pending
    }

    /// Flush whatever is still buffered, unparsed.
    pub fn drain(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    fn try_extract(&mut self) -> Extract {
        let Some((head_len, sep_len)) = find_header_end(&self.buf) else {
            return Extract::Incomplete;
        };

        let head = &self.buf[..head_len];
        let mut lines = head.split(|&b| b == b'\n').map(|line| {
            line.strip_suffix(b"\r").unwrap_or(line)
        });

        let Some(start_line) = lines.next() else {
            return Extract::Malformed("empty head");
        };
        if !start_line_re().is_match(start_line) {
            return Extract::Malformed("bad start line");
        }
        let start_line = start_line.to_vec();

        let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut content_length = 0usize;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some(caps) = header_re().captures(line) else {
                return Extract::Malformed("bad header line");
            };
            let name = caps.get(1).unwrap().as_bytes().to_vec();
            let value = caps.get(2).unwrap().as_bytes().to_vec();
            if name.eq_ignore_ascii_case(b"content-length") {
                match std::str::from_utf8(&value).ok().and_then(|v| v.trim().parse().ok()) {
                    Some(len) => content_length = len,
                    None => return Extract::Malformed("bad content-length"),
                }
            }
            headers.push((name, value));
        }

        // Content-Length is attacker-controlled; an unchecked add here
        // would overflow on absurd values.
        let Some(total) = head_len
            .checked_add(sep_len)
            .and_then(|n| n.checked_add(content_length))
        else {
            return Extract::Malformed("bad content-length");
        };
        if self.buf.len() < total {
            return Extract::Incomplete;
        }

        let raw = self.buf.split_to(total);
        let body = &raw[head_len + sep_len..];

        let mut out = BytesMut::with_capacity(total + 16);
        out.extend_from_slice(&start_line);
        out.extend_from_slice(b"\r\n");
        for (name, value) in &headers {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        Extract::Message(out.freeze())
    }
}

impl Default for Reframer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}
