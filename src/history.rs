//! Per-direction bounded byte log backing look-back filters.
//!
//! Bytes past the cap are still relayed, just no longer retained for
//! pattern matching.

#[derive(Debug)]
pub struct History {
    data: Vec<u8>,
    cap: usize,
    /// Total bytes offered, including those dropped at the cap.
    total: u64,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if self.data.len() >= self.cap {
            return;
        }
        let room = self.cap - self.data.len();
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn total_seen(&self) -> u64 {
        self.total
    }
}
