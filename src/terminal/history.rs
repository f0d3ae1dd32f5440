//! Bounded terminal output history and UTF-8 chunk framing.

use std::collections::VecDeque;

use bytes::Bytes;

/// Recent PTY output, capped at `limit` bytes. Whole chunks are evicted from
/// the front; a single chunk larger than the cap keeps only its tail.
#[derive(Debug, Clone)]
pub struct OutputHistory {
    chunks: VecDeque<Bytes>,
    total: usize,
    limit: usize,
}

impl OutputHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() || self.limit == 0 {
            return;
        }
        if chunk.len() >= self.limit {
            self.chunks.clear();
            let start = char_boundary_at_or_after(&chunk, chunk.len() - self.limit);
            let tail = chunk.slice(start..);
            self.total = tail.len();
            self.chunks.push_back(tail);
            return;
        }

        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > self.limit {
            match self.chunks.pop_front() {
                Some(evicted) => self.total -= evicted.len(),
                None => break,
            }
        }
    }

    /// Everything retained, oldest first.
    pub fn replay(&self) -> String {
        let mut bytes = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            bytes.extend_from_slice(chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}

fn char_boundary_at_or_after(bytes: &[u8], mut index: usize) -> usize {
    while index < bytes.len() && (bytes[index] & 0b1100_0000) == 0b1000_0000 {
        index += 1;
    }
    index
}

/// Splits a byte stream into valid UTF-8 strings, holding back an incomplete
/// trailing sequence until the next chunk arrives.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                    }
                }
            }
        }
        out
    }

    /// Whatever is still held back, lossily decoded.
    pub fn flush(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}
