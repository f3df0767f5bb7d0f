//! Output retained for an inactive tab
//!
//! A byte ring: once `capacity` is reached the oldest bytes are dropped.
//! After a drop the front is advanced to the next UTF-8 character start so a
//! replay never begins in the middle of a character.

use std::collections::VecDeque;

/// Longest run of continuation bytes a UTF-8 character can have
const MAX_CONTINUATION: usize = 3;

pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append, dropping the oldest bytes when full
    pub fn push(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive
        let (bytes, mut dropped) = if bytes.len() > self.capacity {
            self.data.clear();
            (&bytes[bytes.len() - self.capacity..], true)
        } else {
            (bytes, false)
        };

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
            dropped = true;
        }
        self.data.extend(bytes);

        if dropped {
            self.skip_partial_char();
        }
    }

    fn skip_partial_char(&mut self) {
        for _ in 0..MAX_CONTINUATION {
            match self.data.front() {
                Some(byte) if byte & 0b1100_0000 == 0b1000_0000 => {
                    self.data.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Drain everything retained so far
    pub fn take(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }
}
