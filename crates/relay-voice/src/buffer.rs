//! Inbound audio aggregation.
//!
//! Telephony transports deliver audio in 20 ms chunks, far smaller than a
//! transcription provider wants per message. The buffer accumulates chunks
//! in arrival order and releases them as one frame once a threshold is met.

use relay_types::AudioFormat;
use std::time::Duration;

/// Accumulates raw audio bytes into frames of at least `threshold` bytes.
///
/// A push that reaches the threshold returns everything accumulated so far,
/// including bytes beyond the threshold, so frames are "at least threshold"
/// rather than exactly threshold. Bytes left over when the session ends are
/// never emitted.
#[derive(Debug)]
pub struct AudioFrameBuffer {
    threshold: usize,
    pending: Vec<u8>,
}

impl AudioFrameBuffer {
    /// Creates a buffer releasing frames of at least `threshold` bytes.
    ///
    /// A zero threshold is treated as one byte, so every push is released.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            pending: Vec::with_capacity(threshold),
        }
    }

    /// Creates a buffer sized for `frame` worth of audio in `format`.
    pub fn for_duration(format: &AudioFormat, frame: Duration) -> Self {
        Self::new(format.bytes_for(frame))
    }

    /// Appends `chunk` and returns a frame if the threshold was reached.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() >= self.threshold {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.threshold),
            ))
        } else {
            None
        }
    }

    /// Drops any undersized remainder, returning how many bytes were lost.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
