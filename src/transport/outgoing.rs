//! FIFO of encoded frames waiting to be written.
//!
//! The head entry carries a byte offset so a partial write resumes exactly
//! where the previous one stopped. Entries are popped only once fully written,
//! so bytes of two frames are never interleaved.

use std::collections::VecDeque;

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct OutgoingQueue {
    frames: VecDeque<Bytes>,
    offset: usize,
    queued_bytes: usize,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already-encoded frame
    pub fn push(&mut self, frame: Bytes) {
        self.queued_bytes += frame.len();
        self.frames.push_back(frame);
    }

    /// Unwritten remainder of the head frame
    pub fn pending(&self) -> Option<Bytes> {
        self.frames.front().map(|head| head.slice(self.offset..))
    }

    /// Record `written` bytes of the head frame as sent.
    ///
    /// Returns the frame's full length when this completes it.
    pub fn advance(&mut self, written: usize) -> Option<usize> {
        let head_len = self.frames.front()?.len();
        debug_assert!(self.offset + written <= head_len);

        self.offset = (self.offset + written).min(head_len);
        self.queued_bytes = self.queued_bytes.saturating_sub(written);

        if self.offset < head_len {
            return None;
        }
        self.frames.pop_front();
        self.offset = 0;
        Some(head_len)
    }

    /// Frames not yet fully written, the partially written head included
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Bytes still to be written
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Drop everything, returning how many frames were discarded
    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        self.offset = 0;
        self.queued_bytes = 0;
        dropped
    }
}
