//! Splits one utterance payload into fixed-size upload windows.

use bytes::Bytes;

/// One upload window. Slicing `Bytes` shares the payload allocation, so chunks are
/// cheap to create and can outlive the borrow of the original message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Zero-based position within the payload
    pub ordinal: usize,
    pub data: Bytes,
}

impl AudioChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazy iterator over contiguous, non-overlapping windows of a payload.
///
/// Cloning restarts nothing: a clone continues from the same position. Use
/// [`Chunker::restart`] for a fresh pass over the payload.
#[derive(Debug, Clone)]
pub struct Chunker {
    payload: Bytes,
    window: usize,
    offset: usize,
    ordinal: usize,
}

impl Chunker {
    /// A zero window is treated as one byte so the iterator always terminates.
    pub fn new(payload: Bytes, window: usize) -> Self {
        Self {
            payload,
            window: window.max(1),
            offset: 0,
            ordinal: 0,
        }
    }

    pub fn restart(&self) -> Self {
        Self::new(self.payload.clone(), self.window)
    }

    /// `ceil(payload / window)`
    pub fn chunk_count(&self) -> usize {
        self.payload.len().div_ceil(self.window)
    }
}

impl Iterator for Chunker {
    type Item = AudioChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let end = (self.offset + self.window).min(self.payload.len());
        let chunk = AudioChunk {
            ordinal: self.ordinal,
            data: self.payload.slice(self.offset..end),
        };
        self.offset = end;
        self.ordinal += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.payload.len() - self.offset).div_ceil(self.window);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunker {}
