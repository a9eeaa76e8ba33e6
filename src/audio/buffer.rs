//! # Inbound Audio Buffer
//!
//! Accumulates the decoded payloads of `userStream.chunk` messages between
//! `userStream.start` and `userStream.stop`.
//!
//! ## Key Features:
//! - **Single buffer per conversation**: chunks are appended in arrival order
//! - **Atomic take**: [`InboundAudioBuffer::take`] returns everything collected so far and
//!   leaves the buffer empty under one lock, so two flushers can never send the same bytes
//! - **Thread safety**: shared between the protocol loop and the echo flush timer

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::time::Duration;

use super::bytes_per_second;

/// Growing byte buffer for one inbound user stream.
#[derive(Debug, Default)]
pub struct InboundAudioBuffer {
    data: Mutex<BytesMut>,
}

impl InboundAudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decoded chunk.
    pub fn append(&self, chunk: &[u8]) {
        self.data.lock().extend_from_slice(chunk);
    }

    /// Remove and return everything accumulated so far.
    ///
    /// An empty result means no audio arrived since the last take.
    pub fn take(&self) -> Bytes {
        self.data.lock().split().freeze()
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Play time of the buffered audio for `media_format`, when the format is known.
    pub fn duration(&self, media_format: &str) -> Option<Duration> {
        let rate = bytes_per_second(media_format)?;
        Some(Duration::from_secs_f64(self.len() as f64 / rate as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let buffer = InboundAudioBuffer::new();
        buffer.append(&[1, 2]);
        buffer.append(&[3]);
        buffer.append(&[4, 5, 6]);

        assert_eq!(buffer.len(), 6);
        assert_eq!(&buffer.take()[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_take_clears_buffer() {
        let buffer = InboundAudioBuffer::new();
        buffer.append(&[9; 10]);

        assert_eq!(buffer.take().len(), 10);
        assert!(buffer.is_empty());
        assert!(buffer.take().is_empty());

        buffer.append(&[7]);
        assert_eq!(&buffer.take()[..], &[7]);
    }

    #[test]
    fn test_duration_for_lpcm16() {
        let buffer = InboundAudioBuffer::new();
        buffer.append(&vec![0u8; 32_000]);
        assert_eq!(buffer.duration("raw/lpcm16"), Some(Duration::from_secs(1)));
        assert_eq!(buffer.duration("audio/opus"), None);
    }
}
