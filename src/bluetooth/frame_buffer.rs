// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Receive buffer with delimiter-based extraction.

use tracing::debug;

/// Accumulates bytes read from the remote device.
///
/// Bytes are appended at the tail and consumed from the head, either all at
/// once or up to and including a delimiter. Nothing is dropped except through
/// [`FrameBuffer::clear`].
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Append bytes to the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        debug!(
            "Buffered {} bytes ({} available)",
            bytes.len(),
            self.buffer.len()
        );
    }

    /// Number of buffered bytes.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Take the whole buffer.
    pub fn read_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Take everything up to and including the first `delimiter`.
    ///
    /// Returns an empty vector and leaves the buffer untouched when the
    /// delimiter is absent. An empty delimiter never matches.
    pub fn read_until(&mut self, delimiter: &[u8]) -> Vec<u8> {
        match self.find(delimiter) {
            Some(index) => {
                let end = index + delimiter.len();
                let rest = self.buffer.split_off(end);
                std::mem::replace(&mut self.buffer, rest)
            }
            None => Vec::new(),
        }
    }

    /// Take every complete frame currently buffered, in order.
    pub fn drain_frames(&mut self, delimiter: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            let frame = self.read_until(delimiter);
            if frame.is_empty() {
                break;
            }
            frames.push(frame);
        }
        frames
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn find(&self, delimiter: &[u8]) -> Option<usize> {
        if delimiter.is_empty() || delimiter.len() > self.buffer.len() {
            return None;
        }
        self.buffer
            .windows(delimiter.len())
            .position(|window| window == delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_until_keeps_partial_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"AT\r\n");
        buffer.append(b"OK\r");

        assert_eq!(buffer.read_until(b"\r\n"), b"AT\r\n".to_vec());
        assert_eq!(buffer.available(), 3);

        assert!(buffer.read_until(b"\r\n").is_empty());
        assert_eq!(buffer.read_all(), b"OK\r".to_vec());
    }

    #[test]
    fn test_empty_delimiter_never_matches() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"hello");

        assert!(buffer.read_until(b"").is_empty());
        assert!(buffer.drain_frames(b"").is_empty());
        assert_eq!(buffer.available(), 5);
    }

    #[test]
    fn test_delimiter_split_across_appends() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"abc\r");
        assert!(buffer.read_until(b"\r\n").is_empty());

        buffer.append(b"\ndef");
        assert_eq!(buffer.read_until(b"\r\n"), b"abc\r\n".to_vec());
        assert_eq!(buffer.read_all(), b"def".to_vec());
    }

    #[test]
    fn test_drain_frames_in_order() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"one\ntwo\nthr");

        let frames = buffer.drain_frames(b"\n");
        assert_eq!(frames, vec![b"one\n".to_vec(), b"two\n".to_vec()]);
        assert_eq!(buffer.read_all(), b"thr".to_vec());
    }

    #[test]
    fn test_read_all_empties_buffer() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.read_all().is_empty());

        buffer.append(b"xyz");
        assert_eq!(buffer.read_all(), b"xyz".to_vec());
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"garbage\n");
        buffer.clear();
        assert_eq!(buffer.available(), 0);
        assert!(buffer.read_until(b"\n").is_empty());
    }

    #[test]
    fn test_consumed_bytes_preserve_stream_order() {
        let chunks: [&[u8]; 5] = [b"a;b", b"c;", b";;d", b"ef", b";g"];
        let delimiter = b";";

        let mut buffer = FrameBuffer::new();
        let mut consumed = Vec::new();
        for chunk in chunks {
            buffer.append(chunk);
            for frame in buffer.drain_frames(delimiter) {
                assert!(frame.ends_with(delimiter));
                consumed.extend_from_slice(&frame);
            }
        }

        let appended: Vec<u8> = chunks.concat();
        let remaining = buffer.read_all();
        assert_eq!(remaining, b"g".to_vec());
        assert_eq!([consumed, remaining].concat(), appended);
    }

    fn first_match(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    // A small alphabet so that multi-byte delimiters actually occur.
    proptest! {
        #[test]
        fn prop_frames_preserve_appended_bytes(
            chunks in prop::collection::vec(prop::collection::vec(0u8..4, 0..24), 0..16),
            delimiter in prop::collection::vec(0u8..4, 0..4),
        ) {
            let mut buffer = FrameBuffer::new();
            let mut consumed = Vec::new();
            for chunk in &chunks {
                buffer.append(chunk);
                for frame in buffer.drain_frames(&delimiter) {
                    prop_assert!(!delimiter.is_empty());
                    prop_assert!(frame.ends_with(&delimiter));
                    // The frame stops at the first delimiter.
                    prop_assert_eq!(
                        first_match(&frame, &delimiter),
                        Some(frame.len() - delimiter.len())
                    );
                    consumed.extend_from_slice(&frame);
                }
            }

            let remaining = buffer.read_all();
            if !delimiter.is_empty() {
                prop_assert_eq!(first_match(&remaining, &delimiter), None);
            }
            consumed.extend_from_slice(&remaining);
            prop_assert_eq!(consumed, chunks.concat());
        }

        #[test]
        fn prop_read_until_takes_one_frame(
            chunks in prop::collection::vec(prop::collection::vec(0u8..4, 0..24), 0..16),
            delimiter in prop::collection::vec(0u8..4, 1..4),
        ) {
            let mut buffer = FrameBuffer::new();
            let mut consumed = Vec::new();
            for chunk in &chunks {
                buffer.append(chunk);
                let frame = buffer.read_until(&delimiter);
                if !frame.is_empty() {
                    prop_assert!(frame.ends_with(&delimiter));
                }
                consumed.extend_from_slice(&frame);
            }

            consumed.extend_from_slice(&buffer.read_all());
            prop_assert_eq!(consumed, chunks.concat());
        }
    }

    #[test]
    fn test_multibyte_delimiter_overlap() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"x||y|||z");

        assert_eq!(buffer.read_until(b"||"), b"x||".to_vec());
        assert_eq!(buffer.read_until(b"||"), b"y||".to_vec());
        assert_eq!(buffer.read_all(), b"|z".to_vec());
    }
}
