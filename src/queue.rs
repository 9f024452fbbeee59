//! The outbound input queue.
//!
//! The worker strand produces, the reactor strand consumes; the session
//! mutex serialises both sides. In `char` and `echo` modes a queued chunk is
//! split into single characters so the reactor can meter them out.

use crate::options::InputMode;
use std::collections::VecDeque;

/// FIFO of byte chunks waiting to be written to the transport.
#[derive(Debug)]
pub struct InputQueue {
    mode: InputMode,
    chunks: VecDeque<Vec<u8>>,
}

impl InputQueue {
    #[must_use]
    pub fn new(mode: InputMode) -> Self {
        Self {
            mode,
            chunks: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Queue text for the remote shell, split per the input mode.
    pub fn queue(&mut self, data: &str) {
        match self.mode {
            InputMode::None => self.chunks.push_back(data.as_bytes().to_vec()),
            InputMode::Char | InputMode::Echo => {
                for ch in data.chars() {
                    let mut buf = [0u8; 4];
                    self.chunks
                        .push_back(ch.encode_utf8(&mut buf).as_bytes().to_vec());
                }
            }
        }
    }

    /// Take the next chunk to write, if any.
    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        self.chunks.pop_front()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Drop everything still pending.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_chunks_in_default_mode() {
        let mut q = InputQueue::new(InputMode::None);
        q.queue("ls -al\n");
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap(), b"ls -al\n");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_char_mode_splits() {
        let mut q = InputQueue::new(InputMode::Char);
        q.queue("ab\n");
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue().unwrap(), b"a");
        assert_eq!(q.dequeue().unwrap(), b"b");
        assert_eq!(q.dequeue().unwrap(), b"\n");
    }

    #[test]
    fn test_char_mode_keeps_utf8_whole() {
        let mut q = InputQueue::new(InputMode::Echo);
        q.queue("é");
        let chunk = q.dequeue().unwrap();
        assert_eq!(chunk, "é".as_bytes());
    }

    #[test]
    fn test_fifo_order() {
        let mut q = InputQueue::new(InputMode::None);
        q.queue("first");
        q.queue("second");
        assert_eq!(q.dequeue().unwrap(), b"first");
        assert_eq!(q.dequeue().unwrap(), b"second");
    }
}
