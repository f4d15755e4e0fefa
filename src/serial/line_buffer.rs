/// Carriage return, the line terminator on the serial link
pub const LINE_TERMINATOR: u8 = 13;

/// Default capacity, terminator slot included
pub const INPUT_BUFFER_SIZE: usize = 64;

/// Result of feeding one byte into a [`LineBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Byte stored, no complete line yet
    Continue,
    /// Terminator seen; carries the accumulated bytes without the terminator
    LineReady(Vec<u8>),
    /// Capacity reached without a terminator; content discarded
    Overflow,
}

/// Fixed-capacity accumulator for one serial command line.
///
/// At most `capacity - 1` content bytes are held so the storage is always
/// NUL-terminated. A byte that would fill the last slot without being the
/// terminator discards the line.
pub struct LineBuffer {
    data: Vec<u8>,
    len: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        // A zero-capacity buffer can never produce a line
        let capacity = capacity.max(1);
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// Appends one byte. Never blocks.
    pub fn push(&mut self, byte: u8) -> LineEvent {
        if byte == LINE_TERMINATOR {
            let line = self.data[..self.len].to_vec();
            self.reset();
            return LineEvent::LineReady(line);
        }

        self.data[self.len] = byte;
        self.len += 1;

        if self.len >= self.data.len() {
            self.reset();
            return LineEvent::Overflow;
        }

        LineEvent::Continue
    }

    /// Accumulated bytes followed by the NUL terminator
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data[..=self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Zero-fills the storage and drops any partial line
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(INPUT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buffer: &mut LineBuffer, bytes: &[u8]) -> Vec<LineEvent> {
        bytes.iter().map(|&b| buffer.push(b)).collect()
    }

    #[test]
    fn test_line_ready_excludes_terminator() {
        let mut buffer = LineBuffer::default();
        let events = feed(&mut buffer, b"1,2,3\r");

        assert!(events[..5].iter().all(|e| *e == LineEvent::Continue));
        assert_eq!(events[5], LineEvent::LineReady(b"1,2,3".to_vec()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_line() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(LINE_TERMINATOR), LineEvent::LineReady(Vec::new()));
    }

    #[test]
    fn test_overflow_resets_to_empty() {
        let mut buffer = LineBuffer::default();
        let events = feed(&mut buffer, &[b'9'; INPUT_BUFFER_SIZE]);

        // The 64th byte fills the terminator slot
        assert_eq!(events[INPUT_BUFFER_SIZE - 1], LineEvent::Overflow);
        assert!(events[..INPUT_BUFFER_SIZE - 1].iter().all(|e| *e == LineEvent::Continue));
        assert!(buffer.is_empty());
        assert!(buffer.as_bytes_with_nul().iter().all(|&b| b == 0));

        // Next line starts clean
        let events = feed(&mut buffer, b"7\r");
        assert_eq!(events[1], LineEvent::LineReady(b"7".to_vec()));
    }

    #[test]
    fn test_longest_accepted_line() {
        let mut buffer = LineBuffer::default();
        let body = vec![b'1'; INPUT_BUFFER_SIZE - 1];
        let events = feed(&mut buffer, &body);
        assert!(events.iter().all(|e| *e == LineEvent::Continue));
        assert_eq!(buffer.len(), INPUT_BUFFER_SIZE - 1);
        assert_eq!(buffer.push(LINE_TERMINATOR), LineEvent::LineReady(body));
    }

    #[test]
    fn test_always_nul_terminated() {
        let mut buffer = LineBuffer::new(8);
        for &b in b"abcdef" {
            buffer.push(b);
            let with_nul = buffer.as_bytes_with_nul();
            assert_eq!(*with_nul.last().unwrap(), 0);
            assert!(buffer.len() < buffer.capacity());
        }
    }
}
