//! Bounded buffers for terminal replay and daemon diagnostics.
//!
//! [`ReplayBuffer`] holds the most recent lines of pseudo-terminal output so a
//! client that attaches later can redraw the screen. [`StderrTail`] keeps the
//! last lines a daemon wrote to stderr for error reports. Both are built on the
//! generic line-count bounded [`RingBuffer`].

use std::collections::VecDeque;

// ============================================================================
// Constants
// ============================================================================

/// Default number of lines retained for replay.
pub const DEFAULT_REPLAY_LINES: usize = 10_000;

/// A partial line longer than this is stored as a line of its own.
///
/// Bounds memory when a program writes a long stream without newlines
/// (progress bars, binary output).
pub const MAX_PARTIAL_LINE_BYTES: usize = 64 * 1024;

/// Default number of stderr lines retained.
pub const DEFAULT_STDERR_LINES: usize = 500;

/// Maximum characters kept per stderr line.
pub const MAX_STDERR_LINE_CHARS: usize = 10_000;

// ============================================================================
// RingBuffer
// ============================================================================

/// A fixed-capacity FIFO that evicts the oldest item when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> RingBuffer<T> {
    /// Creates a buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Appends an item, evicting the oldest if the buffer is full.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
            self.evicted += 1;
        }
        self.items.push_back(item);
    }

    /// Items in insertion order, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ============================================================================
// ReplayBuffer
// ============================================================================

/// Line-bounded store of raw terminal output.
///
/// Output is split on `\n`; each stored line keeps its terminator so the
/// snapshot is byte-identical to what the terminal produced. Bytes after the
/// last newline are held as a partial line and included in snapshots.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    lines: RingBuffer<Vec<u8>>,
    partial: Vec<u8>,
}

impl ReplayBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: RingBuffer::new(max_lines),
            partial: Vec::new(),
        }
    }

    /// Appends a chunk of terminal output.
    pub fn push(&mut self, mut chunk: &[u8]) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let (head, rest) = chunk.split_at(pos + 1);
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(head);
            self.lines.push(line);
            chunk = rest;
        }

        self.partial.extend_from_slice(chunk);
        while self.partial.len() > MAX_PARTIAL_LINE_BYTES {
            let rest = self.partial.split_off(MAX_PARTIAL_LINE_BYTES);
            let line = std::mem::replace(&mut self.partial, rest);
            self.lines.push(line);
        }
    }

    /// All retained output, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for line in self.lines.iter() {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(&self.partial);
        out
    }

    /// The newest retained output, at most `max_bytes` long.
    ///
    /// Whole lines are dropped from the front first; if the newest line alone
    /// exceeds the limit its tail is kept.
    pub fn snapshot_tail(&self, max_bytes: usize) -> Vec<u8> {
        if self.byte_len() <= max_bytes {
            return self.snapshot();
        }

        let mut budget = max_bytes;
        let mut parts: Vec<&[u8]> = Vec::new();

        let newest = std::iter::once(self.partial.as_slice())
            .filter(|p| !p.is_empty())
            .chain(self.lines.iter().rev().map(Vec::as_slice));
        for part in newest {
            if part.len() <= budget {
                budget -= part.len();
                parts.push(part);
            } else {
                if let Some(tail) = part.get(part.len() - budget..) {
                    if !tail.is_empty() {
                        parts.push(tail);
                    }
                }
                break;
            }
        }

        let mut out = Vec::with_capacity(max_bytes - budget);
        for part in parts.iter().rev() {
            out.extend_from_slice(part);
        }
        out
    }

    /// Number of complete lines retained.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Total bytes retained, including the partial line.
    pub fn byte_len(&self) -> usize {
        self.lines.iter().map(Vec::len).sum::<usize>() + self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_LINES)
    }
}

// ============================================================================
// StderrTail
// ============================================================================

/// Last lines of a daemon's stderr, decoded lossily.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: RingBuffer<String>,
    partial: Vec<u8>,
}

impl StderrTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: RingBuffer::new(max_lines),
            partial: Vec::new(),
        }
    }

    /// Appends raw stderr bytes.
    pub fn push(&mut self, mut chunk: &[u8]) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let (head, rest) = chunk.split_at(pos);
            self.partial.extend_from_slice(head);
            let raw = std::mem::take(&mut self.partial);
            self.push_line(&raw);
            chunk = rest.get(1..).unwrap_or_default();
        }
        self.partial.extend_from_slice(chunk);

        // A partial that already exceeds the character cap cannot grow into
        // anything more useful; flush it.
        if self.partial.len() > MAX_STDERR_LINE_CHARS * 4 {
            let raw = std::mem::take(&mut self.partial);
            self.push_line(&raw);
        }
    }

    /// Appends a single line (no terminator).
    pub fn push_line(&mut self, raw: &[u8]) {
        let decoded = String::from_utf8_lossy(raw);
        let text: &str = &decoded;
        let text = text.strip_suffix('\r').unwrap_or(text);
        let line = match text.char_indices().nth(MAX_STDERR_LINE_CHARS) {
            Some((idx, _)) => text.get(..idx).unwrap_or(text).to_string(),
            None => text.to_string(),
        };
        self.lines.push(line);
    }

    /// Retained lines plus any unterminated trailing text.
    pub fn lines(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            let mut tail = Self::new(1);
            tail.push_line(&self.partial);
            out.extend(tail.lines.iter().cloned());
        }
        out
    }

    /// Retained text joined with newlines.
    pub fn render(&self) -> String {
        self.lines().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::new(DEFAULT_STDERR_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(i);
        }
        assert_eq!(rb.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(rb.evicted(), 2);
    }

    #[test]
    fn test_ring_buffer_zero_capacity() {
        let mut rb = RingBuffer::new(0);
        rb.push("x");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_replay_keeps_partial_line() {
        let mut rb = ReplayBuffer::new(10);
        rb.push(b"hel");
        rb.push(b"lo\nwor");
        assert_eq!(rb.line_count(), 1);
        assert_eq!(rb.snapshot(), b"hello\nwor");
    }

    #[test]
    fn test_replay_is_line_bounded() {
        let mut rb = ReplayBuffer::new(DEFAULT_REPLAY_LINES);
        for i in 0..11_000 {
            rb.push(format!("line {i}\n").as_bytes());
        }
        assert_eq!(rb.line_count(), DEFAULT_REPLAY_LINES);
        let snap = String::from_utf8(rb.snapshot()).unwrap();
        assert!(snap.starts_with("line 1000\n"));
        assert!(snap.ends_with("line 10999\n"));
        assert!(!snap.contains("line 999\n"));
    }

    #[test]
    fn test_replay_splits_overlong_partial() {
        let mut rb = ReplayBuffer::new(4);
        rb.push(&vec![b'x'; MAX_PARTIAL_LINE_BYTES * 2 + 10]);
        assert_eq!(rb.line_count(), 2);
        assert_eq!(rb.byte_len(), MAX_PARTIAL_LINE_BYTES * 2 + 10);
    }

    #[test]
    fn test_snapshot_tail_keeps_newest_bytes() {
        let mut rb = ReplayBuffer::new(100);
        rb.push(b"aaaa\nbbbb\ncc");
        assert_eq!(rb.snapshot_tail(100), b"aaaa\nbbbb\ncc");
        assert_eq!(rb.snapshot_tail(7), b"bbbb\ncc");
        assert_eq!(rb.snapshot_tail(9), b"a\nbbbb\ncc");
        assert_eq!(rb.snapshot_tail(1), b"c");
        assert!(rb.snapshot_tail(0).is_empty());
    }

    #[test]
    fn test_stderr_tail_lossy_and_truncated() {
        let mut tail = StderrTail::new(2);
        tail.push(b"first\n");
        tail.push(&[0x66, 0xff, 0x6f, b'\n']);
        tail.push("y".repeat(MAX_STDERR_LINE_CHARS + 50).as_bytes());
        tail.push(b"\n");

        let lines = tail.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "f\u{FFFD}o");
        assert_eq!(lines[1].chars().count(), MAX_STDERR_LINE_CHARS);
    }

    #[test]
    fn test_stderr_tail_render_includes_partial() {
        let mut tail = StderrTail::default();
        tail.push(b"error: boom\r\nwhile spawning");
        assert_eq!(tail.render(), "error: boom\nwhile spawning");
    }
}
