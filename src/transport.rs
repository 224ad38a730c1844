//! Transport capability-set abstraction (§9): the core never touches a
//! socket or TLS directly, only a producer-owned send buffer. A
//! process-level JSON-lines transport backs the standalone binary; tests
//! use an in-memory buffer.

use std::io::Write;

/// Producer-owned writable view with backpressure: `get` may return
/// `None` when the underlying sink has no room, and the caller must retry
/// later rather than block.
pub trait SendBuf {
    fn get(&mut self, min_size: usize) -> Option<&mut [u8]>;
    fn commit_text(&mut self, len: usize);
    fn commit_binary(&mut self, len: usize);
}

/// Writes each committed message as one line of JSON to a `Write` sink —
/// the degenerate "transport" used when no real WebSocket is wired up
/// (the standalone binary's default, and test harnesses).
pub struct LineJsonTransport<W: Write> {
    sink: W,
    scratch: Vec<u8>,
}

impl<W: Write> LineJsonTransport<W> {
    pub fn new(sink: W) -> Self {
        LineJsonTransport { sink, scratch: Vec::new() }
    }
}

impl<W: Write> SendBuf for LineJsonTransport<W> {
    fn get(&mut self, min_size: usize) -> Option<&mut [u8]> {
        self.scratch.clear();
        self.scratch.resize(min_size.max(4096), 0);
        Some(&mut self.scratch)
    }

    fn commit_text(&mut self, len: usize) {
        let _ = self.sink.write_all(&self.scratch[..len]);
        let _ = self.sink.write_all(b"\n");
    }

    fn commit_binary(&mut self, len: usize) {
        let _ = self.sink.write_all(&self.scratch[..len]);
        let _ = self.sink.write_all(b"\n");
    }
}

/// Fixed-capacity in-memory sink for tests: `get` returns `None` once the
/// configured number of calls has been exhausted, simulating backpressure.
#[cfg(any(test, feature = "test-support"))]
pub struct TestSendBuf {
    pub remaining_calls: usize,
    pub sent: Vec<Vec<u8>>,
    scratch: Vec<u8>,
}

#[cfg(any(test, feature = "test-support"))]
impl TestSendBuf {
    pub fn new(remaining_calls: usize) -> Self {
        TestSendBuf { remaining_calls, sent: Vec::new(), scratch: Vec::new() }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl SendBuf for TestSendBuf {
    fn get(&mut self, min_size: usize) -> Option<&mut [u8]> {
        if self.remaining_calls == 0 {
            return None;
        }
        self.remaining_calls -= 1;
        self.scratch.clear();
        self.scratch.resize(min_size.max(4096), 0);
        Some(&mut self.scratch)
    }

    fn commit_text(&mut self, len: usize) {
        self.sent.push(self.scratch[..len].to_vec());
    }

    fn commit_binary(&mut self, len: usize) {
        self.sent.push(self.scratch[..len].to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendbuf_respects_call_budget() {
        let mut buf = TestSendBuf::new(1);
        assert!(buf.get(10).is_some());
        buf.commit_text(4);
        assert!(buf.get(10).is_none());
        assert_eq!(buf.sent.len(), 1);
    }
}
