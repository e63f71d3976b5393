//! Per-worker message buffers.
use std::collections::TryReserveError;

/// Fill byte of every send buffer.
pub const SEND_FILL: u8 = b'a';
/// Fill byte of every receive buffer before a message lands.
pub const RECV_FILL: u8 = b'b';

/// Round-dependent byte for validated exchanges. Never equal to `base`,
/// repeats every 255 rounds.
fn round_fill(base: u8, round: usize) -> u8 {
    base ^ (1 + (round % 255) as u8)
}

/// Byte the sender writes into the request of `round` when validating.
pub fn request_fill(round: usize) -> u8 {
    round_fill(SEND_FILL, round)
}

/// Byte the receiver writes into the reply of `round` when validating.
pub fn reply_fill(round: usize) -> u8 {
    round_fill(RECV_FILL, round)
}

/// Send and receive buffer of one worker, sized for the largest message.
pub struct PingPongBuffers {
    send: Vec<u8>,
    recv: Vec<u8>,
}

fn zeroed(capacity: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)?;
    buf.resize(capacity, 0);
    Ok(buf)
}

impl PingPongBuffers {
    /// Allocate both buffers, reporting failure instead of aborting.
    pub fn allocate(capacity: usize) -> Result<PingPongBuffers, TryReserveError> {
        Ok(PingPongBuffers {
            send: zeroed(capacity)?,
            recv: zeroed(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.send.len()
    }

    /// Write the fill patterns over the first `size` bytes.
    pub fn touch(&mut self, size: usize) {
        self.send[..size].fill(SEND_FILL);
        self.recv[..size].fill(RECV_FILL);
    }

    pub fn send_buf(&self, size: usize) -> &[u8] {
        &self.send[..size]
    }

    pub fn recv_buf(&mut self, size: usize) -> &mut [u8] {
        &mut self.recv[..size]
    }

    /// Stamp the outgoing message with `byte`.
    pub fn fill_send(&mut self, size: usize, byte: u8) {
        self.send[..size].fill(byte);
    }

    /// Forget the previous message so the next one is checked on its own.
    pub fn reset_recv(&mut self, size: usize) {
        self.recv[..size].fill(RECV_FILL);
    }

    /// Whether the last message received is `byte` throughout.
    pub fn recv_matches(&self, size: usize, byte: u8) -> bool {
        self.recv[..size].iter().all(|&b| b == byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_fills_prefix() {
        let mut buffers = PingPongBuffers::allocate(8).unwrap();
        buffers.touch(4);
        assert_eq!(buffers.send_buf(8), b"aaaa\0\0\0\0");
        assert_eq!(buffers.recv_buf(8), b"bbbb\0\0\0\0");
        assert_eq!(buffers.capacity(), 8);
    }

    #[test]
    fn test_recv_matches() {
        let mut buffers = PingPongBuffers::allocate(4).unwrap();
        buffers.touch(4);
        assert!(!buffers.recv_matches(4, reply_fill(0)));
        buffers.recv_buf(4).fill(reply_fill(0));
        assert!(buffers.recv_matches(4, reply_fill(0)));
        assert!(!buffers.recv_matches(4, reply_fill(1)));
        buffers.reset_recv(4);
        assert!(!buffers.recv_matches(4, reply_fill(0)));
    }

    #[test]
    fn test_round_patterns_are_distinct() {
        for round in 0..255 {
            assert_ne!(request_fill(round), SEND_FILL);
            assert_ne!(reply_fill(round), RECV_FILL);
            assert_ne!(request_fill(round), reply_fill(round));
            assert_ne!(reply_fill(round), reply_fill(round + 1));
        }
        assert_eq!(reply_fill(3), reply_fill(258));
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        assert!(PingPongBuffers::allocate(usize::MAX).is_err());
    }
}
