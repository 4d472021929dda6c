//! Mock transport for testing
//!
//! Two usage modes:
//! - standalone: inject bytes to be read, inspect bytes written
//! - linked pair: two ends where each side's writes become the other
//!   side's reads, for driving a full protocol exchange across threads

use super::Transport;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Mock transport for unit testing
#[derive(Clone)]
pub struct MockTransport {
    read_side: Arc<Mutex<VecDeque<u8>>>,
    write_side: Arc<Mutex<VecDeque<u8>>>,
}

impl MockTransport {
    /// Create a standalone mock transport
    pub fn new() -> Self {
        MockTransport {
            read_side: Arc::new(Mutex::new(VecDeque::new())),
            write_side: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Create a linked pair: bytes written on one end are read on the other
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
        let a = MockTransport {
            read_side: Arc::clone(&b_to_a),
            write_side: Arc::clone(&a_to_b),
        };
        let b = MockTransport {
            read_side: a_to_b,
            write_side: b_to_a,
        };
        (a, b)
    }

    /// Inject data to be read
    pub fn inject_read(&self, data: &[u8]) {
        let mut buf = self.read_side.lock().unwrap();
        buf.extend(data);
    }

    /// Get all written data
    pub fn get_written(&self) -> Vec<u8> {
        let buf = self.write_side.lock().unwrap();
        buf.iter().copied().collect()
    }

    /// Drain and return all written data
    pub fn take_written(&self) -> Vec<u8> {
        let mut buf = self.write_side.lock().unwrap();
        buf.drain(..).collect()
    }

    /// Clear the read buffer
    pub fn clear_read(&self) {
        let mut buf = self.read_side.lock().unwrap();
        buf.clear();
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut buf = self.read_side.lock().unwrap();
        let available = buf.len().min(buffer.len());

        for item in buffer.iter_mut().take(available) {
            *item = buf.pop_front().unwrap();
        }

        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut buf = self.write_side.lock().unwrap();
        buf.extend(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        let buf = self.read_side.lock().unwrap();
        Ok(buf.len())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_crosses_data() {
        let (mut a, mut b) = MockTransport::pair();
        a.write(b"hello").unwrap();

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        b.write(b"ok").unwrap();
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[test]
    fn test_empty_read_is_zero() {
        let mut t = MockTransport::new();
        let mut buf = [0u8; 4];
        assert_eq!(t.read(&mut buf).unwrap(), 0);
    }
}
