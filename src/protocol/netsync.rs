//! NetSync framing
//!
//! Length-prefixed framing used over TCP and over USB devices that
//! advertise the NetSync stack. No per-packet ack and no resync: a
//! malformed header is fatal to the session.
//!
//! ```text
//! ┌───────────┬────────┬──────────────────┬──────────────────┐
//! │ DATA_TYPE │ TXID   │ LEN (u32 BE)     │ BODY             │
//! │ 1 byte    │ 1 byte │ 4 bytes          │ LEN bytes        │
//! └───────────┴────────┴──────────────────┴──────────────────┘
//! ```
//!
//! At session start both sides exchange a fixed preamble frame (magic,
//! version, padding), expected byte-for-byte.

use super::MessageLink;
use crate::error::{Error, Result};
use crate::transport::Transport;
use std::thread;
use std::time::{Duration, Instant};

pub const HEADER_SIZE: usize = 6;
pub const DATA_TYPE: u8 = 0x01;

/// Refuse bodies larger than this (a corrupted length field otherwise
/// stalls the session waiting for gigabytes that never arrive)
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Fixed preamble body exchanged in both directions at session start:
/// magic 0x90 0x01, version 1.0, then padding.
pub const PREAMBLE_BODY: [u8; 24] = [
    0x90, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const POLL_SLEEP: Duration = Duration::from_millis(2);

/// NetSync endpoint over one transport
pub struct NetSyncEndpoint<T: Transport> {
    transport: T,
    buffer: Vec<u8>,
    tx_id: u8,
    recv_timeout: Duration,
}

impl<T: Transport> NetSyncEndpoint<T> {
    pub fn new(transport: T) -> Self {
        NetSyncEndpoint {
            transport,
            buffer: Vec::with_capacity(4096),
            tx_id: 0,
            recv_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Frame one message
    pub fn encode(tx_id: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.push(DATA_TYPE);
        frame.push(tx_id);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.tx_id = self.tx_id.wrapping_add(1);
        let frame = Self::encode(self.tx_id, payload);
        self.transport.write_all(&frame)?;
        self.transport.flush()
    }

    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.recv_timeout;

        loop {
            if self.buffer.len() >= HEADER_SIZE {
                if self.buffer[0] != DATA_TYPE {
                    return Err(Error::Framing(format!(
                        "unexpected NetSync data type 0x{:02X}",
                        self.buffer[0]
                    )));
                }
                let body_len = u32::from_be_bytes([
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                    self.buffer[5],
                ]) as usize;
                if body_len > MAX_BODY_SIZE {
                    return Err(Error::Framing(format!(
                        "NetSync body length {} exceeds limit",
                        body_len
                    )));
                }
                if self.buffer.len() >= HEADER_SIZE + body_len {
                    let body = self.buffer[HEADER_SIZE..HEADER_SIZE + body_len].to_vec();
                    self.buffer.drain(0..HEADER_SIZE + body_len);
                    return Ok(body);
                }
            }

            let mut temp_buf = [0u8; 4096];
            let n = self.transport.read(&mut temp_buf)?;
            if n > 0 {
                self.buffer.extend_from_slice(&temp_buf[..n]);
                continue;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("NetSync message".to_string()));
            }
            thread::sleep(POLL_SLEEP);
        }
    }

    /// Host side of the session-start preamble exchange
    pub fn handshake(&mut self) -> Result<()> {
        self.send(&PREAMBLE_BODY)?;

        let reply = self.recv()?;
        if reply != PREAMBLE_BODY {
            return Err(Error::Framing(
                "NetSync preamble mismatch from peer".to_string(),
            ));
        }
        log::debug!("NetSync preamble exchange complete");
        Ok(())
    }

    /// Device side of the preamble exchange (used by tests and tools)
    pub fn handshake_accept(&mut self) -> Result<()> {
        let hello = self.recv()?;
        if hello != PREAMBLE_BODY {
            return Err(Error::Framing(
                "NetSync preamble mismatch from host".to_string(),
            ));
        }
        self.send(&PREAMBLE_BODY)
    }
}

impl<T: Transport> MessageLink for NetSyncEndpoint<T> {
    fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        self.send(payload)
    }

    fn recv_message(&mut self) -> Result<Vec<u8>> {
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_frame_layout() {
        let body = vec![0xAB; 300];
        let frame = NetSyncEndpoint::<MockTransport>::encode(1, &body);

        assert_eq!(frame[0], DATA_TYPE);
        assert_eq!(frame[1], 1);
        assert_eq!(&frame[2..6], &300u32.to_be_bytes());
        assert_eq!(&frame[6..], &body[..]);
    }

    #[test]
    fn test_round_trip() {
        let body: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let (a, mut b) = MockTransport::pair();

        let mut host = NetSyncEndpoint::new(a).with_recv_timeout(Duration::from_secs(1));
        host.send(&body).unwrap();

        // Raw bytes on the wire carry the exact envelope
        let mut wire = [0u8; 512];
        let n = b.read(&mut wire).unwrap();
        assert_eq!(n, HEADER_SIZE + 300);
        assert_eq!(&wire[2..6], &300u32.to_be_bytes());

        b.write(&wire[..n]).unwrap();
        // The peer's write lands back on the host's read side of the pair
        let decoded = host.recv().unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_empty_body() {
        let (a, b) = MockTransport::pair();
        let mut host = NetSyncEndpoint::new(a).with_recv_timeout(Duration::from_secs(1));
        let mut device = NetSyncEndpoint::new(b).with_recv_timeout(Duration::from_secs(1));

        host.send(&[]).unwrap();
        assert_eq!(device.recv().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_preamble_exchange() {
        let (a, b) = MockTransport::pair();
        let mut host = NetSyncEndpoint::new(a).with_recv_timeout(Duration::from_secs(1));
        let mut device = NetSyncEndpoint::new(b).with_recv_timeout(Duration::from_secs(1));

        let peer = std::thread::spawn(move || device.handshake_accept());
        host.handshake().unwrap();
        peer.join().unwrap().unwrap();
    }

    #[test]
    fn test_bad_preamble_rejected() {
        let (a, b) = MockTransport::pair();
        let mut host = NetSyncEndpoint::new(a).with_recv_timeout(Duration::from_millis(200));
        let mut device = NetSyncEndpoint::new(b).with_recv_timeout(Duration::from_millis(200));

        let peer = std::thread::spawn(move || {
            let _ = device.recv();
            device.send(b"not the preamble")
        });
        let err = host.handshake().unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
        peer.join().unwrap().unwrap();
    }

    #[test]
    fn test_oversized_length_rejected() {
        let (a, mut b) = MockTransport::pair();
        let mut host = NetSyncEndpoint::new(a).with_recv_timeout(Duration::from_millis(200));

        let mut frame = vec![DATA_TYPE, 1];
        frame.extend_from_slice(&(MAX_BODY_SIZE as u32 + 1).to_be_bytes());
        b.write(&frame).unwrap();

        let err = host.recv().unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }
}
