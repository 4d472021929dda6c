//! Packet Assembly/Disassembly Protocol
//!
//! Reliability layer carried in SLP frames on the DLP socket pair (3/3).
//! Outbound payloads are fragmented into 1024-byte chunks; every data
//! fragment is individually acknowledged by an ack whose transaction id and
//! size-or-offset field mirror the fragment. Unacknowledged fragments are
//! retransmitted up to a bounded number of times before the whole message
//! fails with a timeout.
//!
//! Fragment header, inside the SLP body:
//!
//! ```text
//! [TYPE] [FLAGS] [TXID] [SIZE_OR_OFFSET (u32 BE)] [PAYLOAD]
//! ```
//!
//! The first fragment of a message carries the total length in the size
//! field and the FIRST flag; later fragments carry their byte offset; the
//! final fragment carries the LAST flag.

use super::MessageLink;
use super::slp::{FrameReader, PacketType, SOCKET_DLP, SlpFrame};
use crate::error::{Error, Result};
use crate::transport::Transport;
use std::thread;
use std::time::{Duration, Instant};

/// Maximum fragment payload
pub const FRAGMENT_SIZE: usize = 1024;

pub const TYPE_DATA: u8 = 0x01;
pub const TYPE_ACK: u8 = 0x02;

pub const FLAG_FIRST: u8 = 0x80;
pub const FLAG_LAST: u8 = 0x40;
pub const FLAG_MEMORY_ERROR: u8 = 0x20;

pub const HEADER_SIZE: usize = 7;

/// Pause between empty transport polls while waiting for a frame
const POLL_SLEEP: Duration = Duration::from_millis(2);

/// Timing and retry parameters
///
/// Defaults are the wire constants; tests shrink them to run fast.
#[derive(Debug, Clone)]
pub struct PadpConfig {
    /// How long to wait for the ack of one data fragment
    pub ack_timeout: Duration,
    /// Retransmissions of one fragment before the message fails
    pub max_retries: u32,
    /// Deadline for an inbound message once we start waiting for one
    pub recv_timeout: Duration,
}

impl Default for PadpConfig {
    fn default() -> Self {
        PadpConfig {
            ack_timeout: Duration::from_millis(2000),
            max_retries: 10,
            recv_timeout: Duration::from_secs(30),
        }
    }
}

/// One PADP packet parsed out of an SLP body
#[derive(Debug, Clone)]
struct PadpPacket {
    ptype: u8,
    flags: u8,
    tx_id: u8,
    size_or_offset: u32,
    payload: Vec<u8>,
}

impl PadpPacket {
    fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < HEADER_SIZE {
            return Err(Error::Framing(format!(
                "PADP packet too short ({} bytes)",
                body.len()
            )));
        }
        Ok(PadpPacket {
            ptype: body[0],
            flags: body[1],
            tx_id: body[2],
            size_or_offset: u32::from_be_bytes([body[3], body[4], body[5], body[6]]),
            payload: body[HEADER_SIZE..].to_vec(),
        })
    }

    fn encode(ptype: u8, flags: u8, tx_id: u8, size_or_offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(HEADER_SIZE + payload.len());
        body.push(ptype);
        body.push(flags);
        body.push(tx_id);
        body.extend_from_slice(&size_or_offset.to_be_bytes());
        body.extend_from_slice(payload);
        body
    }
}

/// PADP endpoint over one transport
///
/// Send and receive are strictly sequential: the DLP layer above never
/// pipelines, so one endpoint services one direction at a time.
pub struct PadpEndpoint<T: Transport> {
    transport: T,
    reader: FrameReader,
    config: PadpConfig,
    tx_id: u8,
}

impl<T: Transport> PadpEndpoint<T> {
    pub fn new(transport: T, config: PadpConfig) -> Self {
        PadpEndpoint {
            transport,
            reader: FrameReader::new(),
            config,
            tx_id: 0,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Next transaction id; zero is reserved and skipped
    fn next_tx_id(&mut self) -> u8 {
        self.tx_id = self.tx_id.wrapping_add(1);
        if self.tx_id == 0 {
            self.tx_id = 1;
        }
        self.tx_id
    }

    fn write_packet(&mut self, body: Vec<u8>) -> Result<()> {
        let frame = SlpFrame::new(SOCKET_DLP, SOCKET_DLP, PacketType::Padp, body);
        self.transport.write_all(&frame.to_bytes())?;
        self.transport.flush()
    }

    /// Read the next PADP packet on the DLP socket pair, or None on timeout
    fn read_packet(&mut self, deadline: Instant) -> Result<Option<PadpPacket>> {
        loop {
            if let Some(frame) = self.reader.read_frame(&mut self.transport)? {
                if frame.ptype != PacketType::Padp
                    || frame.dest != SOCKET_DLP
                    || frame.src != SOCKET_DLP
                {
                    log::debug!(
                        "Ignoring frame for socket {}->{} type {:?}",
                        frame.src,
                        frame.dest,
                        frame.ptype
                    );
                    continue;
                }
                return Ok(Some(PadpPacket::parse(&frame.body)?));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_SLEEP);
        }
    }

    /// Send one data fragment and wait for its ack, retransmitting on timeout
    fn send_fragment(&mut self, flags: u8, tx_id: u8, size_or_offset: u32, chunk: &[u8]) -> Result<()> {
        let body = PadpPacket::encode(TYPE_DATA, flags, tx_id, size_or_offset, chunk);
        let mut attempts: u32 = 0;

        loop {
            self.write_packet(body.clone())?;

            match self.await_ack(tx_id, size_or_offset) {
                Ok(()) => return Ok(()),
                Err(Error::Timeout(_)) if attempts < self.config.max_retries => {
                    attempts += 1;
                    log::warn!(
                        "PADP ack timeout for txid {}, retransmitting ({}/{})",
                        tx_id,
                        attempts,
                        self.config.max_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn await_ack(&mut self, tx_id: u8, size_or_offset: u32) -> Result<()> {
        let deadline = Instant::now() + self.config.ack_timeout;

        loop {
            let Some(packet) = self.read_packet(deadline)? else {
                return Err(Error::Timeout(format!("PADP ack (txid {})", tx_id)));
            };

            if packet.ptype != TYPE_ACK {
                log::debug!(
                    "Expected ack, got PADP type 0x{:02X}; ignoring",
                    packet.ptype
                );
                continue;
            }
            if packet.flags & FLAG_MEMORY_ERROR != 0 {
                return Err(Error::Protocol(
                    "peer reported memory error in PADP ack".to_string(),
                ));
            }
            if packet.tx_id != tx_id || packet.size_or_offset != size_or_offset {
                log::debug!(
                    "Stale ack txid {} size {}; waiting for txid {} size {}",
                    packet.tx_id,
                    packet.size_or_offset,
                    tx_id,
                    size_or_offset
                );
                continue;
            }
            return Ok(());
        }
    }

    fn send_ack(&mut self, flags: u8, tx_id: u8, size_or_offset: u32) -> Result<()> {
        let body = PadpPacket::encode(TYPE_ACK, flags, tx_id, size_or_offset, &[]);
        self.write_packet(body)
    }

    /// Send one logical message, fragmenting as needed
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let tx_id = self.next_tx_id();
        let total = payload.len() as u32;

        if payload.is_empty() {
            return self.send_fragment(FLAG_FIRST | FLAG_LAST, tx_id, 0, &[]);
        }

        let chunk_count = payload.len().div_ceil(FRAGMENT_SIZE);
        for (i, chunk) in payload.chunks(FRAGMENT_SIZE).enumerate() {
            let mut flags = 0;
            if i == 0 {
                flags |= FLAG_FIRST;
            }
            if i == chunk_count - 1 {
                flags |= FLAG_LAST;
            }
            let size_or_offset = if i == 0 { total } else { (i * FRAGMENT_SIZE) as u32 };
            self.send_fragment(flags, tx_id, size_or_offset, chunk)?;
        }
        Ok(())
    }

    /// Receive one logical message, acknowledging every fragment
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.config.recv_timeout;
        let mut message: Vec<u8> = Vec::new();
        let mut tx_id: Option<u8> = None;
        let mut total: u32 = 0;

        loop {
            let Some(packet) = self.read_packet(deadline)? else {
                return Err(Error::Timeout("PADP message".to_string()));
            };

            if packet.ptype != TYPE_DATA {
                log::debug!("Ignoring PADP type 0x{:02X} while receiving", packet.ptype);
                continue;
            }

            match tx_id {
                None => {
                    if packet.flags & FLAG_FIRST == 0 {
                        // Tail of a message we never saw the head of; re-ack
                        // so the sender stops retransmitting, then drop it.
                        self.send_ack(packet.flags, packet.tx_id, packet.size_or_offset)?;
                        log::warn!(
                            "Dropping PADP continuation fragment without a first (txid {})",
                            packet.tx_id
                        );
                        continue;
                    }
                    tx_id = Some(packet.tx_id);
                    total = packet.size_or_offset;
                    self.send_ack(packet.flags, packet.tx_id, packet.size_or_offset)?;
                    message.extend_from_slice(&packet.payload);
                }
                Some(id) => {
                    if packet.tx_id != id {
                        return Err(Error::Protocol(format!(
                            "PADP txid changed mid-message ({} -> {})",
                            id, packet.tx_id
                        )));
                    }
                    let offset = packet.size_or_offset as usize;
                    if packet.flags & FLAG_FIRST != 0 || offset < message.len() {
                        // Duplicate of a fragment already consumed
                        self.send_ack(packet.flags, packet.tx_id, packet.size_or_offset)?;
                        log::debug!(
                            "Re-acking duplicate PADP fragment (txid {}, offset {})",
                            packet.tx_id,
                            packet.size_or_offset
                        );
                        continue;
                    }
                    if offset > message.len() {
                        return Err(Error::Protocol(format!(
                            "PADP fragment gap: expected offset {}, got {}",
                            message.len(),
                            offset
                        )));
                    }
                    self.send_ack(packet.flags, packet.tx_id, packet.size_or_offset)?;
                    message.extend_from_slice(&packet.payload);
                }
            }

            if packet.flags & FLAG_LAST != 0 {
                if message.len() != total as usize {
                    return Err(Error::Protocol(format!(
                        "PADP message length mismatch: declared {}, received {}",
                        total,
                        message.len()
                    )));
                }
                return Ok(message);
            }
        }
    }
}

impl<T: Transport> MessageLink for PadpEndpoint<T> {
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
    use std::thread;

    fn fast_config() -> PadpConfig {
        PadpConfig {
            ack_timeout: Duration::from_millis(40),
            max_retries: 3,
            recv_timeout: Duration::from_secs(5),
        }
    }

    /// Scripted peer: parses SLP frames off its end, optionally swallowing
    /// acks for the first `drop_acks` data fragments it receives.
    fn run_peer(
        transport: MockTransport,
        drop_acks: usize,
    ) -> thread::JoinHandle<(Vec<u8>, usize)> {
        thread::Builder::new()
            .name("padp-test-peer".to_string())
            .spawn(move || {
                let mut transport = transport;
                let mut reader = FrameReader::new();
                let mut message: Vec<u8> = Vec::new();
                let mut data_frames = 0usize;
                let mut dropped = 0usize;
                let deadline = Instant::now() + Duration::from_secs(5);

                loop {
                    let frame = match reader.read_frame(&mut transport) {
                        Ok(Some(f)) => f,
                        Ok(None) => {
                            if Instant::now() >= deadline {
                                panic!("peer timed out");
                            }
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                        Err(e) => panic!("peer read error: {}", e),
                    };

                    let packet = PadpPacket::parse(&frame.body).unwrap();
                    if packet.ptype != TYPE_DATA {
                        continue;
                    }
                    data_frames += 1;

                    if dropped < drop_acks {
                        dropped += 1;
                        continue; // swallow the ack for this fragment
                    }

                    let ack = PadpPacket::encode(
                        TYPE_ACK,
                        packet.flags,
                        packet.tx_id,
                        packet.size_or_offset,
                        &[],
                    );
                    let ack_frame =
                        SlpFrame::new(SOCKET_DLP, SOCKET_DLP, PacketType::Padp, ack);
                    transport.write_all(&ack_frame.to_bytes()).unwrap();

                    // Only extend once per distinct offset
                    let offset = if packet.flags & FLAG_FIRST != 0 {
                        0
                    } else {
                        packet.size_or_offset as usize
                    };
                    if offset == message.len() {
                        message.extend_from_slice(&packet.payload);
                    }

                    if packet.flags & FLAG_LAST != 0 {
                        return (message, data_frames);
                    }
                }
            })
            .unwrap()
    }

    #[test]
    fn test_single_fragment_send() {
        let (host, peer) = MockTransport::pair();
        let handle = run_peer(peer, 0);

        let mut endpoint = PadpEndpoint::new(host, fast_config());
        endpoint.send(b"hello device").unwrap();

        let (message, data_frames) = handle.join().unwrap();
        assert_eq!(message, b"hello device");
        assert_eq!(data_frames, 1);
    }

    #[test]
    fn test_multi_fragment_send() {
        let payload: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();
        let (host, peer) = MockTransport::pair();
        let handle = run_peer(peer, 0);

        let mut endpoint = PadpEndpoint::new(host, fast_config());
        endpoint.send(&payload).unwrap();

        let (message, data_frames) = handle.join().unwrap();
        assert_eq!(message, payload);
        assert_eq!(data_frames, 3); // 1024 + 1024 + 952
    }

    #[test]
    fn test_dropped_ack_causes_retransmit() {
        let payload: Vec<u8> = vec![0x5A; 1500]; // two fragments
        let (host, peer) = MockTransport::pair();
        let handle = run_peer(peer, 1); // swallow the first ack

        let mut endpoint = PadpEndpoint::new(host, fast_config());
        endpoint.send(&payload).unwrap();

        let (message, data_frames) = handle.join().unwrap();
        assert_eq!(message, payload);
        // First fragment sent twice (ack dropped once), second once
        assert_eq!(data_frames, 3);
    }

    #[test]
    fn test_ack_never_arrives_times_out() {
        let (host, _peer) = MockTransport::pair();
        let mut endpoint = PadpEndpoint::new(host, fast_config());

        let err = endpoint.send(b"anyone there?").unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_retry_count_is_bounded() {
        // Peer that never acks: expect 1 + max_retries transmissions.
        let (host, peer) = MockTransport::pair();
        let config = fast_config();
        let max_retries = config.max_retries;

        let mut endpoint = PadpEndpoint::new(host, config);
        let err = endpoint.send(b"x").unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let mut reader = FrameReader::new();
        let mut peer = peer;
        let mut count = 0;
        while let Ok(Some(frame)) = reader.read_frame(&mut peer) {
            let packet = PadpPacket::parse(&frame.body).unwrap();
            if packet.ptype == TYPE_DATA {
                count += 1;
            }
        }
        assert_eq!(count, (1 + max_retries) as usize);
    }

    #[test]
    fn test_recv_reassembles_and_acks() {
        let payload: Vec<u8> = (0..2500).map(|i| (i % 199) as u8).collect();
        let (host, peer) = MockTransport::pair();

        let sender = thread::spawn(move || {
            let mut endpoint = PadpEndpoint::new(peer, fast_config());
            endpoint.send(&payload).unwrap();
            payload
        });

        let mut endpoint = PadpEndpoint::new(host, fast_config());
        let message = endpoint.recv().unwrap();
        let sent = sender.join().unwrap();
        assert_eq!(message, sent);
    }

    #[test]
    fn test_recv_large_message() {
        // 1 MB reassembly across 1024 fragments
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let (host, peer) = MockTransport::pair();
        let expected = payload.clone();

        let sender = thread::spawn(move || {
            let mut endpoint = PadpEndpoint::new(peer, fast_config());
            endpoint.send(&payload).unwrap();
        });

        let mut endpoint = PadpEndpoint::new(host, fast_config());
        let message = endpoint.recv().unwrap();
        sender.join().unwrap();
        assert_eq!(message.len(), expected.len());
        assert_eq!(message, expected);
    }

    #[test]
    fn test_recv_duplicate_fragment_dropped() {
        let (mut host_raw, peer) = MockTransport::pair();

        // Hand-feed: first fragment, the same fragment again, then the rest
        let first = PadpPacket::encode(TYPE_DATA, FLAG_FIRST, 7, 4, b"ab");
        let last = PadpPacket::encode(TYPE_DATA, FLAG_LAST, 7, 2, b"cd");
        for body in [first.clone(), first, last] {
            let frame = SlpFrame::new(SOCKET_DLP, SOCKET_DLP, PacketType::Padp, body);
            host_raw.write_all(&frame.to_bytes()).unwrap();
        }

        let mut endpoint = PadpEndpoint::new(peer, fast_config());
        let message = endpoint.recv().unwrap();
        assert_eq!(message, b"abcd".to_vec());

        // Three data fragments -> three acks on the wire
        let mut reader = FrameReader::new();
        let mut acks = 0;
        reader.push_bytes(&host_raw.take_written());
        while let Some(frame) = reader.try_parse_frame() {
            if PadpPacket::parse(&frame.body).unwrap().ptype == TYPE_ACK {
                acks += 1;
            }
        }
        assert_eq!(acks, 3);
    }

    #[test]
    fn test_recv_gap_aborts() {
        let (mut host_raw, peer) = MockTransport::pair();

        let first = PadpPacket::encode(TYPE_DATA, FLAG_FIRST, 9, 10, b"ab");
        let gap = PadpPacket::encode(TYPE_DATA, FLAG_LAST, 9, 6, b"zz");
        for body in [first, gap] {
            let frame = SlpFrame::new(SOCKET_DLP, SOCKET_DLP, PacketType::Padp, body);
            host_raw.write_all(&frame.to_bytes()).unwrap();
        }

        let mut endpoint = PadpEndpoint::new(peer, fast_config());
        let err = endpoint.recv().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
