//! Connection Management Protocol
//!
//! One fixed-size packet each way at session start on serial-like stacks,
//! carried over PADP. The device opens with a wakeup carrying its protocol
//! version and the baud rate it wants; the host answers with an init that
//! echoes those parameters. No retransmit of its own.
//!
//! Packet format (10 bytes):
//!
//! ```text
//! [TYPE] [FLAGS] [VER_MAJOR] [VER_MINOR] [RESERVED (2)] [BAUD (u32 BE)]
//! ```

use super::padp::PadpEndpoint;
use crate::error::{Error, Result};
use crate::transport::Transport;

pub const PACKET_SIZE: usize = 10;

/// Set in the init reply when the proposed baud rate is accepted
pub const FLAG_CHANGE_BAUD: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpType {
    Wakeup = 1,
    Init = 2,
    Abort = 3,
    Extended = 4,
}

impl CmpType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(CmpType::Wakeup),
            2 => Some(CmpType::Init),
            3 => Some(CmpType::Abort),
            4 => Some(CmpType::Extended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CmpPacket {
    pub ctype: CmpType,
    pub flags: u8,
    pub ver_major: u8,
    pub ver_minor: u8,
    pub baud: u32,
}

impl CmpPacket {
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[0] = self.ctype as u8;
        bytes[1] = self.flags;
        bytes[2] = self.ver_major;
        bytes[3] = self.ver_minor;
        // bytes 4..6 reserved
        bytes[6..10].copy_from_slice(&self.baud.to_be_bytes());
        bytes
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_SIZE {
            return Err(Error::Framing(format!(
                "CMP packet too short ({} bytes)",
                data.len()
            )));
        }
        let ctype = CmpType::from_byte(data[0])
            .ok_or_else(|| Error::Protocol(format!("unknown CMP type 0x{:02X}", data[0])))?;
        Ok(CmpPacket {
            ctype,
            flags: data[1],
            ver_major: data[2],
            ver_minor: data[3],
            baud: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
        })
    }
}

/// Run the host side of the wakeup-then-init exchange
///
/// Waits for the device's wakeup and answers with an init echoing the
/// device's version and proposed baud rate. Returns the wakeup packet so
/// the caller can reopen the port at the negotiated rate.
pub fn handshake<T: Transport>(endpoint: &mut PadpEndpoint<T>) -> Result<CmpPacket> {
    let message = endpoint.recv()?;
    let wakeup = CmpPacket::parse(&message)?;

    match wakeup.ctype {
        CmpType::Wakeup => {}
        CmpType::Abort => {
            return Err(Error::Protocol("device aborted CMP handshake".to_string()));
        }
        other => {
            return Err(Error::Protocol(format!(
                "expected CMP wakeup, got {:?}",
                other
            )));
        }
    }

    log::debug!(
        "CMP wakeup: version {}.{}, proposed baud {}",
        wakeup.ver_major,
        wakeup.ver_minor,
        wakeup.baud
    );

    let init = CmpPacket {
        ctype: CmpType::Init,
        flags: if wakeup.baud != 0 { FLAG_CHANGE_BAUD } else { 0 },
        ver_major: wakeup.ver_major,
        ver_minor: wakeup.ver_minor,
        baud: wakeup.baud,
    };
    endpoint.send(&init.to_bytes())?;

    Ok(wakeup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_layout() {
        let packet = CmpPacket {
            ctype: CmpType::Wakeup,
            flags: 0,
            ver_major: 1,
            ver_minor: 1,
            baud: 57600,
        };
        let bytes = packet.to_bytes();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[3], 1);
        assert_eq!(&bytes[6..10], &57600u32.to_be_bytes());
    }

    #[test]
    fn test_round_trip() {
        let packet = CmpPacket {
            ctype: CmpType::Init,
            flags: FLAG_CHANGE_BAUD,
            ver_major: 1,
            ver_minor: 2,
            baud: 115200,
        };
        let parsed = CmpPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.ctype, CmpType::Init);
        assert_eq!(parsed.flags, FLAG_CHANGE_BAUD);
        assert_eq!(parsed.ver_major, 1);
        assert_eq!(parsed.ver_minor, 2);
        assert_eq!(parsed.baud, 115200);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[0] = 0x7F;
        assert!(CmpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(CmpPacket::parse(&[1, 0, 0]).is_err());
    }
}
