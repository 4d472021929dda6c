//! HotSync framing stacks
//!
//! Three composable layers turn a raw byte-duplex into a message-oriented
//! one. Serial-like transports stack SLP (link frames with checksums)
//! under PADP (fragmentation + ack/retransmit) and run a one-shot CMP
//! exchange at session start. NetSync transports use a single
//! length-prefixed framing with a fixed preamble exchange instead.

pub mod cmp;
pub mod netsync;
pub mod padp;
pub mod slp;

pub use netsync::NetSyncEndpoint;
pub use padp::{PadpConfig, PadpEndpoint};

use crate::error::Result;

/// Message-oriented duplex produced by a framing stack
///
/// `PadpEndpoint` and `NetSyncEndpoint` are the two implementations; the
/// DLP layer above only sees this trait.
pub trait MessageLink: Send {
    fn send_message(&mut self, payload: &[u8]) -> Result<()>;

    fn recv_message(&mut self) -> Result<Vec<u8>>;
}

/// Which framing stack a connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// SLP + PADP with a CMP handshake (serial and serial-over-USB)
    PadpSerial,
    /// Length-prefixed NetSync framing (TCP and newer USB devices)
    NetSync,
}

impl std::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackKind::PadpSerial => write!(f, "serial (SLP/PADP)"),
            StackKind::NetSync => write!(f, "NetSync"),
        }
    }
}
