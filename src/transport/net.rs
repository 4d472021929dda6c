//! TCP transport for NetSync clients
//!
//! The listener is non-blocking so the discovery loop can interleave
//! accept polling with shutdown checks; an accepted stream is switched
//! back to blocking mode with a short read timeout.

use super::Transport;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// Default HotSync network port
pub const HOTSYNC_TCP_PORT: u16 = 14238;

/// Byte-duplex over an accepted NetSync connection
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        Ok(TcpTransport { stream, peer })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.stream.read(buffer) {
            Ok(0) => Err(Error::Transport(format!("peer {} closed", self.peer))),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.stream.write(data)?)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }
}

/// Non-blocking NetSync listener
pub struct NetListener {
    listener: TcpListener,
}

impl NetListener {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", addr, e)))?;
        listener.set_nonblocking(true)?;
        log::info!("NetSync listener bound to {}", addr);
        Ok(NetListener { listener })
    }

    /// Poll once for a pending connection
    pub fn poll_accept(&self) -> Result<Option<TcpTransport>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                log::info!("NetSync client connected: {}", addr);
                Ok(Some(TcpTransport::from_stream(stream)?))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
