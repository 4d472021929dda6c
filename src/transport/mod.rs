//! Transport layer for I/O abstraction
//!
//! Every adapter (serial, USB bulk, TCP) presents the same raw byte-duplex.
//! Framing stacks are layered on top and never see the underlying bus.

use crate::error::Result;

mod serial;
pub use serial::SerialTransport;

mod net;
pub use net::{HOTSYNC_TCP_PORT, NetListener, TcpTransport};

pub mod devices;
pub mod usb;

mod mock;
pub use mock::MockTransport;

/// Transport trait for device communication
///
/// Reads are polled: a timeout with no data is `Ok(0)`, never an error.
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes
    fn flush(&mut self) -> Result<()>;

    /// Check if data is available to read
    fn available(&mut self) -> Result<usize> {
        Ok(0) // Default implementation
    }

    /// Write the whole buffer
    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data)?;
            data = &data[n..];
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        (**self).read(buffer)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn available(&mut self) -> Result<usize> {
        (**self).available()
    }
}
