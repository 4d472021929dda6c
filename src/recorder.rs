//! Raw byte capture for diagnostics and replay
//!
//! A [`Recorder`] is a cheap clonable handle to a direction-tagged byte
//! log. Wrapping a transport in [`RecordingTransport`] tees every byte
//! that crosses it; after a session the capture can be dumped to a file
//! and replayed against the frame readers when debugging a device quirk.

use crate::error::Result;
use crate::transport::Transport;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

#[derive(Default)]
struct Capture {
    chunks: Vec<(Direction, Vec<u8>)>,
}

/// Shared capture log handle
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Capture>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, direction: Direction, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut capture = self.inner.lock().unwrap();
        capture.chunks.push((direction, data.to_vec()));
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().chunks.is_empty()
    }

    /// Total bytes captured in one direction
    pub fn bytes(&self, direction: Direction) -> usize {
        let capture = self.inner.lock().unwrap();
        capture
            .chunks
            .iter()
            .filter(|(d, _)| *d == direction)
            .map(|(_, data)| data.len())
            .sum()
    }

    /// Contiguous byte stream of one direction (for replay)
    pub fn stream(&self, direction: Direction) -> Vec<u8> {
        let capture = self.inner.lock().unwrap();
        capture
            .chunks
            .iter()
            .filter(|(d, _)| *d == direction)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// Write the capture as hex lines, one chunk per line
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let capture = self.inner.lock().unwrap();
        let mut out = String::new();
        for (direction, data) in &capture.chunks {
            let marker = match direction {
                Direction::In => '<',
                Direction::Out => '>',
            };
            let _ = write!(out, "{} ", marker);
            for byte in data {
                let _ = write!(out, "{:02x} ", byte);
            }
            out.push('\n');
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Transport wrapper that tees all traffic into a [`Recorder`]
pub struct RecordingTransport<T: Transport> {
    inner: T,
    recorder: Recorder,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T, recorder: Recorder) -> Self {
        RecordingTransport { inner, recorder }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: Transport> Transport for RecordingTransport<T> {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buffer)?;
        self.recorder.record(Direction::In, &buffer[..n]);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.inner.write(data)?;
        self.recorder.record(Direction::Out, &data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn available(&mut self) -> Result<usize> {
        self.inner.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_records_both_directions() {
        let mock = MockTransport::new();
        mock.inject_read(b"abc");

        let recorder = Recorder::new();
        let mut transport = RecordingTransport::new(mock, recorder.clone());

        let mut buf = [0u8; 8];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        transport.write(b"xy").unwrap();

        assert_eq!(recorder.bytes(Direction::In), 3);
        assert_eq!(recorder.bytes(Direction::Out), 2);
        assert_eq!(recorder.stream(Direction::In), b"abc");
        assert_eq!(recorder.stream(Direction::Out), b"xy");
    }

    #[test]
    fn test_empty_reads_not_recorded() {
        let mock = MockTransport::new();
        let recorder = Recorder::new();
        let mut transport = RecordingTransport::new(mock, recorder.clone());

        let mut buf = [0u8; 8];
        transport.read(&mut buf).unwrap();
        assert!(recorder.is_empty());
    }
}
