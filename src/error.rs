//! Error types for palmsync
//!
//! # Error Recovery Strategies
//!
//! Different error kinds require different recovery approaches:
//!
//! ## Session-Fatal (Device Released, Discovery Resumes)
//!
//! - **`Transport`**, **`Io`**, **`Serial`**, **`Usb`**: the underlying bus,
//!   socket, or serial port failed. The session is torn down and the
//!   discovery loop resumes polling.
//!
//! - **`Protocol`**: command/argument mismatch or a malformed header. The
//!   peer is out of step with us; there is no way to resynchronize inside a
//!   session.
//!
//! ## Recoverable (Layer Handles It)
//!
//! - **`Framing`**: checksum or CRC mismatch. The SLP reader drops the frame
//!   and resynchronizes on the next preamble. Over NetSync there is no
//!   resync, so the same kind escalates to session-fatal there.
//!
//! - **`Timeout`**: an ack or read deadline expired. PADP retransmits up to
//!   its retry limit before escalating.
//!
//! ## Caller-Decided
//!
//! - **`Dlp`**: the device answered with a non-zero status code. Surfaced to
//!   whoever issued the request; a conduit may treat "not found" as loop
//!   termination while the orchestrator treats most codes as sync failures.
//!
//! ## Skip and Continue
//!
//! - **`DeviceBusy`**: open or claim failed because another driver holds the
//!   device or we lack permission. The session is skipped and discovery
//!   continues.

use thiserror::Error;

/// Errors that can occur in palmsync
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DLP error 0x{0:04x}")]
    Dlp(u16),

    #[error("Device busy or inaccessible: {0}")]
    DeviceBusy(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
