//! palmsync - HotSync protocol stack and sync daemon for Palm OS handhelds
//!
//! This library provides the pieces of a HotSync host: raw transports
//! (USB, serial, TCP), the framing stacks layered on them (SLP/PADP with
//! CMP, or NetSync), the DLP request/response codec, and a sync server
//! that discovers devices and drives a conduit pipeline against them.

pub mod config;
pub mod dlp;
pub mod error;
pub mod protocol;
pub mod recorder;
pub mod storage;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use dlp::DlpConnection;
pub use error::{Error, Result};
pub use sync::SyncServer;
