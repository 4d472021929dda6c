//! Host-side storage contract
//!
//! The orchestrator and conduits see storage only through this trait.
//! Databases are opaque byte blobs keyed by name; parsing PDB/PRC content
//! is the job of the external file-format layer. The file-backed
//! implementation serves a real host, the in-memory one serves tests.

use crate::error::Result;
use serde::{Deserialize, Serialize};

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// A pending installation picked up from the install queue
#[derive(Debug, Clone)]
pub struct InstallEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Per-user sync anchor persisted after each successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAnchor {
    /// Computer id written to the device as lastSyncPc
    pub last_sync_pc: u32,
    /// Packed device timestamp of the last successful sync
    pub last_sync_anchor: u64,
}

/// Storage operations the sync engine depends on
pub trait Storage: Send + Sync {
    /// Prepare the per-user area (idempotent)
    fn create_user_area(&self, user: &str) -> Result<()>;

    fn user_area_exists(&self, user: &str) -> Result<bool>;

    /// Names of all databases backed up for the user
    fn list_databases(&self, user: &str) -> Result<Vec<String>>;

    fn read_database(&self, user: &str, name: &str) -> Result<Vec<u8>>;

    fn write_database(&self, user: &str, name: &str, data: &[u8]) -> Result<()>;

    fn database_exists(&self, user: &str, name: &str) -> Result<bool>;

    /// Pending installs for the user, in queue order
    fn install_queue(&self, user: &str) -> Result<Vec<InstallEntry>>;

    /// Remove one entry after it has been delivered to the device
    fn consume_install_entry(&self, user: &str, name: &str) -> Result<()>;

    /// Stable identifier of this host, written to devices as lastSyncPc
    fn computer_id(&self) -> Result<u32>;

    fn read_sync_state(&self, user: &str) -> Result<Option<SyncAnchor>>;

    fn write_sync_state(&self, user: &str, anchor: &SyncAnchor) -> Result<()>;
}
