//! Session context and sync-type classification
//!
//! After the framing handshake the orchestrator reads the device's system
//! and user identity, decides what kind of pass this is, runs the conduit
//! pipeline, and always attempts EndOfSync so the handheld returns to its
//! main screen even when a conduit failed.

use super::conduit::{self, Conduit};
use crate::dlp::{DlpConnection, SysInfo, UserInfo};
use crate::error::Result;
use crate::protocol::StackKind;
use crate::recorder::Recorder;
use crate::storage::Storage;

/// How the pass will treat device records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// Device unknown locally: full download of all databases
    First,
    /// Anchors agree with this host: incremental via modified flags
    Fast,
    /// Known device but anchors diverge: record-by-record comparison
    Slow,
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncType::First => write!(f, "first"),
            SyncType::Fast => write!(f, "fast"),
            SyncType::Slow => write!(f, "slow"),
        }
    }
}

/// Everything a session accumulates between handshake and teardown
pub struct SessionContext {
    pub stack: StackKind,
    pub recorder: Recorder,
    pub sys_info: SysInfo,
    pub user: UserInfo,
    pub sync_type: SyncType,
    /// Filled by the first conduit that lists the device directory
    pub databases: Vec<crate::dlp::DbInfo>,
}

impl SessionContext {
    /// Storage key for this device's user; devices fresh from a hard
    /// reset have no name yet
    pub fn storage_user(&self) -> &str {
        if self.user.username.is_empty() {
            "unnamed"
        } else {
            &self.user.username
        }
    }
}

/// Compare the device's sync identity against local records
pub fn classify(user: &UserInfo, storage: &dyn Storage) -> Result<SyncType> {
    let key = if user.username.is_empty() {
        "unnamed"
    } else {
        &user.username
    };

    if !storage.user_area_exists(key)? {
        return Ok(SyncType::First);
    }
    let Some(anchor) = storage.read_sync_state(key)? else {
        return Ok(SyncType::First);
    };

    let computer_id = storage.computer_id()?;
    if user.last_sync_pc == computer_id
        && user.last_sync_date.as_anchor() == anchor.last_sync_anchor
    {
        Ok(SyncType::Fast)
    } else {
        Ok(SyncType::Slow)
    }
}

/// Issue the two initial DLP calls and build the session context
pub fn begin(
    dlp: &mut DlpConnection,
    stack: StackKind,
    recorder: Recorder,
    storage: &dyn Storage,
) -> Result<SessionContext> {
    let sys_info = dlp.read_sys_info()?;
    log::info!(
        "Device ROM {}.{}, localization 0x{:08X}",
        sys_info.rom_version >> 24,
        (sys_info.rom_version >> 16) & 0xFF,
        sys_info.localization_id
    );

    let user = dlp.read_user_info()?;
    let sync_type = classify(&user, storage)?;
    log::info!(
        "User \"{}\" (id 0x{:08X}, lastSyncPc 0x{:08X}): {} sync",
        user.username,
        user.user_id,
        user.last_sync_pc,
        sync_type
    );

    Ok(SessionContext {
        stack,
        recorder,
        sys_info,
        user,
        sync_type,
        databases: Vec::new(),
    })
}

/// Result of one serviced session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub user: String,
    pub sync_type: SyncType,
    pub conduit_failures: usize,
}

/// Drive one full session over an established DLP connection
///
/// Errors before the pipeline starts (the device refused the initial
/// calls) fail the session. Conduit errors do not: the pipeline runs to
/// completion and EndOfSync is always attempted, with its own failure
/// logged but not escalated.
pub fn service(
    dlp: &mut DlpConnection,
    stack: StackKind,
    recorder: Recorder,
    storage: &dyn Storage,
    conduits: &[Box<dyn Conduit>],
) -> Result<SessionOutcome> {
    let mut ctx = begin(dlp, stack, recorder, storage)?;

    let conduit_failures = conduit::run_pipeline(conduits, dlp, &mut ctx, storage);

    let status = if conduit_failures == 0 {
        crate::dlp::requests::SYNC_STATUS_OK
    } else {
        crate::dlp::requests::SYNC_STATUS_ERROR
    };
    if let Err(e) = dlp.end_of_sync(status) {
        log::warn!("EndOfSync failed (device may stay on sync screen): {}", e);
    }

    Ok(SessionOutcome {
        user: ctx.storage_user().to_string(),
        sync_type: ctx.sync_type,
        conduit_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlp::DlpDateTime;
    use crate::storage::{MemoryStorage, SyncAnchor};

    fn device_user(last_sync_pc: u32, last_sync_unix: u64) -> UserInfo {
        UserInfo {
            user_id: 1,
            viewer_id: 0,
            last_sync_pc,
            succ_sync_date: DlpDateTime::from_unix(last_sync_unix),
            last_sync_date: DlpDateTime::from_unix(last_sync_unix),
            username: "alice".to_string(),
        }
    }

    fn known_storage(anchor_unix: u64) -> MemoryStorage {
        let storage = MemoryStorage::with_computer_id(0xDEADBEEF);
        storage.create_user_area("alice").unwrap();
        storage
            .write_sync_state(
                "alice",
                &SyncAnchor {
                    last_sync_pc: 0xDEADBEEF,
                    last_sync_anchor: DlpDateTime::from_unix(anchor_unix).as_anchor(),
                },
            )
            .unwrap();
        storage
    }

    #[test]
    fn test_unknown_device_is_first() {
        let storage = MemoryStorage::with_computer_id(0xDEADBEEF);
        let user = device_user(0, 0);
        assert_eq!(classify(&user, &storage).unwrap(), SyncType::First);
    }

    #[test]
    fn test_matching_anchors_is_fast() {
        let storage = known_storage(1_000_000_000);
        let user = device_user(0xDEADBEEF, 1_000_000_000);
        assert_eq!(classify(&user, &storage).unwrap(), SyncType::Fast);
    }

    #[test]
    fn test_diverged_anchors_is_slow() {
        let storage = known_storage(1_000_000_000);
        let user = device_user(0xDEADBEEF, 1_000_500_000);
        assert_eq!(classify(&user, &storage).unwrap(), SyncType::Slow);
    }

    #[test]
    fn test_other_host_is_slow() {
        let storage = known_storage(1_000_000_000);
        let user = device_user(0xCAFEBABE, 1_000_000_000);
        assert_eq!(classify(&user, &storage).unwrap(), SyncType::Slow);
    }

    #[test]
    fn test_known_user_without_anchor_is_first() {
        let storage = MemoryStorage::with_computer_id(0xDEADBEEF);
        storage.create_user_area("alice").unwrap();
        let user = device_user(0xDEADBEEF, 1_000_000_000);
        assert_eq!(classify(&user, &storage).unwrap(), SyncType::First);
    }
}
