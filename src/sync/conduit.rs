//! Conduit pipeline
//!
//! A conduit is one synchronization step run against the open DLP
//! connection. Conduits run sequentially; a failing conduit is logged and
//! the rest still run, so one broken step never strands the device on the
//! sync screen.

use super::session::{SessionContext, SyncType};
use crate::dlp::{DlpConnection, RecordInfo, requests};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// One pluggable synchronization step
pub trait Conduit: Send {
    fn name(&self) -> &str;

    fn execute(
        &self,
        dlp: &mut DlpConnection,
        ctx: &mut SessionContext,
        storage: &dyn Storage,
    ) -> Result<()>;
}

/// Run every conduit in order; returns the number of failures
pub fn run_pipeline(
    conduits: &[Box<dyn Conduit>],
    dlp: &mut DlpConnection,
    ctx: &mut SessionContext,
    storage: &dyn Storage,
) -> usize {
    let mut failures = 0;
    for conduit in conduits {
        log::info!("Conduit: {}", conduit.name());
        match conduit.execute(dlp, ctx, storage) {
            Ok(()) => log::debug!("Conduit {} done", conduit.name()),
            Err(e) => {
                failures += 1;
                log::error!("Conduit {} failed: {}", conduit.name(), e);
            }
        }
    }
    failures
}

/// The standard pipeline: install queue, download, anchors
pub fn default_pipeline() -> Vec<Box<dyn Conduit>> {
    vec![
        Box::new(InstallConduit),
        Box::new(DownloadConduit),
        Box::new(UpdateUserInfoConduit),
    ]
}

// ============================================================================
// Record archives
//
// The host-side snapshot of a database's records. Assembling real PDB
// files out of these is the external file-format layer's job; storage
// only sees the archive blob.
// ============================================================================

const ARCHIVE_MAGIC: &[u8; 4] = b"PSRA";

pub fn archive_records(records: &[RecordInfo]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ARCHIVE_MAGIC);
    out.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for record in records {
        out.extend_from_slice(&record.record_id.to_be_bytes());
        out.push(record.attributes);
        out.push(record.category);
        out.extend_from_slice(&(record.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&record.data);
    }
    out
}

pub fn parse_archive(data: &[u8]) -> Result<Vec<RecordInfo>> {
    if data.len() < 6 || &data[..4] != ARCHIVE_MAGIC {
        return Err(Error::Storage("not a record archive".to_string()));
    }
    let count = u16::from_be_bytes([data[4], data[5]]) as usize;
    let mut records = Vec::with_capacity(count);
    let mut pos = 6;
    for _ in 0..count {
        if data.len() < pos + 10 {
            return Err(Error::Storage("truncated record archive".to_string()));
        }
        let record_id = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let attributes = data[pos + 4];
        let category = data[pos + 5];
        let len =
            u32::from_be_bytes([data[pos + 6], data[pos + 7], data[pos + 8], data[pos + 9]]) as usize;
        pos += 10;
        if data.len() < pos + len {
            return Err(Error::Storage("truncated record archive".to_string()));
        }
        records.push(RecordInfo {
            record_id,
            index: 0,
            attributes,
            category,
            data: data[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(records)
}

/// Replace or append records by id
fn merge_records(existing: &mut Vec<RecordInfo>, updates: Vec<RecordInfo>) {
    for update in updates {
        match existing.iter_mut().find(|r| r.record_id == update.record_id) {
            Some(slot) => *slot = update,
            None => existing.push(update),
        }
    }
}

// ============================================================================
// Built-in conduits
// ============================================================================

/// Deliver pending installs from the storage queue to the device
pub struct InstallConduit;

/// Creator/type stamped onto freshly installed databases until the
/// file-format layer supplies real ones
const INSTALL_CREATOR: [u8; 4] = *b"psyn";
const INSTALL_TYPE: [u8; 4] = *b"DATA";

impl Conduit for InstallConduit {
    fn name(&self) -> &str {
        "install"
    }

    fn execute(
        &self,
        dlp: &mut DlpConnection,
        ctx: &mut SessionContext,
        storage: &dyn Storage,
    ) -> Result<()> {
        let user = ctx.storage_user().to_string();
        let queue = storage.install_queue(&user)?;
        if queue.is_empty() {
            return Ok(());
        }

        for entry in queue {
            log::info!("Installing {} ({} bytes)", entry.name, entry.data.len());

            // A stale copy on the device blocks CreateDB
            match dlp.delete_db(0, &entry.name) {
                Ok(()) | Err(Error::Dlp(crate::dlp::STATUS_NOT_FOUND)) => {}
                Err(e) => return Err(e),
            }

            let handle =
                dlp.create_db(INSTALL_CREATOR, INSTALL_TYPE, 0, 1, &entry.name)?;
            let result = dlp.write_record(handle, 0, 0, 0, &entry.data);
            dlp.close_db(handle)?;
            result?;

            storage.consume_install_entry(&user, &entry.name)?;
        }
        Ok(())
    }
}

/// Pull device databases into storage according to the sync type
pub struct DownloadConduit;

impl DownloadConduit {
    fn download_full(&self, dlp: &mut DlpConnection, name: &str) -> Result<Vec<RecordInfo>> {
        let handle = dlp.open_db(0, requests::OPEN_READ | requests::OPEN_SECRET, name)?;
        let result = self.read_all(dlp, handle);
        dlp.close_db(handle)?;
        result
    }

    fn read_all(&self, dlp: &mut DlpConnection, handle: u8) -> Result<Vec<RecordInfo>> {
        let count = dlp.read_open_db_info(handle)?;
        let mut records = Vec::with_capacity(count as usize);
        for index in 0..count {
            records.push(dlp.read_record_by_index(handle, index)?);
        }
        Ok(records)
    }

    fn download_modified(&self, dlp: &mut DlpConnection, name: &str) -> Result<Vec<RecordInfo>> {
        let handle = dlp.open_db(
            0,
            requests::OPEN_READ | requests::OPEN_WRITE | requests::OPEN_SECRET,
            name,
        )?;
        let mut records = Vec::new();
        let result = loop {
            match dlp.read_next_modified_rec(handle) {
                Ok(record) => records.push(record),
                Err(Error::Dlp(crate::dlp::STATUS_NOT_FOUND)) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if result.is_ok() && !records.is_empty() {
            dlp.reset_sync_flags(handle)?;
        }
        dlp.close_db(handle)?;
        result?;
        Ok(records)
    }
}

impl Conduit for DownloadConduit {
    fn name(&self) -> &str {
        "download"
    }

    fn execute(
        &self,
        dlp: &mut DlpConnection,
        ctx: &mut SessionContext,
        storage: &dyn Storage,
    ) -> Result<()> {
        let user = ctx.storage_user().to_string();
        storage.create_user_area(&user)?;

        dlp.open_conduit()?;
        let databases = dlp.read_db_list()?;
        log::info!("Device lists {} databases", databases.len());
        ctx.databases = databases.clone();

        for db in &databases {
            if db.is_resource() {
                // Resource databases (PRC) go through the install path only
                log::debug!("Skipping resource database {}", db.name);
                continue;
            }

            match ctx.sync_type {
                SyncType::First => {
                    let records = self.download_full(dlp, &db.name)?;
                    log::info!("{}: {} records", db.name, records.len());
                    storage.write_database(&user, &db.name, &archive_records(&records))?;
                }
                SyncType::Fast => {
                    let updates = self.download_modified(dlp, &db.name)?;
                    if updates.is_empty() {
                        continue;
                    }
                    log::info!("{}: {} modified records", db.name, updates.len());
                    let mut records = match storage.read_database(&user, &db.name) {
                        Ok(blob) => parse_archive(&blob)?,
                        Err(_) => Vec::new(),
                    };
                    merge_records(&mut records, updates);
                    storage.write_database(&user, &db.name, &archive_records(&records))?;
                }
                SyncType::Slow => {
                    // Anchors diverged: trust nothing, compare everything
                    let device_records = self.download_full(dlp, &db.name)?;
                    let mut records = match storage.read_database(&user, &db.name) {
                        Ok(blob) => parse_archive(&blob)?,
                        Err(_) => Vec::new(),
                    };
                    merge_records(&mut records, device_records);
                    storage.write_database(&user, &db.name, &archive_records(&records))?;
                }
            }
        }
        Ok(())
    }
}

/// Write fresh anchors to both the device and local storage
pub struct UpdateUserInfoConduit;

impl Conduit for UpdateUserInfoConduit {
    fn name(&self) -> &str {
        "update-user-info"
    }

    fn execute(
        &self,
        dlp: &mut DlpConnection,
        ctx: &mut SessionContext,
        storage: &dyn Storage,
    ) -> Result<()> {
        let user = ctx.storage_user().to_string();
        let computer_id = storage.computer_id()?;
        let now = crate::dlp::DlpDateTime::now();

        dlp.write_user_info(&ctx.user, computer_id, now)?;
        storage.write_sync_state(
            &user,
            &crate::storage::SyncAnchor {
                last_sync_pc: computer_id,
                last_sync_anchor: now.as_anchor(),
            },
        )?;

        let entry = format!("{} sync with {} completed\n", ctx.sync_type, user);
        dlp.add_sync_log_entry(&entry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, data: &[u8]) -> RecordInfo {
        RecordInfo {
            record_id: id,
            index: 0,
            attributes: 0,
            category: 0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_archive_round_trip() {
        let records = vec![record(1, b"first"), record(2, b""), record(3, b"third")];
        let blob = archive_records(&records);
        let parsed = parse_archive(&blob).unwrap();

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].record_id, 1);
        assert_eq!(parsed[0].data, b"first");
        assert_eq!(parsed[1].data, b"");
        assert_eq!(parsed[2].record_id, 3);
    }

    #[test]
    fn test_archive_rejects_garbage() {
        assert!(parse_archive(b"nope").is_err());
        assert!(parse_archive(b"PSRA\x00\x02").is_err()); // claims 2 records, has none
    }

    #[test]
    fn test_merge_replaces_by_id() {
        let mut existing = vec![record(1, b"old"), record(2, b"keep")];
        merge_records(&mut existing, vec![record(1, b"new"), record(9, b"added")]);

        assert_eq!(existing.len(), 3);
        assert_eq!(existing[0].data, b"new");
        assert_eq!(existing[1].data, b"keep");
        assert_eq!(existing[2].record_id, 9);
    }
}
