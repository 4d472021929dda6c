//! File-backed storage
//!
//! Layout under the configured root:
//!
//! ```text
//! root/
//!   computer-id              stable host identifier (hex)
//!   <user>/
//!     sync-state.toml        last-sync anchor
//!     backup/<name>          database blobs
//!     install/<name>         pending installs, consumed after delivery
//! ```

use super::{InstallEntry, Storage, SyncAnchor};
use crate::error::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("cannot create {}: {}", root.display(), e)))?;
        Ok(FileStorage { root })
    }

    fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(sanitize(user))
    }

    fn backup_dir(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("backup")
    }

    fn install_dir(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("install")
    }

    fn anchor_path(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("sync-state.toml")
    }
}

/// Database and user names come off the device; keep them filesystem-safe
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

impl Storage for FileStorage {
    fn create_user_area(&self, user: &str) -> Result<()> {
        fs::create_dir_all(self.backup_dir(user))?;
        fs::create_dir_all(self.install_dir(user))?;
        Ok(())
    }

    fn user_area_exists(&self, user: &str) -> Result<bool> {
        Ok(self.user_dir(user).is_dir())
    }

    fn list_databases(&self, user: &str) -> Result<Vec<String>> {
        let dir = self.backup_dir(user);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_database(&self, user: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.backup_dir(user).join(sanitize(name));
        fs::read(&path)
            .map_err(|e| Error::Storage(format!("cannot read {}: {}", path.display(), e)))
    }

    fn write_database(&self, user: &str, name: &str, data: &[u8]) -> Result<()> {
        self.create_user_area(user)?;
        let path = self.backup_dir(user).join(sanitize(name));
        fs::write(&path, data)
            .map_err(|e| Error::Storage(format!("cannot write {}: {}", path.display(), e)))
    }

    fn database_exists(&self, user: &str, name: &str) -> Result<bool> {
        Ok(self.backup_dir(user).join(sanitize(name)).is_file())
    }

    fn install_queue(&self, user: &str) -> Result<Vec<InstallEntry>> {
        let dir = self.install_dir(user);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            entries.push(InstallEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                data: fs::read(entry.path())?,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn consume_install_entry(&self, user: &str, name: &str) -> Result<()> {
        let path = self.install_dir(user).join(sanitize(name));
        fs::remove_file(&path)
            .map_err(|e| Error::Storage(format!("cannot remove {}: {}", path.display(), e)))
    }

    fn computer_id(&self) -> Result<u32> {
        let path = self.root.join("computer-id");
        if let Ok(text) = fs::read_to_string(&path)
            && let Ok(id) = u32::from_str_radix(text.trim(), 16)
        {
            return Ok(id);
        }

        // First run: derive a stable id from what identifies this host,
        // then persist it so later runs (and moved roots) keep it.
        let mut hasher = DefaultHasher::new();
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            hostname.hash(&mut hasher);
        }
        self.root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone())
            .hash(&mut hasher);
        let id = (hasher.finish() & 0xFFFF_FFFF) as u32;

        fs::write(&path, format!("{:08x}\n", id))?;
        log::info!("Generated computer id {:08x}", id);
        Ok(id)
    }

    fn read_sync_state(&self, user: &str) -> Result<Option<SyncAnchor>> {
        let path = self.anchor_path(user);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let anchor = basic_toml::from_str(&text)
            .map_err(|e| Error::Storage(format!("bad sync state {}: {}", path.display(), e)))?;
        Ok(Some(anchor))
    }

    fn write_sync_state(&self, user: &str, anchor: &SyncAnchor) -> Result<()> {
        self.create_user_area(user)?;
        let text = basic_toml::to_string(anchor)
            .map_err(|e| Error::Storage(format!("cannot serialize sync state: {}", e)))?;
        fs::write(self.anchor_path(user), text)?;
        Ok(())
    }
}
