//! In-memory storage for tests

use super::{InstallEntry, Storage, SyncAnchor};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct UserArea {
    databases: HashMap<String, Vec<u8>>,
    install_queue: Vec<InstallEntry>,
    anchor: Option<SyncAnchor>,
}

/// Storage backed by process memory
pub struct MemoryStorage {
    users: Mutex<HashMap<String, UserArea>>,
    computer_id: u32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_computer_id(0x50414C4D) // "PALM"
    }

    pub fn with_computer_id(computer_id: u32) -> Self {
        MemoryStorage {
            users: Mutex::new(HashMap::new()),
            computer_id,
        }
    }

    /// Queue an entry for the next install pass
    pub fn queue_install(&self, user: &str, name: &str, data: &[u8]) {
        let mut users = self.users.lock().unwrap();
        users
            .entry(user.to_string())
            .or_default()
            .install_queue
            .push(InstallEntry {
                name: name.to_string(),
                data: data.to_vec(),
            });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn create_user_area(&self, user: &str) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        users.entry(user.to_string()).or_default();
        Ok(())
    }

    fn user_area_exists(&self, user: &str) -> Result<bool> {
        Ok(self.users.lock().unwrap().contains_key(user))
    }

    fn list_databases(&self, user: &str) -> Result<Vec<String>> {
        let users = self.users.lock().unwrap();
        let mut names: Vec<String> = users
            .get(user)
            .map(|area| area.databases.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    fn read_database(&self, user: &str, name: &str) -> Result<Vec<u8>> {
        let users = self.users.lock().unwrap();
        users
            .get(user)
            .and_then(|area| area.databases.get(name))
            .cloned()
            .ok_or_else(|| Error::Storage(format!("database {} not found for {}", name, user)))
    }

    fn write_database(&self, user: &str, name: &str, data: &[u8]) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        users
            .entry(user.to_string())
            .or_default()
            .databases
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn database_exists(&self, user: &str, name: &str) -> Result<bool> {
        let users = self.users.lock().unwrap();
        Ok(users
            .get(user)
            .is_some_and(|area| area.databases.contains_key(name)))
    }

    fn install_queue(&self, user: &str) -> Result<Vec<InstallEntry>> {
        let users = self.users.lock().unwrap();
        Ok(users
            .get(user)
            .map(|area| area.install_queue.clone())
            .unwrap_or_default())
    }

    fn consume_install_entry(&self, user: &str, name: &str) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(area) = users.get_mut(user) {
            area.install_queue.retain(|entry| entry.name != name);
        }
        Ok(())
    }

    fn computer_id(&self) -> Result<u32> {
        Ok(self.computer_id)
    }

    fn read_sync_state(&self, user: &str) -> Result<Option<SyncAnchor>> {
        let users = self.users.lock().unwrap();
        Ok(users.get(user).and_then(|area| area.anchor))
    }

    fn write_sync_state(&self, user: &str, anchor: &SyncAnchor) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        users.entry(user.to_string()).or_default().anchor = Some(*anchor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_round_trip() {
        let storage = MemoryStorage::new();
        storage.create_user_area("alice").unwrap();
        storage.write_database("alice", "MemoDB", b"blob").unwrap();

        assert!(storage.database_exists("alice", "MemoDB").unwrap());
        assert_eq!(storage.read_database("alice", "MemoDB").unwrap(), b"blob");
        assert_eq!(storage.list_databases("alice").unwrap(), vec!["MemoDB"]);
    }

    #[test]
    fn test_install_queue_consume() {
        let storage = MemoryStorage::new();
        storage.queue_install("alice", "NewApp", b"prc");
        assert_eq!(storage.install_queue("alice").unwrap().len(), 1);

        storage.consume_install_entry("alice", "NewApp").unwrap();
        assert!(storage.install_queue("alice").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_user_is_empty() {
        let storage = MemoryStorage::new();
        assert!(!storage.user_area_exists("nobody").unwrap());
        assert!(storage.list_databases("nobody").unwrap().is_empty());
        assert!(storage.read_sync_state("nobody").unwrap().is_none());
    }
}
