//! Device database client - the provisioner's record of admitted nodes
//!
//! The store itself lives behind the transport; this client translates
//! add/remove intents into store commands and reconciles the entry-by-entry
//! enumeration events into one snapshot. Every enumeration re-synchronizes
//! the snapshot from scratch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use trellis_proto::{DeviceUuid, KeyIndex, UnicastAddress};

use crate::effect::Command;
use crate::transport::TransportError;

/// Persisted record of one provisioned node, keyed by its device UUID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdbEntry {
    pub uuid: DeviceUuid,
    pub address: UnicastAddress,
    pub elements: u8,
    pub netkey_index: KeyIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DdbError {
    #[error("device database store failure: {0}")]
    Store(#[from] TransportError),
    #[error("device {0} is not in the device database")]
    UnknownDevice(DeviceUuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Idle,
    Collecting { received: u16 },
    Synced,
}

/// Client over the external UUID-keyed store
pub struct DdbClient {
    entries: HashMap<DeviceUuid, DdbEntry>,
    list: ListState,
}

impl Default for DdbClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DdbClient {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), list: ListState::Idle }
    }

    /// Record a node and return the store command that persists it
    pub fn upsert(&mut self, entry: DdbEntry) -> Command {
        self.entries.insert(entry.uuid, entry.clone());
        Command::AddDdbEntry(entry)
    }

    /// Forget a node and return the store command that deletes it
    pub fn remove(&mut self, uuid: DeviceUuid) -> Command {
        self.entries.remove(&uuid);
        Command::DeleteDdbEntry(uuid)
    }

    pub fn find_by_uuid(&self, uuid: DeviceUuid) -> Option<&DdbEntry> {
        self.entries.get(&uuid)
    }

    /// Begin re-enumerating the store; discards the current snapshot
    pub fn begin_list(&mut self) -> Command {
        self.entries.clear();
        self.list = ListState::Collecting { received: 0 };
        Command::ListDdbEntries
    }

    /// One entry reported by the store during enumeration
    pub fn on_entry(&mut self, entry: DdbEntry) {
        match self.list {
            ListState::Collecting { received } => {
                self.list = ListState::Collecting { received: received + 1 };
                self.entries.insert(entry.uuid, entry);
            }
            // An entry with no enumeration in progress still updates the
            // snapshot so a late straggler is not lost.
            _ => {
                self.entries.insert(entry.uuid, entry);
            }
        }
    }

    /// The store finished enumerating; returns the collected snapshot
    /// ordered by unicast address.
    pub fn on_list_complete(&mut self, count: u16) -> Vec<DdbEntry> {
        if let ListState::Collecting { received } = self.list {
            if received != count {
                warn!(received, count, "device database reported a different entry count than it delivered");
            }
        }
        self.list = ListState::Synced;

        let mut entries: Vec<DdbEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.address);
        entries
    }

    /// True once an enumeration has completed since construction
    pub fn is_synced(&self) -> bool {
        self.list == ListState::Synced
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u8, address: u16) -> DdbEntry {
        DdbEntry {
            uuid: DeviceUuid::from_bytes([n; 16]),
            address: UnicastAddress::new(address).unwrap(),
            elements: 1,
            netkey_index: 0,
        }
    }

    #[test]
    fn upsert_then_find_round_trips() {
        let mut ddb = DdbClient::new();
        let e = entry(1, 0x0010);
        let cmd = ddb.upsert(e.clone());

        assert_eq!(cmd, Command::AddDdbEntry(e.clone()));
        assert_eq!(ddb.find_by_uuid(e.uuid), Some(&e));
    }

    #[test]
    fn remove_then_find_returns_none() {
        let mut ddb = DdbClient::new();
        let e = entry(1, 0x0010);
        ddb.upsert(e.clone());

        let cmd = ddb.remove(e.uuid);
        assert_eq!(cmd, Command::DeleteDdbEntry(e.uuid));
        assert_eq!(ddb.find_by_uuid(e.uuid), None);
    }

    #[test]
    fn enumeration_rebuilds_the_snapshot() {
        let mut ddb = DdbClient::new();
        ddb.upsert(entry(9, 0x0999));

        assert_eq!(ddb.begin_list(), Command::ListDdbEntries);
        assert!(ddb.is_empty());

        ddb.on_entry(entry(2, 0x0020));
        ddb.on_entry(entry(1, 0x0010));
        let listed = ddb.on_list_complete(2);

        assert!(ddb.is_synced());
        assert_eq!(listed, vec![entry(1, 0x0010), entry(2, 0x0020)]);
    }

    #[test]
    fn zero_entries_is_a_valid_synced_state() {
        let mut ddb = DdbClient::new();
        ddb.begin_list();
        assert_eq!(ddb.on_list_complete(0), Vec::new());
        assert!(ddb.is_synced());
    }
}
