//! Transport command sink - the seam between the core and the mesh bearer
//!
//! Every call returns an immediate accept/reject; actual outcomes arrive
//! later as events on the bus. Implementations own their I/O (the simulated
//! stack in [`crate::sim`] answers in-process; a production bearer would
//! forward to an NCP link).

use trellis_proto::{Bearer, ConfigRequest, DeviceUuid, KeyIndex, UnicastAddress};

use crate::ddb::DdbEntry;

/// Synchronous rejection from the command sink
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{command} rejected by stack (status 0x{status:04x})")]
    Rejected { command: &'static str, status: u16 },
    #[error("bearer is closed")]
    Closed,
}

/// Result of the synchronous key-creation commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Created,
    AlreadyExists,
}

pub trait Transport {
    fn start_scan(&mut self, bearer: Bearer) -> Result<(), TransportError>;

    fn stop_scan(&mut self) -> Result<(), TransportError>;

    fn create_network_key(
        &mut self,
        index: KeyIndex,
        material: [u8; 16],
    ) -> Result<KeyStatus, TransportError>;

    fn create_application_key(
        &mut self,
        netkey_index: KeyIndex,
        appkey_index: KeyIndex,
        material: [u8; 16],
    ) -> Result<KeyStatus, TransportError>;

    fn start_provisioning(
        &mut self,
        netkey_index: KeyIndex,
        uuid: DeviceUuid,
    ) -> Result<(), TransportError>;

    /// Issue one configuration request; `handle` correlates the eventual
    /// response event with the request.
    fn send_config_request(
        &mut self,
        handle: u32,
        address: UnicastAddress,
        request: &ConfigRequest,
    ) -> Result<(), TransportError>;

    fn add_ddb_entry(&mut self, entry: &DdbEntry) -> Result<(), TransportError>;

    fn delete_ddb_entry(&mut self, uuid: DeviceUuid) -> Result<(), TransportError>;

    /// Kick off DDB enumeration; entries and the completion marker arrive as
    /// events. Returns how many entries the store will report.
    fn list_ddb_entries(&mut self) -> Result<u16, TransportError>;

    /// Factory-reset the local stack's persistent state
    fn reset_node(&mut self) -> Result<(), TransportError>;

    fn hardware_reset(&mut self) -> Result<(), TransportError>;
}
