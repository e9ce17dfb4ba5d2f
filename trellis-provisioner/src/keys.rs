//! Key material manager - create-or-reuse of network and application keys
//!
//! Key creation is idempotent: an "already exists" answer from the stack is
//! success with the existing key. Material is generated host-side and is
//! opaque to everything but the stack.

use std::collections::HashMap;

use rand::RngCore;
use tracing::{debug, info};

use trellis_proto::KeyIndex;

use crate::transport::{KeyStatus, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyRecord {
    pub index: KeyIndex,
    /// False when the stack already had a key at this index
    pub newly_created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationKeyRecord {
    pub netkey_index: KeyIndex,
    pub index: KeyIndex,
    pub newly_created: bool,
}

/// Tracks which key indices this process has already ensured, so repeat
/// calls stay off the transport entirely.
#[derive(Default)]
pub struct KeyMaterialManager {
    netkeys: HashMap<KeyIndex, NetworkKeyRecord>,
    appkeys: HashMap<(KeyIndex, KeyIndex), ApplicationKeyRecord>,
}

impl KeyMaterialManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_network_key<T: Transport>(
        &mut self,
        transport: &mut T,
        index: KeyIndex,
    ) -> Result<NetworkKeyRecord, TransportError> {
        if let Some(record) = self.netkeys.get(&index) {
            return Ok(*record);
        }

        let record = match transport.create_network_key(index, fresh_material())? {
            KeyStatus::Created => {
                info!(index, "created network key");
                NetworkKeyRecord { index, newly_created: true }
            }
            KeyStatus::AlreadyExists => {
                debug!(index, "network key already exists, reusing");
                NetworkKeyRecord { index, newly_created: false }
            }
        };

        self.netkeys.insert(index, record);
        Ok(record)
    }

    pub fn ensure_application_key<T: Transport>(
        &mut self,
        transport: &mut T,
        netkey_index: KeyIndex,
        index: KeyIndex,
    ) -> Result<ApplicationKeyRecord, TransportError> {
        if let Some(record) = self.appkeys.get(&(netkey_index, index)) {
            return Ok(*record);
        }

        let record =
            match transport.create_application_key(netkey_index, index, fresh_material())? {
                KeyStatus::Created => {
                    info!(netkey_index, index, "created application key");
                    ApplicationKeyRecord { netkey_index, index, newly_created: true }
                }
                KeyStatus::AlreadyExists => {
                    debug!(netkey_index, index, "application key already exists, reusing");
                    ApplicationKeyRecord { netkey_index, index, newly_created: false }
                }
            };

        self.appkeys.insert((netkey_index, index), record);
        Ok(record)
    }
}

/// Generate 16 random key bytes
fn fresh_material() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, RecordingStack};

    #[test]
    fn ensure_network_key_is_idempotent() {
        let mut stack = RecordingStack::new();
        let mut keys = KeyMaterialManager::new();

        let first = keys.ensure_network_key(&mut stack, 0).unwrap();
        let second = keys.ensure_network_key(&mut stack, 0).unwrap();

        assert!(first.newly_created);
        assert_eq!(first, second);
        // The second call never reached the stack.
        assert_eq!(stack.calls, vec![Call::CreateNetworkKey(0)]);
    }

    #[test]
    fn already_exists_is_success_not_an_error() {
        let mut stack = RecordingStack::new();
        stack.appkey_results.push_back(Ok(KeyStatus::AlreadyExists));
        let mut keys = KeyMaterialManager::new();

        let record = keys.ensure_application_key(&mut stack, 0, 0).unwrap();
        assert!(!record.newly_created);
        assert_eq!(stack.calls, vec![Call::CreateApplicationKey(0, 0)]);
    }

    #[test]
    fn rejected_key_creation_is_fatal() {
        let mut stack = RecordingStack::new();
        stack.netkey_results.push_back(Err(TransportError::Rejected {
            command: "create_network_key",
            status: trellis_proto::STATUS_NO_RESOURCES,
        }));

        let mut keys = KeyMaterialManager::new();
        assert!(keys.ensure_network_key(&mut stack, 0).is_err());

        // A failed ensure is not cached; the next attempt hits the stack again.
        let retry = keys.ensure_network_key(&mut stack, 0).unwrap();
        assert!(retry.newly_created);
        assert_eq!(stack.calls.len(), 2);
    }
}
