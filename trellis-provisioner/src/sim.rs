//! Simulated mesh stack - a deterministic in-process bearer
//!
//! Drives the same state machines as a production bearer would, against a
//! virtual population of unprovisioned devices. Used by the CLI's
//! `--simulate` mode and by the end-to-end tests.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use trellis_proto::{
    Bearer, CompositionData, ConfigRequest, DeviceUuid, ElementDescriptor, KeyIndex,
    UnicastAddress, STATUS_DOES_NOT_EXIST,
};

use crate::ddb::DdbEntry;
use crate::event::{BusSender, StackEvent};
use crate::transport::{KeyStatus, Transport, TransportError};

/// One virtual unprovisioned device
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub uuid: DeviceUuid,
    pub bearer: Bearer,
    pub rssi: i8,
    pub composition: CompositionData,
    /// Provisioning failure code to inject, if any
    pub fail_provisioning: Option<u8>,
    /// Answer requests with this opcode with the given error status
    pub fail_request: Option<(u16, u8)>,
    /// Swallow requests with this opcode entirely (the host times out)
    pub drop_request: Option<u16>,
}

impl SimDevice {
    pub fn new(uuid: DeviceUuid) -> Self {
        Self {
            uuid,
            bearer: Bearer::Adv,
            rssi: -55,
            composition: composition_with_elements(1),
            fail_provisioning: None,
            fail_request: None,
            drop_request: None,
        }
    }

    pub fn with_elements(mut self, elements: u8) -> Self {
        self.composition = composition_with_elements(elements);
        self
    }

    pub fn failing_provisioning(mut self, reason: u8) -> Self {
        self.fail_provisioning = Some(reason);
        self
    }

    pub fn failing_request(mut self, opcode: u16, status: u8) -> Self {
        self.fail_request = Some((opcode, status));
        self
    }

    pub fn dropping_request(mut self, opcode: u16) -> Self {
        self.drop_request = Some(opcode);
        self
    }
}

fn composition_with_elements(count: u8) -> CompositionData {
    let mut elements = vec![ElementDescriptor {
        location: 0x0100,
        // Configuration server plus a generic on/off server on the primary.
        models: vec![0x0000, 0x1000],
    }];
    for i in 1..count {
        elements.push(ElementDescriptor { location: 0x0100 + i as u16, models: vec![0x1000] });
    }
    CompositionData {
        page: 0,
        company_id: 0x02FF,
        product_id: 0x0001,
        version_id: 0x0100,
        replay_cache_size: 32,
        features: 0x0003,
        elements,
    }
}

/// Builder for the virtual network
#[derive(Default)]
pub struct SimNetwork {
    devices: Vec<SimDevice>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: SimDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Populate with `count` plain single-element devices
    pub fn with_devices(mut self, count: usize) -> Self {
        for i in 0..count {
            self.devices.push(SimDevice::new(DeviceUuid::from_bytes([i as u8 + 1; 16])));
        }
        self
    }

    pub fn into_transport(self, events: BusSender) -> SimTransport {
        events.stack(StackEvent::SystemBooted { version: "sim 1.0".to_string() });
        SimTransport {
            events,
            unprovisioned: self.devices,
            nodes: HashMap::new(),
            ddb: HashMap::new(),
            netkeys: HashSet::new(),
            appkeys: HashSet::new(),
            scanning: false,
            next_address: 0x0100,
        }
    }
}

struct SimNode {
    composition: CompositionData,
    fail_request: Option<(u16, u8)>,
    drop_request: Option<u16>,
}

/// The simulated stack itself; commands in, events out
pub struct SimTransport {
    events: BusSender,
    unprovisioned: Vec<SimDevice>,
    nodes: HashMap<UnicastAddress, SimNode>,
    ddb: HashMap<DeviceUuid, DdbEntry>,
    netkeys: HashSet<KeyIndex>,
    appkeys: HashSet<(KeyIndex, KeyIndex)>,
    scanning: bool,
    next_address: u16,
}

impl SimTransport {
    pub fn ddb_entries(&self) -> Vec<&DdbEntry> {
        self.ddb.values().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn has_network_key(&self, index: KeyIndex) -> bool {
        self.netkeys.contains(&index)
    }
}

impl Transport for SimTransport {
    fn start_scan(&mut self, _bearer: Bearer) -> Result<(), TransportError> {
        self.scanning = true;
        // A touch of link housekeeping the adapter is expected to drop.
        self.events.stack(StackEvent::GattMtuExchanged { mtu: 247 });
        for device in &self.unprovisioned {
            self.events.stack(StackEvent::UnprovisionedBeacon {
                uuid: device.uuid,
                bearer: device.bearer,
                rssi: device.rssi,
            });
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.scanning = false;
        Ok(())
    }

    fn create_network_key(
        &mut self,
        index: KeyIndex,
        _material: [u8; 16],
    ) -> Result<KeyStatus, TransportError> {
        if self.netkeys.insert(index) {
            Ok(KeyStatus::Created)
        } else {
            Ok(KeyStatus::AlreadyExists)
        }
    }

    fn create_application_key(
        &mut self,
        netkey_index: KeyIndex,
        appkey_index: KeyIndex,
        _material: [u8; 16],
    ) -> Result<KeyStatus, TransportError> {
        if !self.netkeys.contains(&netkey_index) {
            return Err(TransportError::Rejected {
                command: "create_application_key",
                status: STATUS_DOES_NOT_EXIST,
            });
        }
        if self.appkeys.insert((netkey_index, appkey_index)) {
            Ok(KeyStatus::Created)
        } else {
            Ok(KeyStatus::AlreadyExists)
        }
    }

    fn start_provisioning(
        &mut self,
        netkey_index: KeyIndex,
        uuid: DeviceUuid,
    ) -> Result<(), TransportError> {
        if !self.netkeys.contains(&netkey_index) {
            return Err(TransportError::Rejected {
                command: "start_provisioning",
                status: STATUS_DOES_NOT_EXIST,
            });
        }
        let Some(position) = self.unprovisioned.iter().position(|d| d.uuid == uuid) else {
            return Err(TransportError::Rejected {
                command: "start_provisioning",
                status: STATUS_DOES_NOT_EXIST,
            });
        };

        self.events.stack(StackEvent::ProvisioningLinkOpened { uuid });

        let device = self.unprovisioned.remove(position);
        if let Some(reason) = device.fail_provisioning {
            self.events.stack(StackEvent::ProvisioningFailed { uuid, reason });
            // Still unprovisioned; it will beacon again on the next scan.
            self.unprovisioned.push(device);
            return Ok(());
        }

        let elements = device.composition.element_count();
        let address = UnicastAddress::new(self.next_address).expect("simulated address space exhausted");
        self.next_address += elements.max(1) as u16;

        let entry = DdbEntry { uuid, address, elements, netkey_index };
        self.ddb.insert(uuid, entry);
        self.nodes.insert(
            address,
            SimNode {
                composition: device.composition,
                fail_request: device.fail_request,
                drop_request: device.drop_request,
            },
        );
        self.events.stack(StackEvent::DeviceProvisioned { uuid, address, elements });
        Ok(())
    }

    fn send_config_request(
        &mut self,
        handle: u32,
        address: UnicastAddress,
        request: &ConfigRequest,
    ) -> Result<(), TransportError> {
        let opcode = request.opcode();

        let Some(node) = self.nodes.get(&address) else {
            // Nobody home: no response, the host's step timeout handles it.
            debug!(%address, "config request to an absent node");
            return Ok(());
        };

        if node.drop_request == Some(opcode) {
            debug!(%address, opcode, "dropping config request");
            return Ok(());
        }
        if let Some((failing, status)) = node.fail_request {
            if failing == opcode {
                self.events.stack(StackEvent::ConfigResponse {
                    handle,
                    status,
                    payload: Vec::new(),
                });
                return Ok(());
            }
        }

        let payload = match request {
            ConfigRequest::CompositionDataGet { .. } => node.composition.to_bytes(),
            _ => Vec::new(),
        };

        if matches!(request, ConfigRequest::NodeReset) {
            self.nodes.remove(&address);
        }

        self.events.stack(StackEvent::ConfigResponse { handle, status: 0, payload });
        Ok(())
    }

    fn add_ddb_entry(&mut self, entry: &DdbEntry) -> Result<(), TransportError> {
        self.ddb.insert(entry.uuid, entry.clone());
        Ok(())
    }

    fn delete_ddb_entry(&mut self, uuid: DeviceUuid) -> Result<(), TransportError> {
        self.ddb.remove(&uuid);
        Ok(())
    }

    fn list_ddb_entries(&mut self) -> Result<u16, TransportError> {
        let count = self.ddb.len() as u16;
        for entry in self.ddb.values() {
            self.events.stack(StackEvent::DdbEntryReported {
                uuid: entry.uuid,
                address: entry.address,
                elements: entry.elements,
                netkey_index: entry.netkey_index,
            });
        }
        self.events.stack(StackEvent::DdbListFinished { count });
        Ok(count)
    }

    fn reset_node(&mut self) -> Result<(), TransportError> {
        self.unprovisioned.clear();
        self.nodes.clear();
        self.ddb.clear();
        self.netkeys.clear();
        self.appkeys.clear();
        self.events.stack(StackEvent::NodeResetAcknowledged);
        Ok(())
    }

    fn hardware_reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
