//! Effects - what a state transition wants done, as data
//!
//! Transition functions never touch the transport; they return effects and
//! the run loop executes them in order, stopping at the first rejection.

use std::time::Duration;

use trellis_proto::{Bearer, ConfigRequest, DeviceUuid, KeyIndex, UnicastAddress};

use crate::ddb::DdbEntry;
use crate::event::TimerKind;

/// A transport command, mirroring the sink methods one to one
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartScan { bearer: Bearer },
    StopScan,
    StartProvisioning { netkey_index: KeyIndex, uuid: DeviceUuid },
    SendConfigRequest { handle: u32, address: UnicastAddress, request: ConfigRequest },
    AddDdbEntry(DdbEntry),
    DeleteDdbEntry(DeviceUuid),
    ListDdbEntries,
    ResetNode,
    HardwareReset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Command(Command),
    /// Create-or-reuse the network and application keys before provisioning.
    /// Executed synchronously by the run loop; failure is fatal to the
    /// operation.
    EnsureKeys { netkey_index: KeyIndex, appkey_index: KeyIndex },
    /// Arm a single-shot timer whose expiry comes back through the event bus
    ArmTimer { kind: TimerKind, after: Duration },
    /// Session-internal: record a freshly provisioned node. The orchestrator
    /// rewrites this into a store command plus a snapshot update; the run
    /// loop never sees it.
    PersistNode(DdbEntry),
    /// Session-internal: hand the new node over to the configuration job
    /// engine. Also rewritten by the orchestrator.
    StartConfiguration { address: UnicastAddress, elements: u8 },
}
