//! Provisioning session - discovery and the provisioning handshake
//!
//! One session drives exactly one scan-or-provision attempt. Transitions are
//! synchronous and deterministic: events in, effects out, no I/O.

use std::time::Duration;

use tracing::{debug, info, warn};

use trellis_proto::{Bearer, DeviceUuid, KeyIndex, ProvisioningFailure, UnicastAddress};

use crate::ddb::DdbEntry;
use crate::effect::{Command, Effect};
use crate::event::{Event, TimerKind};

/// An unprovisioned device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub uuid: DeviceUuid,
    pub bearer: Bearer,
    pub rssi: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    LinkOpening,
    Exchanging,
    Complete,
    Failed(ProvisioningFailure),
}

/// What the scan is for: collecting an inventory, or finding one device to
/// provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPurpose {
    Inventory,
    Target(DeviceUuid),
}

pub struct ProvisioningSession {
    purpose: ScanPurpose,
    state: SessionState,
    netkey_index: KeyIndex,
    appkey_index: KeyIndex,
    bearer: Bearer,
    observed: Vec<DeviceIdentity>,
    address: Option<UnicastAddress>,
    elements: u8,
}

impl ProvisioningSession {
    pub fn new(
        purpose: ScanPurpose,
        netkey_index: KeyIndex,
        appkey_index: KeyIndex,
        bearer: Bearer,
    ) -> Self {
        Self {
            purpose,
            state: SessionState::Idle,
            netkey_index,
            appkey_index,
            bearer,
            observed: Vec::new(),
            address: None,
            elements: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Devices observed so far, strongest signal kept per UUID
    pub fn devices(&self) -> &[DeviceIdentity] {
        &self.observed
    }

    pub fn address(&self) -> Option<UnicastAddress> {
        self.address
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Complete | SessionState::Failed(_))
    }

    /// Begin scanning. `window` is the inventory scan window, or for a
    /// targeted session the deadline for the target to appear.
    pub fn start(&mut self, window: Duration) -> Vec<Effect> {
        debug_assert_eq!(self.state, SessionState::Idle);
        self.state = SessionState::Scanning;

        let timer = match self.purpose {
            ScanPurpose::Inventory => TimerKind::ScanWindow,
            ScanPurpose::Target(_) => TimerKind::TargetWait,
        };

        vec![
            Effect::Command(Command::StartScan { bearer: self.bearer }),
            Effect::ArmTimer { kind: timer, after: window },
        ]
    }

    pub fn handle_event(&mut self, event: &Event) -> Vec<Effect> {
        match (self.state, event) {
            (SessionState::Scanning, Event::ScanReport { uuid, bearer, rssi }) => {
                self.record_observation(*uuid, *bearer, *rssi);

                if self.purpose == ScanPurpose::Target(*uuid) {
                    info!(uuid = %uuid, rssi, "target device observed, provisioning");
                    self.state = SessionState::LinkOpening;
                    vec![
                        Effect::Command(Command::StopScan),
                        Effect::EnsureKeys {
                            netkey_index: self.netkey_index,
                            appkey_index: self.appkey_index,
                        },
                        Effect::Command(Command::StartProvisioning {
                            netkey_index: self.netkey_index,
                            uuid: *uuid,
                        }),
                    ]
                } else {
                    Vec::new()
                }
            }

            (SessionState::Scanning, Event::TimerElapsed(TimerKind::ScanWindow))
                if self.purpose == ScanPurpose::Inventory =>
            {
                info!(devices = self.observed.len(), "scan window closed");
                self.state = SessionState::Complete;
                vec![Effect::Command(Command::StopScan)]
            }

            (SessionState::Scanning, Event::TimerElapsed(TimerKind::TargetWait)) => {
                warn!("target device never appeared");
                self.state = SessionState::Failed(ProvisioningFailure::Timeout);
                vec![Effect::Command(Command::StopScan)]
            }

            (SessionState::LinkOpening, Event::LinkOpened { uuid })
                if self.is_target(*uuid) =>
            {
                debug!(uuid = %uuid, "provisioning link open");
                self.state = SessionState::Exchanging;
                Vec::new()
            }

            (
                SessionState::LinkOpening | SessionState::Exchanging,
                Event::ProvisioningComplete { uuid, address, elements },
            ) if self.is_target(*uuid) => {
                info!(uuid = %uuid, address = %address, elements, "device provisioned");
                self.state = SessionState::Complete;
                self.address = Some(*address);
                self.elements = *elements;

                let entry = DdbEntry {
                    uuid: *uuid,
                    address: *address,
                    elements: *elements,
                    netkey_index: self.netkey_index,
                };
                vec![
                    Effect::PersistNode(entry),
                    Effect::StartConfiguration { address: *address, elements: *elements },
                ]
            }

            (
                SessionState::LinkOpening | SessionState::Exchanging,
                Event::ProvisioningFailed { uuid, reason },
            ) if self.is_target(*uuid) => {
                // No automatic retry; re-issuing the operation is the user's call.
                warn!(uuid = %uuid, %reason, "provisioning failed");
                self.state = SessionState::Failed(*reason);
                Vec::new()
            }

            _ => Vec::new(),
        }
    }

    /// Abort the session. The only supported host-side abort path.
    pub fn cancel(&mut self) -> Vec<Effect> {
        let effects = match self.state {
            SessionState::Scanning => vec![Effect::Command(Command::StopScan)],
            // The stack tears the provisioning link down once the host
            // abandons the session; there is no separate close command.
            _ => Vec::new(),
        };
        if !self.is_terminal() {
            self.state = SessionState::Failed(ProvisioningFailure::Cancelled);
        }
        effects
    }

    fn is_target(&self, uuid: DeviceUuid) -> bool {
        self.purpose == ScanPurpose::Target(uuid)
    }

    fn record_observation(&mut self, uuid: DeviceUuid, bearer: Bearer, rssi: i8) {
        match self.observed.iter_mut().find(|d| d.uuid == uuid) {
            Some(existing) => {
                if rssi > existing.rssi {
                    existing.rssi = rssi;
                    existing.bearer = bearer;
                }
            }
            None => {
                debug!(uuid = %uuid, %bearer, rssi, "unprovisioned device");
                self.observed.push(DeviceIdentity { uuid, bearer, rssi });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    fn uuid(n: u8) -> DeviceUuid {
        DeviceUuid::from_bytes([n; 16])
    }

    fn report(n: u8, rssi: i8) -> Event {
        Event::ScanReport { uuid: uuid(n), bearer: Bearer::Adv, rssi }
    }

    #[test]
    fn inventory_scan_collects_dedups_and_completes() {
        let mut session = ProvisioningSession::new(ScanPurpose::Inventory, 0, 0, Bearer::Adv);

        let effects = session.start(WINDOW);
        assert_eq!(effects[0], Effect::Command(Command::StartScan { bearer: Bearer::Adv }));
        assert!(matches!(effects[1], Effect::ArmTimer { kind: TimerKind::ScanWindow, .. }));

        assert!(session.handle_event(&report(1, -60)).is_empty());
        assert!(session.handle_event(&report(2, -80)).is_empty());
        // Same device again, louder: kept once with the stronger reading.
        assert!(session.handle_event(&report(1, -42)).is_empty());

        let effects = session.handle_event(&Event::TimerElapsed(TimerKind::ScanWindow));
        assert_eq!(effects, vec![Effect::Command(Command::StopScan)]);
        assert_eq!(session.state(), SessionState::Complete);

        assert_eq!(session.devices().len(), 2);
        assert_eq!(session.devices()[0].rssi, -42);
    }

    #[test]
    fn empty_scan_window_is_complete_not_failed() {
        let mut session = ProvisioningSession::new(ScanPurpose::Inventory, 0, 0, Bearer::Adv);
        session.start(WINDOW);

        session.handle_event(&Event::TimerElapsed(TimerKind::ScanWindow));
        assert_eq!(session.state(), SessionState::Complete);
        assert!(session.devices().is_empty());
    }

    #[test]
    fn target_observation_stops_scan_ensures_keys_then_provisions() {
        let mut session =
            ProvisioningSession::new(ScanPurpose::Target(uuid(7)), 0, 1, Bearer::Adv);
        session.start(WINDOW);

        // Some other device first: observed, not provisioned.
        assert!(session.handle_event(&report(3, -50)).is_empty());
        assert_eq!(session.state(), SessionState::Scanning);

        let effects = session.handle_event(&report(7, -55));
        assert_eq!(
            effects,
            vec![
                Effect::Command(Command::StopScan),
                Effect::EnsureKeys { netkey_index: 0, appkey_index: 1 },
                Effect::Command(Command::StartProvisioning { netkey_index: 0, uuid: uuid(7) }),
            ]
        );
        assert_eq!(session.state(), SessionState::LinkOpening);
    }

    #[test]
    fn handshake_completion_persists_and_hands_off() {
        let mut session =
            ProvisioningSession::new(ScanPurpose::Target(uuid(7)), 0, 0, Bearer::Adv);
        session.start(WINDOW);
        session.handle_event(&report(7, -55));

        session.handle_event(&Event::LinkOpened { uuid: uuid(7) });
        assert_eq!(session.state(), SessionState::Exchanging);

        let address = UnicastAddress::new(0x0042).unwrap();
        let effects = session.handle_event(&Event::ProvisioningComplete {
            uuid: uuid(7),
            address,
            elements: 3,
        });

        let entry = DdbEntry { uuid: uuid(7), address, elements: 3, netkey_index: 0 };
        assert_eq!(
            effects,
            vec![
                Effect::PersistNode(entry),
                Effect::StartConfiguration { address, elements: 3 },
            ]
        );
        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(session.address(), Some(address));
    }

    #[test]
    fn remote_failure_is_terminal_without_retry() {
        let mut session =
            ProvisioningSession::new(ScanPurpose::Target(uuid(7)), 0, 0, Bearer::Adv);
        session.start(WINDOW);
        session.handle_event(&report(7, -55));

        let effects = session.handle_event(&Event::ProvisioningFailed {
            uuid: uuid(7),
            reason: ProvisioningFailure::ConfirmationFailed,
        });
        assert!(effects.is_empty());
        assert_eq!(
            session.state(),
            SessionState::Failed(ProvisioningFailure::ConfirmationFailed)
        );
    }

    #[test]
    fn target_wait_expiry_fails_the_session() {
        let mut session =
            ProvisioningSession::new(ScanPurpose::Target(uuid(7)), 0, 0, Bearer::Adv);
        session.start(WINDOW);

        let effects = session.handle_event(&Event::TimerElapsed(TimerKind::TargetWait));
        assert_eq!(effects, vec![Effect::Command(Command::StopScan)]);
        assert_eq!(session.state(), SessionState::Failed(ProvisioningFailure::Timeout));
    }

    #[test]
    fn cancel_while_scanning_stops_the_scan() {
        let mut session = ProvisioningSession::new(ScanPurpose::Inventory, 0, 0, Bearer::Adv);
        session.start(WINDOW);

        let effects = session.cancel();
        assert_eq!(effects, vec![Effect::Command(Command::StopScan)]);
        assert_eq!(session.state(), SessionState::Failed(ProvisioningFailure::Cancelled));
    }

    #[test]
    fn events_for_other_devices_never_touch_the_handshake() {
        let mut session =
            ProvisioningSession::new(ScanPurpose::Target(uuid(7)), 0, 0, Bearer::Adv);
        session.start(WINDOW);
        session.handle_event(&report(7, -55));

        // A stray completion for a different UUID is ignored outright.
        let effects = session.handle_event(&Event::ProvisioningComplete {
            uuid: uuid(9),
            address: UnicastAddress::new(0x0099).unwrap(),
            elements: 1,
        });
        assert!(effects.is_empty());
        assert_eq!(session.state(), SessionState::LinkOpening);
    }
}
