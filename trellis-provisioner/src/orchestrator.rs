//! Command orchestrator - maps one requested operation onto the components
//!
//! Owns the single active provisioning session and configuration job for
//! their whole lifetime. Exactly one operation runs at a time; a second
//! request is rejected, not queued. All mutable state lives here, owned by
//! the run loop that drives `handle_event`.

use tracing::{debug, info, warn};

use trellis_proto::{CompositionData, DeviceUuid, UnicastAddress};

use crate::config::ProvisionerConfig;
use crate::ddb::{DdbClient, DdbEntry};
use crate::effect::{Command, Effect};
use crate::event::{Event, TimerKind};
use crate::job::{self, ConfigurationJob, JobResult, StepSpec};
use crate::session::{DeviceIdentity, ProvisioningSession, ScanPurpose, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Scan,
    Provision(DeviceUuid),
    ListNodes,
    NodeInfo(DeviceUuid),
    RemoveNode(DeviceUuid),
    FactoryReset,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Provision(uuid) => write!(f, "provision {uuid}"),
            Self::ListNodes => write!(f, "nodelist"),
            Self::NodeInfo(uuid) => write!(f, "nodeinfo {uuid}"),
            Self::RemoveNode(uuid) => write!(f, "remove {uuid}"),
            Self::FactoryReset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("operation '{running}' is already running; concurrent requests are rejected")]
    Busy { running: String },
}

/// Structured payload accompanying an outcome, for callers that want more
/// than the message line.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeDetail {
    None,
    Devices(Vec<DeviceIdentity>),
    Nodes(Vec<DdbEntry>),
    Composition(CompositionData),
}

/// The single terminal report every operation ends with
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    pub detail: OutcomeDetail,
}

impl Outcome {
    fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), detail: OutcomeDetail::None }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), detail: OutcomeDetail::None }
    }
}

/// Where a running operation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Scanning / provisioning handshake in progress
    Session,
    /// Configuration job running against the target node
    Configuring,
    /// Waiting for the DDB enumeration to finish
    Listing,
    /// Node reset issued, waiting for the acknowledgement
    AwaitingResetAck,
    /// Settle delay before the hardware reset
    Settling,
}

pub struct OrchestratorContext {
    cfg: ProvisionerConfig,
    running: Option<(Operation, Phase)>,
    session: Option<ProvisioningSession>,
    job: Option<ConfigurationJob>,
    ddb: DdbClient,
    next_job_id: u16,
    outcome: Option<Outcome>,
}

impl OrchestratorContext {
    pub fn new(cfg: ProvisionerConfig) -> Self {
        Self {
            cfg,
            running: None,
            session: None,
            job: None,
            ddb: DdbClient::new(),
            next_job_id: 0,
            outcome: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    pub fn ddb(&self) -> &DdbClient {
        &self.ddb
    }

    /// Terminal report of the finished operation, if any. Taking it resets
    /// the context to idle reporting-wise; the operation state was already
    /// torn down when the outcome was recorded.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    /// Start an operation. Rejected while another is running; the rejection
    /// leaves the running operation untouched.
    pub fn begin(&mut self, op: Operation) -> Result<Vec<Effect>, OrchestratorError> {
        if let Some((running, _)) = &self.running {
            return Err(OrchestratorError::Busy { running: running.to_string() });
        }

        info!(operation = %op, "starting operation");
        let (phase, effects) = match &op {
            Operation::Scan => {
                let mut session = ProvisioningSession::new(
                    ScanPurpose::Inventory,
                    self.cfg.netkey_index,
                    self.cfg.appkey_index,
                    self.cfg.bearer,
                );
                let effects = session.start(self.cfg.scan_window());
                self.session = Some(session);
                (Phase::Session, effects)
            }
            Operation::Provision(uuid) => {
                let mut session = ProvisioningSession::new(
                    ScanPurpose::Target(*uuid),
                    self.cfg.netkey_index,
                    self.cfg.appkey_index,
                    self.cfg.bearer,
                );
                let effects = session.start(self.cfg.target_wait());
                self.session = Some(session);
                (Phase::Session, effects)
            }
            Operation::ListNodes | Operation::NodeInfo(_) | Operation::RemoveNode(_) => {
                (Phase::Listing, vec![Effect::Command(self.ddb.begin_list())])
            }
            Operation::FactoryReset => {
                (Phase::AwaitingResetAck, vec![Effect::Command(Command::ResetNode)])
            }
        };

        self.running = Some((op, phase));
        Ok(effects)
    }

    pub fn handle_event(&mut self, event: &Event) -> Vec<Effect> {
        if let Event::StackBooted { version } = event {
            info!(version, "mesh stack booted");
            return Vec::new();
        }

        let Some((op, phase)) = self.running.clone() else {
            debug!(?event, "no operation running, ignoring event");
            return Vec::new();
        };

        match phase {
            Phase::Session => self.on_session_event(&op, event),
            Phase::Configuring => self.on_job_event(&op, event),
            Phase::Listing => self.on_listing_event(&op, event),
            Phase::AwaitingResetAck => {
                if matches!(event, Event::NodeResetAcknowledged) {
                    self.set_phase(Phase::Settling);
                    vec![Effect::ArmTimer {
                        kind: TimerKind::ResetSettle,
                        after: self.cfg.settle_delay(),
                    }]
                } else {
                    Vec::new()
                }
            }
            Phase::Settling => {
                if matches!(event, Event::TimerElapsed(TimerKind::ResetSettle)) {
                    // The process does not observe the reboot itself.
                    self.finish(Outcome::ok("factory reset complete, hardware reset issued"));
                    vec![Effect::Command(Command::HardwareReset)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Abort whatever is running. The session is cancelled cooperatively;
    /// anything else just reports a cancelled outcome.
    pub fn cancel(&mut self) -> Vec<Effect> {
        if self.running.is_none() {
            return Vec::new();
        }
        let effects = match self.session.as_mut() {
            Some(session) if !session.is_terminal() => session.cancel(),
            _ => Vec::new(),
        };
        self.finish(Outcome::failed("operation cancelled"));
        effects
    }

    /// Called by the run loop when an effect could not be executed
    pub(crate) fn fail_operation(&mut self, message: impl Into<String>) {
        self.finish(Outcome::failed(message));
    }

    fn on_session_event(&mut self, op: &Operation, event: &Event) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        let raw = session.handle_event(event);
        let state = session.state();
        let devices = session.devices().to_vec();

        let mut out = Vec::new();
        for effect in raw {
            match effect {
                Effect::PersistNode(entry) => {
                    out.push(Effect::Command(self.ddb.upsert(entry)));
                }
                Effect::StartConfiguration { address, elements: _ } => {
                    let uuid = match op {
                        Operation::Provision(uuid) => *uuid,
                        _ => unreachable!("only provision sessions hand off to configuration"),
                    };
                    debug!(%uuid, %address, "starting post-provisioning configuration");
                    let specs = job::provisioning_steps(
                        self.cfg.netkey_index,
                        self.cfg.appkey_index,
                        address,
                        &self.cfg.models,
                        self.cfg.step_timeout(),
                        self.cfg.read_retry_limit,
                    );
                    self.set_phase(Phase::Configuring);
                    out.extend(self.start_job(op, address, specs));
                }
                other => out.push(other),
            }
        }

        match (op, state) {
            (Operation::Scan, SessionState::Complete) => {
                let message = if devices.is_empty() {
                    "scan finished, no unprovisioned devices found".to_string()
                } else {
                    format!("scan finished, {} unprovisioned device(s) found", devices.len())
                };
                self.finish(Outcome {
                    success: true,
                    message,
                    detail: OutcomeDetail::Devices(devices),
                });
            }
            (_, SessionState::Failed(reason)) => {
                self.finish(Outcome::failed(format!("provisioning failed: {reason}")));
            }
            _ => {}
        }

        out
    }

    fn on_job_event(&mut self, op: &Operation, event: &Event) -> Vec<Effect> {
        let Some(job) = self.job.as_mut() else {
            return Vec::new();
        };

        let mut out = job.handle_event(event);
        if self.job.as_ref().is_some_and(|j| j.is_terminal()) {
            out.extend(self.finish_job(op));
        }
        out
    }

    fn on_listing_event(&mut self, op: &Operation, event: &Event) -> Vec<Effect> {
        match event {
            Event::DdbEntry(entry) => {
                self.ddb.on_entry(entry.clone());
                Vec::new()
            }
            Event::DdbListComplete { count } => {
                let entries = self.ddb.on_list_complete(*count);
                match op {
                    Operation::ListNodes => {
                        let message = if entries.is_empty() {
                            "device database is empty".to_string()
                        } else {
                            format!("{} node(s) in the device database", entries.len())
                        };
                        self.finish(Outcome {
                            success: true,
                            message,
                            detail: OutcomeDetail::Nodes(entries),
                        });
                        Vec::new()
                    }
                    Operation::NodeInfo(uuid) | Operation::RemoveNode(uuid) => {
                        let resolved = self.ddb.find_by_uuid(*uuid).map(|e| e.address);
                        let Some(address) = resolved else {
                            self.finish(Outcome::failed(format!(
                                "device {uuid} is not in the device database"
                            )));
                            return Vec::new();
                        };
                        let specs = match op {
                            Operation::NodeInfo(_) => job::node_info_steps(
                                self.cfg.step_timeout(),
                                self.cfg.read_retry_limit,
                            ),
                            _ => job::remove_node_steps(self.cfg.step_timeout()),
                        };
                        self.set_phase(Phase::Configuring);
                        self.start_job(op, address, specs)
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn start_job(
        &mut self,
        op: &Operation,
        address: UnicastAddress,
        specs: Vec<StepSpec>,
    ) -> Vec<Effect> {
        self.next_job_id += 1;
        let mut job = ConfigurationJob::new(self.next_job_id, address, specs);
        let mut effects = job.start();
        let terminal = job.is_terminal();
        self.job = Some(job);
        if terminal {
            effects.extend(self.finish_job(op));
        }
        effects
    }

    /// The job reached a terminal result; turn it into the operation outcome
    fn finish_job(&mut self, op: &Operation) -> Vec<Effect> {
        let Some(job) = self.job.take() else {
            return Vec::new();
        };
        let mut out = Vec::new();

        match op {
            Operation::Provision(uuid) => {
                let address = job.target();
                if job.result() == JobResult::Success {
                    self.finish(Outcome::ok(format!(
                        "provisioned {uuid} as {address}; {}",
                        job.summary()
                    )));
                } else {
                    self.finish(Outcome::failed(format!(
                        "provisioned {uuid} as {address}, but configuration did not finish cleanly: {}",
                        job.summary()
                    )));
                }
            }
            Operation::NodeInfo(uuid) => {
                if job.result() == JobResult::Success {
                    let composition = job
                        .step_response("composition data get")
                        .and_then(|bytes| CompositionData::from_bytes(bytes).ok());
                    match composition {
                        Some(dcd) => self.finish(Outcome {
                            success: true,
                            message: format!(
                                "node {uuid} at {}: {} element(s)",
                                job.target(),
                                dcd.element_count()
                            ),
                            detail: OutcomeDetail::Composition(dcd),
                        }),
                        None => self.finish(Outcome::failed(format!(
                            "node {uuid} answered with composition data that does not parse"
                        ))),
                    }
                } else {
                    self.finish(Outcome::failed(format!(
                        "node info query failed: {}",
                        job.summary()
                    )));
                }
            }
            Operation::RemoveNode(uuid) => {
                if job.result() == JobResult::Success {
                    out.push(Effect::Command(self.ddb.remove(*uuid)));
                    self.finish(Outcome::ok(format!("node {uuid} removed from the network")));
                } else {
                    self.finish(Outcome::failed(format!(
                        "node removal failed: {}",
                        job.summary()
                    )));
                }
            }
            other => {
                warn!(operation = %other, "configuration job finished under an unexpected operation");
                self.finish(Outcome::failed("internal operation mismatch"));
            }
        }

        out
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some((_, current)) = &mut self.running {
            *current = phase;
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        if outcome.success {
            info!(message = %outcome.message, "operation finished");
        } else {
            warn!(message = %outcome.message, "operation failed");
        }
        self.outcome = Some(outcome);
        self.running = None;
        self.session = None;
        self.job = None;
    }

    #[cfg(test)]
    fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| s.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_proto::{Bearer, ConfigStatus, ElementDescriptor, UnicastAddress};

    fn uuid(n: u8) -> DeviceUuid {
        DeviceUuid::from_bytes([n; 16])
    }

    fn ctx() -> OrchestratorContext {
        OrchestratorContext::new(ProvisionerConfig::default())
    }

    /// Handles of every config request in an effect batch, in issue order
    fn issued_handles(effects: &[Effect]) -> Vec<u32> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Command(Command::SendConfigRequest { handle, .. }) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    /// Answer every outstanding request with success until the job stops
    /// issuing new ones.
    fn drive_job_to_success(ctx: &mut OrchestratorContext, first: Vec<Effect>) -> Vec<Effect> {
        let mut pending = issued_handles(&first);
        let mut last = first;
        while let Some(handle) = pending.pop() {
            last = ctx.handle_event(&Event::StepResponse {
                handle,
                status: ConfigStatus::Success,
                payload: Vec::new(),
            });
            pending.extend(issued_handles(&last));
        }
        last
    }

    #[test]
    fn second_operation_is_rejected_without_disturbing_the_first() {
        let mut ctx = ctx();
        ctx.begin(Operation::Provision(uuid(1))).unwrap();
        ctx.handle_event(&Event::ScanReport { uuid: uuid(1), bearer: Bearer::Adv, rssi: -50 });
        assert_eq!(ctx.session_state(), Some(SessionState::LinkOpening));

        let err = ctx.begin(Operation::Provision(uuid(2))).unwrap_err();
        assert!(matches!(err, OrchestratorError::Busy { .. }));
        // The in-flight session did not move.
        assert_eq!(ctx.session_state(), Some(SessionState::LinkOpening));
        assert!(ctx.take_outcome().is_none());
    }

    #[test]
    fn scan_with_no_devices_ends_complete_and_empty() {
        let mut ctx = ctx();
        ctx.begin(Operation::Scan).unwrap();

        ctx.handle_event(&Event::TimerElapsed(TimerKind::ScanWindow));
        let outcome = ctx.take_outcome().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.detail, OutcomeDetail::Devices(Vec::new()));
        assert!(ctx.is_idle());
    }

    #[test]
    fn provision_scenario_ends_with_a_job_against_the_new_address() {
        let mut ctx = ctx();
        let target = uuid(0x0a);
        ctx.begin(Operation::Provision(target)).unwrap();

        let effects =
            ctx.handle_event(&Event::ScanReport { uuid: target, bearer: Bearer::Adv, rssi: -48 });
        assert!(effects.contains(&Effect::EnsureKeys { netkey_index: 0, appkey_index: 0 }));

        ctx.handle_event(&Event::LinkOpened { uuid: target });
        let address = UnicastAddress::new(0x0042).unwrap();
        let effects = ctx.handle_event(&Event::ProvisioningComplete {
            uuid: target,
            address,
            elements: 1,
        });

        // The node is persisted and the first configuration request targets
        // the assigned address.
        assert!(matches!(&effects[0], Effect::Command(Command::AddDdbEntry(e)) if e.address == address));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Command(Command::SendConfigRequest { address: a, .. }) if *a == address
        )));

        drive_job_to_success(&mut ctx, effects);
        let outcome = ctx.take_outcome().unwrap();
        assert!(outcome.success, "unexpected failure: {}", outcome.message);
        assert!(outcome.message.contains("0x0042"));
        assert_eq!(ctx.ddb().find_by_uuid(target).map(|e| e.address), Some(address));
    }

    #[test]
    fn provisioning_failure_event_fails_the_operation() {
        let mut ctx = ctx();
        let target = uuid(0x0b);
        ctx.begin(Operation::Provision(target)).unwrap();
        ctx.handle_event(&Event::ScanReport { uuid: target, bearer: Bearer::Adv, rssi: -48 });

        ctx.handle_event(&Event::ProvisioningFailed {
            uuid: target,
            reason: trellis_proto::ProvisioningFailure::DecryptionFailed,
        });

        let outcome = ctx.take_outcome().unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("decryption failed"));
    }

    #[test]
    fn nodelist_with_zero_entries_is_success() {
        let mut ctx = ctx();
        let effects = ctx.begin(Operation::ListNodes).unwrap();
        assert_eq!(effects, vec![Effect::Command(Command::ListDdbEntries)]);

        ctx.handle_event(&Event::DdbListComplete { count: 0 });
        let outcome = ctx.take_outcome().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.detail, OutcomeDetail::Nodes(Vec::new()));
    }

    #[test]
    fn remove_node_deletes_the_ddb_entry_exactly_once() {
        let mut ctx = ctx();
        let target = uuid(0x0c);
        let address = UnicastAddress::new(0x0010).unwrap();

        ctx.begin(Operation::RemoveNode(target)).unwrap();
        ctx.handle_event(&Event::DdbEntry(DdbEntry {
            uuid: target,
            address,
            elements: 1,
            netkey_index: 0,
        }));
        let effects = ctx.handle_event(&Event::DdbListComplete { count: 1 });

        // The eviction job targets the resolved address.
        let handles = issued_handles(&effects);
        assert_eq!(handles.len(), 1);

        let effects = ctx.handle_event(&Event::StepResponse {
            handle: handles[0],
            status: ConfigStatus::Success,
            payload: Vec::new(),
        });

        let deletes: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Command(Command::DeleteDdbEntry(u)) if *u == target))
            .collect();
        assert_eq!(deletes.len(), 1);

        let outcome = ctx.take_outcome().unwrap();
        assert!(outcome.success);
        assert!(ctx.ddb().find_by_uuid(target).is_none());
    }

    #[test]
    fn nodeinfo_for_unknown_device_fails_cleanly() {
        let mut ctx = ctx();
        ctx.begin(Operation::NodeInfo(uuid(0x0d))).unwrap();
        ctx.handle_event(&Event::DdbListComplete { count: 0 });

        let outcome = ctx.take_outcome().unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("not in the device database"));
    }

    #[test]
    fn nodeinfo_reports_parsed_composition_data() {
        let mut ctx = ctx();
        let target = uuid(0x0e);
        let address = UnicastAddress::new(0x0020).unwrap();

        ctx.begin(Operation::NodeInfo(target)).unwrap();
        ctx.handle_event(&Event::DdbEntry(DdbEntry {
            uuid: target,
            address,
            elements: 2,
            netkey_index: 0,
        }));
        let effects = ctx.handle_event(&Event::DdbListComplete { count: 1 });

        let dcd = CompositionData {
            page: 0,
            company_id: 0x02FF,
            product_id: 1,
            version_id: 1,
            replay_cache_size: 32,
            features: 0,
            elements: vec![
                ElementDescriptor { location: 0, models: vec![0x0000, 0x1000] },
                ElementDescriptor { location: 1, models: vec![0x1001] },
            ],
        };
        ctx.handle_event(&Event::StepResponse {
            handle: issued_handles(&effects)[0],
            status: ConfigStatus::Success,
            payload: dcd.to_bytes(),
        });

        let outcome = ctx.take_outcome().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.detail, OutcomeDetail::Composition(dcd));
    }

    #[test]
    fn factory_reset_waits_for_ack_then_settles_then_resets_hardware() {
        let mut ctx = ctx();
        let effects = ctx.begin(Operation::FactoryReset).unwrap();
        assert_eq!(effects, vec![Effect::Command(Command::ResetNode)]);

        let effects = ctx.handle_event(&Event::NodeResetAcknowledged);
        assert!(matches!(effects[0], Effect::ArmTimer { kind: TimerKind::ResetSettle, .. }));
        assert!(ctx.take_outcome().is_none());

        let effects = ctx.handle_event(&Event::TimerElapsed(TimerKind::ResetSettle));
        assert_eq!(effects, vec![Effect::Command(Command::HardwareReset)]);
        assert!(ctx.take_outcome().unwrap().success);
    }

    #[test]
    fn cancel_tears_down_a_scanning_session() {
        let mut ctx = ctx();
        ctx.begin(Operation::Scan).unwrap();

        let effects = ctx.cancel();
        assert_eq!(effects, vec![Effect::Command(Command::StopScan)]);
        let outcome = ctx.take_outcome().unwrap();
        assert!(!outcome.success);
        assert!(ctx.is_idle());
    }
}
