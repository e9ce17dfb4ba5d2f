//! Run loop - feeds the orchestrator from the event bus, executes effects
//!
//! Single consumer: every stack event and timer expiry funnels through one
//! queue, so all state mutation happens on this task and transitions stay
//! totally ordered. Effects are executed in the order the state machines
//! returned them; the first rejected command fails the operation.

use std::time::Duration;

use tracing::debug;

use crate::config::ProvisionerConfig;
use crate::ddb::DdbError;
use crate::effect::{Command, Effect};
use crate::event::{BusSender, EventBus, TimerKind};
use crate::keys::KeyMaterialManager;
use crate::orchestrator::{Operation, OrchestratorContext, OrchestratorError, Outcome};
use crate::transport::{Transport, TransportError};

pub struct Provisioner<T: Transport> {
    ctx: OrchestratorContext,
    keys: KeyMaterialManager,
    transport: T,
    bus: EventBus,
    sender: BusSender,
}

impl<T: Transport> Provisioner<T> {
    pub fn new(cfg: ProvisionerConfig, transport: T, bus: EventBus, sender: BusSender) -> Self {
        Self {
            ctx: OrchestratorContext::new(cfg),
            keys: KeyMaterialManager::new(),
            transport,
            bus,
            sender,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one operation to its terminal outcome
    pub async fn run(&mut self, op: Operation) -> Result<Outcome, OrchestratorError> {
        let effects = self.ctx.begin(op)?;
        self.apply(effects);

        loop {
            if let Some(outcome) = self.ctx.take_outcome() {
                return Ok(outcome);
            }

            match self.bus.recv().await {
                Some(event) => {
                    let effects = self.ctx.handle_event(&event);
                    self.apply(effects);
                }
                None => {
                    self.ctx.fail_operation("event stream closed by the bearer");
                }
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Command(command) => {
                    let is_store_command = matches!(
                        command,
                        Command::AddDdbEntry(_) | Command::DeleteDdbEntry(_) | Command::ListDdbEntries
                    );
                    if let Err(e) = self.execute(command) {
                        let message = if is_store_command {
                            DdbError::Store(e).to_string()
                        } else {
                            e.to_string()
                        };
                        self.ctx.fail_operation(message);
                        break;
                    }
                }

                Effect::EnsureKeys { netkey_index, appkey_index } => {
                    let result = self.keys.ensure_network_key(&mut self.transport, netkey_index);
                    let result = result.and_then(|_| {
                        self.keys.ensure_application_key(
                            &mut self.transport,
                            netkey_index,
                            appkey_index,
                        )
                    });
                    if let Err(e) = result {
                        self.ctx.fail_operation(format!("key setup failed: {e}"));
                        break;
                    }
                }

                Effect::ArmTimer { kind, after } => self.arm_timer(kind, after),

                // Session-internal effects are rewritten by the orchestrator
                // before they get here.
                Effect::PersistNode(_) | Effect::StartConfiguration { .. } => {
                    debug!("ignoring orchestrator-internal effect");
                }
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<(), TransportError> {
        match command {
            Command::StartScan { bearer } => self.transport.start_scan(bearer),
            Command::StopScan => self.transport.stop_scan(),
            Command::StartProvisioning { netkey_index, uuid } => {
                self.transport.start_provisioning(netkey_index, uuid)
            }
            Command::SendConfigRequest { handle, address, request } => {
                self.transport.send_config_request(handle, address, &request)
            }
            Command::AddDdbEntry(entry) => self.transport.add_ddb_entry(&entry),
            Command::DeleteDdbEntry(uuid) => self.transport.delete_ddb_entry(uuid),
            Command::ListDdbEntries => self.transport.list_ddb_entries().map(|_| ()),
            Command::ResetNode => self.transport.reset_node(),
            Command::HardwareReset => self.transport.hardware_reset(),
        }
    }

    /// Single-shot timer whose expiry is delivered through the event queue
    fn arm_timer(&self, kind: TimerKind, after: Duration) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            sender.timer(kind);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StackEvent;
    use crate::test_support::{Call, RecordingStack};

    fn quick_config() -> ProvisionerConfig {
        ProvisionerConfig { settle_delay_ms: 10, ..Default::default() }
    }

    #[tokio::test]
    async fn factory_reset_acks_settles_then_hard_resets() {
        let (sender, bus) = EventBus::channel();
        let mut provisioner =
            Provisioner::new(quick_config(), RecordingStack::new(), bus, sender.clone());

        // The stack acknowledges as soon as the reset command lands.
        sender.stack(StackEvent::NodeResetAcknowledged);

        let outcome = provisioner.run(Operation::FactoryReset).await.unwrap();
        assert!(outcome.success);
        assert_eq!(provisioner.transport().calls, vec![Call::ResetNode, Call::HardwareReset]);
    }

    #[tokio::test]
    async fn rejected_command_fails_the_operation_immediately() {
        let (sender, bus) = EventBus::channel();
        let mut stack = RecordingStack::new();
        stack.fail_next = Some(TransportError::Rejected {
            command: "start_scan",
            status: trellis_proto::STATUS_BUSY,
        });
        let mut provisioner = Provisioner::new(quick_config(), stack, bus, sender);

        let outcome = provisioner.run(Operation::Scan).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("start_scan"));
    }

    #[tokio::test]
    async fn stale_timer_events_do_not_disturb_the_next_operation() {
        let (sender, bus) = EventBus::channel();
        let mut provisioner =
            Provisioner::new(quick_config(), RecordingStack::new(), bus, sender.clone());

        // A leftover scan-window timer from a finished operation sits in the
        // queue when the factory reset starts; it must be ignored.
        sender.timer(TimerKind::ScanWindow);
        sender.stack(StackEvent::NodeResetAcknowledged);

        let outcome = provisioner.run(Operation::FactoryReset).await.unwrap();
        assert!(outcome.success);
        assert_eq!(provisioner.transport().calls, vec![Call::ResetNode, Call::HardwareReset]);
    }
}
