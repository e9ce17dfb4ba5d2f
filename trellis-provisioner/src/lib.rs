//! Trellis provisioner core
//!
//! Discovers unprovisioned mesh nodes, drives the provisioning handshake and
//! runs an ordered, retry-capable configuration job against each freshly
//! joined node. All control logic lives in synchronous state machines that
//! turn events into effects; the tokio run loop in [`runtime`] feeds them
//! from a single event queue and executes the effects against a
//! [`transport::Transport`].
//!
//! # Example
//!
//! ```ignore
//! use trellis_provisioner::{EventBus, Operation, Provisioner, ProvisionerConfig, SimNetwork};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (sender, bus) = EventBus::channel();
//!     let transport = SimNetwork::new().with_devices(2).into_transport(sender.clone());
//!     let mut provisioner = Provisioner::new(ProvisionerConfig::default(), transport, bus, sender);
//!
//!     let outcome = provisioner.run(Operation::Scan).await.unwrap();
//!     println!("{}", outcome.message);
//! }
//! ```

pub mod config;
pub mod ddb;
pub mod effect;
pub mod event;
pub mod job;
pub mod keys;
pub mod orchestrator;
pub mod runtime;
pub mod session;
pub mod sim;
pub mod transport;

pub use config::{ModelConfig, ProvisionerConfig};
pub use ddb::{DdbClient, DdbEntry, DdbError};
pub use effect::{Command, Effect};
pub use event::{Event, EventBus, BusSender, StackEvent, TimerKind};
pub use job::{ConfigurationJob, JobResult, StepSpec};
pub use keys::{ApplicationKeyRecord, KeyMaterialManager, NetworkKeyRecord};
pub use orchestrator::{Operation, OrchestratorContext, OrchestratorError, Outcome, OutcomeDetail};
pub use runtime::Provisioner;
pub use session::{DeviceIdentity, ProvisioningSession, ScanPurpose, SessionState};
pub use sim::{SimDevice, SimNetwork, SimTransport};
pub use transport::{KeyStatus, Transport, TransportError};
