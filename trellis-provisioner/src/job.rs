//! Configuration job engine - ordered, retry-capable request sequences
//!
//! A job runs its steps strictly in order: step N+1 is never issued until
//! step N completed or failed terminally. At most one request is in flight
//! per job; responses and timeouts are correlated by request handle, so
//! stale events from an earlier attempt can never touch a live step.

use std::time::Duration;

use tracing::{debug, info, warn};

use trellis_proto::{ConfigRequest, KeyIndex, UnicastAddress};

use crate::config::ModelConfig;
use crate::effect::{Command, Effect};
use crate::event::{Event, TimerKind};

/// One request/response unit inside a job
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub name: &'static str,
    pub request: ConfigRequest,
    /// Extra attempts after the first; 0 means a single attempt.
    /// Configuration writes default to 0 so nothing is applied twice against
    /// a live node without the caller's knowledge.
    pub retry_limit: u8,
    pub timeout: Duration,
    /// A blocking step that fails terminally fails the whole job; a
    /// non-blocking step only degrades the result to partial failure.
    pub blocking: bool,
}

impl StepSpec {
    pub fn new(name: &'static str, request: ConfigRequest, timeout: Duration) -> Self {
        Self { name, request, retry_limit: 0, timeout, blocking: true }
    }

    pub fn with_retries(mut self, retry_limit: u8) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn independent(mut self) -> Self {
        self.blocking = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepState {
    Pending,
    InFlight { handle: u32 },
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub spec: StepSpec,
    state: StepState,
    attempts: u8,
    response: Vec<u8>,
    last_error: Option<String>,
}

impl Step {
    fn new(spec: StepSpec) -> Self {
        Self { spec, state: StepState::Pending, attempts: 0, response: Vec::new(), last_error: None }
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn completed(&self) -> bool {
        self.state == StepState::Completed
    }

    pub fn failed(&self) -> bool {
        self.state == StepState::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Pending,
    Success,
    /// At least one independent step failed while others completed
    PartialFailure,
    Failure,
}

pub struct ConfigurationJob {
    id: u16,
    target: UnicastAddress,
    steps: Vec<Step>,
    cursor: usize,
    seq: u16,
    result: JobResult,
}

impl ConfigurationJob {
    pub fn new(id: u16, target: UnicastAddress, specs: Vec<StepSpec>) -> Self {
        Self {
            id,
            target,
            steps: specs.into_iter().map(Step::new).collect(),
            cursor: 0,
            seq: 0,
            result: JobResult::Pending,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn target(&self) -> UnicastAddress {
        self.target
    }

    pub fn result(&self) -> JobResult {
        self.result
    }

    pub fn is_terminal(&self) -> bool {
        self.result != JobResult::Pending
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.completed()).count()
    }

    /// Response payload of a completed step, by step name
    pub fn step_response(&self, name: &str) -> Option<&[u8]> {
        self.steps
            .iter()
            .find(|s| s.spec.name == name && s.completed())
            .map(|s| s.response.as_slice())
    }

    /// First step that failed terminally, if any
    pub fn failed_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.failed())
    }

    /// One line for the operation outcome
    pub fn summary(&self) -> String {
        match self.failed_step() {
            None => format!("{}/{} steps completed", self.completed_count(), self.steps.len()),
            Some(step) => format!(
                "{}/{} steps completed; step '{}' failed after {} attempt(s): {}",
                self.completed_count(),
                self.steps.len(),
                step.spec.name,
                step.attempts,
                step.last_error.as_deref().unwrap_or("unknown error"),
            ),
        }
    }

    /// Issue the first step
    pub fn start(&mut self) -> Vec<Effect> {
        debug_assert_eq!(self.result, JobResult::Pending);
        if self.steps.is_empty() {
            self.result = JobResult::Success;
            return Vec::new();
        }
        self.issue_current()
    }

    pub fn handle_event(&mut self, event: &Event) -> Vec<Effect> {
        if self.is_terminal() {
            return Vec::new();
        }

        match event {
            Event::StepResponse { handle, status, payload } => {
                if !self.matches_in_flight(*handle) {
                    return Vec::new();
                }
                if status.is_success() {
                    let step = &mut self.steps[self.cursor];
                    step.state = StepState::Completed;
                    step.response = payload.clone();
                    debug!(job = self.id, step = step.spec.name, "step completed");
                    self.advance()
                } else {
                    self.fail_attempt(format!("remote answered {status}"))
                }
            }

            Event::TimerElapsed(TimerKind::StepTimeout { handle }) => {
                if !self.matches_in_flight(*handle) {
                    // A timeout for a handle we already resolved; stale.
                    return Vec::new();
                }
                self.fail_attempt("no response before the step timeout".to_string())
            }

            _ => Vec::new(),
        }
    }

    fn matches_in_flight(&self, handle: u32) -> bool {
        self.steps
            .get(self.cursor)
            .is_some_and(|s| s.state == StepState::InFlight { handle })
    }

    fn issue_current(&mut self) -> Vec<Effect> {
        self.seq += 1;
        let handle = ((self.id as u32) << 16) | self.seq as u32;

        let target = self.target;
        let step = &mut self.steps[self.cursor];
        step.attempts += 1;
        step.state = StepState::InFlight { handle };
        debug!(
            job = self.id,
            step = step.spec.name,
            attempt = step.attempts,
            "issuing configuration request"
        );

        vec![
            Effect::Command(Command::SendConfigRequest {
                handle,
                address: target,
                request: step.spec.request.clone(),
            }),
            Effect::ArmTimer {
                kind: TimerKind::StepTimeout { handle },
                after: step.spec.timeout,
            },
        ]
    }

    /// One attempt failed; retry within the bound, otherwise fail the step
    /// and decide what that means for the job.
    fn fail_attempt(&mut self, reason: String) -> Vec<Effect> {
        let step = &mut self.steps[self.cursor];
        step.last_error = Some(reason);

        if step.attempts <= step.spec.retry_limit {
            warn!(
                job = self.id,
                step = step.spec.name,
                attempt = step.attempts,
                error = step.last_error.as_deref().unwrap_or(""),
                "step attempt failed, retrying"
            );
            return self.issue_current();
        }

        step.state = StepState::Failed;
        warn!(
            job = self.id,
            step = step.spec.name,
            attempts = step.attempts,
            error = step.last_error.as_deref().unwrap_or(""),
            "step failed terminally"
        );

        if step.spec.blocking {
            self.result = JobResult::Failure;
            info!(job = self.id, "job failed on blocking step");
            return Vec::new();
        }
        self.advance()
    }

    /// Move past the current step: issue the next one or finalize
    fn advance(&mut self) -> Vec<Effect> {
        self.cursor += 1;
        if self.cursor < self.steps.len() {
            return self.issue_current();
        }

        let failed = self.steps.iter().filter(|s| s.failed()).count();
        self.result = if failed == 0 {
            JobResult::Success
        } else if self.completed_count() > 0 {
            JobResult::PartialFailure
        } else {
            JobResult::Failure
        };
        info!(job = self.id, result = ?self.result, "configuration job finished");
        Vec::new()
    }
}

/// Step sequence run after a node joins the network: deploy the application
/// key, learn what the node is made of, then wire up the configured models.
pub fn provisioning_steps(
    netkey_index: KeyIndex,
    appkey_index: KeyIndex,
    primary: UnicastAddress,
    models: &[ModelConfig],
    timeout: Duration,
    read_retry_limit: u8,
) -> Vec<StepSpec> {
    let mut steps = vec![
        StepSpec::new(
            "appkey add",
            ConfigRequest::AppKeyAdd { netkey_index, appkey_index },
            timeout,
        ),
        StepSpec::new(
            "composition data get",
            ConfigRequest::CompositionDataGet { page: 0 },
            timeout,
        )
        .with_retries(read_retry_limit),
    ];

    for model in models {
        steps.push(StepSpec::new(
            "model app bind",
            ConfigRequest::ModelAppBind {
                element_address: primary,
                appkey_index,
                model_id: model.model_id,
            },
            timeout,
        ));
    }
    for model in models {
        if let Some(publish_address) = model.publish_address {
            steps.push(
                StepSpec::new(
                    "model pub set",
                    ConfigRequest::ModelPubSet {
                        element_address: primary,
                        publish_address,
                        appkey_index,
                        model_id: model.model_id,
                    },
                    timeout,
                )
                .independent(),
            );
        }
        if let Some(group_address) = model.subscribe_address {
            steps.push(
                StepSpec::new(
                    "model sub add",
                    ConfigRequest::ModelSubAdd {
                        element_address: primary,
                        group_address,
                        model_id: model.model_id,
                    },
                    timeout,
                )
                .independent(),
            );
        }
    }

    steps
}

/// Read-only job used by the node-info operation
pub fn node_info_steps(timeout: Duration, read_retry_limit: u8) -> Vec<StepSpec> {
    vec![
        StepSpec::new("composition data get", ConfigRequest::CompositionDataGet { page: 0 }, timeout)
            .with_retries(read_retry_limit),
    ]
}

/// Eviction job used by the remove-node operation
pub fn remove_node_steps(timeout: Duration) -> Vec<StepSpec> {
    // Node reset is safe to reissue: a node that already reset simply stops
    // answering, and the bound keeps us from waiting forever.
    vec![StepSpec::new("node reset", ConfigRequest::NodeReset, timeout).with_retries(2)]
}
