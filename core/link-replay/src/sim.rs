//! Deterministic replay loop with a simulated backend.
//!
//! Backend calls are answered synchronously at the instant they are issued;
//! timers fire at their exact deadlines between script steps.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sessionlink_core::protocol::{AccountInfo, BackendReply, BackendRequest, StatusReport};
use sessionlink_core::{Action, BackendError, LifecycleManager, LinkConfig, Snapshot};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

use crate::script::{BackendPatch, ScriptLine, Step, UserCommand};

/// Upper bound on timer firings between two steps; guards against a
/// misconfigured zero-length interval.
const MAX_TIMER_FIRINGS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    connected: bool,
    has_session: bool,
    failing: BTreeSet<String>,
    display_name: String,
    phone_number: String,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self {
            connected: false,
            has_session: false,
            failing: BTreeSet::new(),
            display_name: "Replay".to_string(),
            phone_number: "0000000000".to_string(),
        }
    }
}

impl SimulatedBackend {
    pub fn apply(&mut self, patch: &BackendPatch) {
        if let Some(connected) = patch.connected {
            self.connected = connected;
        }
        if let Some(session) = patch.session {
            self.has_session = session;
        }
        for operation in &patch.fail {
            self.failing.insert(operation.clone());
        }
        for operation in &patch.heal {
            self.failing.remove(operation);
        }
        if let Some(name) = &patch.display_name {
            self.display_name = name.clone();
        }
        if let Some(phone) = &patch.phone_number {
            self.phone_number = phone.clone();
        }
    }

    pub fn answer(
        &mut self,
        request: BackendRequest,
        now: DateTime<Utc>,
    ) -> Result<BackendReply, BackendError> {
        let operation = request.operation();
        if self.failing.contains(operation) {
            return Err(BackendError::Rejected {
                operation: operation.to_string(),
                message: "scripted failure".to_string(),
            });
        }

        let reply = match request {
            BackendRequest::Connect { force_new_session } => {
                if force_new_session {
                    self.has_session = false;
                }
                BackendReply::Ack
            }
            BackendRequest::Disconnect { delete_session } => {
                self.connected = false;
                if delete_session {
                    self.has_session = false;
                }
                BackendReply::Ack
            }
            BackendRequest::ResetSession => {
                self.connected = false;
                self.has_session = false;
                BackendReply::Ack
            }
            BackendRequest::RepairConnection => BackendReply::Ack,
            BackendRequest::GetStatus => BackendReply::Status(StatusReport {
                is_connected: self.connected,
                has_existing_session: self.has_session,
                status: if self.connected { "CONNECTED" } else { "DISCONNECTED" }.to_string(),
            }),
            BackendRequest::GetAccountInfo => {
                BackendReply::Account(self.connected.then(|| AccountInfo {
                    phone_number: self.phone_number.clone(),
                    display_name: self.display_name.clone(),
                    avatar_url: None,
                    connected: true,
                    observed_at: now,
                }))
            }
        };
        Ok(reply)
    }
}

/// One line of replay output.
#[derive(Debug, Clone, Serialize)]
pub struct Emitted {
    pub at_ms: i64,
    #[serde(flatten)]
    pub action: Action,
}

pub struct Replayer {
    manager: LifecycleManager,
    backend: SimulatedBackend,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    emitted: Vec<Emitted>,
}

impl Replayer {
    pub fn new(config: LinkConfig, backend: SimulatedBackend, start: DateTime<Utc>) -> Self {
        Self {
            manager: LifecycleManager::new(config, start),
            backend,
            start,
            now: start,
            emitted: Vec::new(),
        }
    }

    pub fn run(&mut self, steps: &[ScriptLine]) {
        for line in steps {
            self.advance_to(self.start + millis(line.at_ms));
            self.apply(&line.step);
        }
    }

    /// Fires every timer due up to `target`, then parks the clock there.
    pub fn advance_to(&mut self, target: DateTime<Utc>) {
        let mut firings = 0;
        while let Some(deadline) = self.manager.next_deadline() {
            if deadline > target || firings >= MAX_TIMER_FIRINGS {
                break;
            }
            firings += 1;
            self.now = deadline.max(self.now);
            let actions = self.manager.tick(self.now);
            self.perform(actions);
        }
        self.now = target.max(self.now);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.manager.snapshot()
    }

    pub fn emitted(&self) -> &[Emitted] {
        &self.emitted
    }

    fn apply(&mut self, step: &Step) {
        let now = self.now;
        let actions = match step {
            Step::Command(UserCommand::Start) => self.manager.start(now),
            Step::Command(UserCommand::Connect) => self.manager.connect(now),
            Step::Command(UserCommand::Disconnect) => self.manager.disconnect(now),
            Step::Command(UserCommand::Logout) => self.manager.logout(now),
            Step::Push(raw) => self.manager.handle_raw_push(now, raw.clone()),
            Step::Backend(patch) => {
                self.backend.apply(patch);
                Vec::new()
            }
        };
        self.perform(actions);
    }

    fn perform(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            if let Action::Call { id, request } = &action {
                let (id, request) = (*id, *request);
                let result = self.backend.answer(request, self.now);
                debug!(
                    call_id = id,
                    operation = request.operation(),
                    ok = result.is_ok(),
                    "Simulated reply"
                );
                self.record(action);
                queue.extend(self.manager.handle_reply(self.now, id, result));
            } else {
                self.record(action);
            }
        }
    }

    fn record(&mut self, action: Action) {
        let at_ms = self
            .now
            .signed_duration_since(self.start)
            .num_milliseconds();
        self.emitted.push(Emitted { at_ms, action });
    }
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}
