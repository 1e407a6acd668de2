//! Tokio driver for the lifecycle manager.
//!
//! One task owns the [`LifecycleManager`] and serializes every input: user
//! commands, push events, backend replies and timer deadlines all arrive
//! through the same `select!` loop. Backend calls run on their own tasks,
//! bounded by `call_timeout`; a hung or panicking call comes back as an
//! ordinary `BackendError` so recovery always releases its lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sessionlink_protocol::{AccountInfo, BackendReply, BackendRequest, PushEvent, StatusReport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{BackendError, LinkError, Result};
use crate::manager::{Action, CallId, LifecycleManager, Notice, Snapshot, StateChange};

/// The messaging backend. Every method maps to one bridge operation.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn connect(&self, force_new_session: bool) -> std::result::Result<(), BackendError>;

    async fn disconnect(&self, delete_session: bool) -> std::result::Result<(), BackendError>;

    async fn get_status(&self) -> std::result::Result<StatusReport, BackendError>;

    async fn get_account_info(&self) -> std::result::Result<Option<AccountInfo>, BackendError>;

    async fn repair_connection(&self) -> std::result::Result<(), BackendError>;

    async fn reset_session(&self) -> std::result::Result<(), BackendError>;
}

pub async fn dispatch(
    backend: &dyn Backend,
    request: BackendRequest,
) -> std::result::Result<BackendReply, BackendError> {
    match request {
        BackendRequest::Connect { force_new_session } => backend
            .connect(force_new_session)
            .await
            .map(|_| BackendReply::Ack),
        BackendRequest::Disconnect { delete_session } => backend
            .disconnect(delete_session)
            .await
            .map(|_| BackendReply::Ack),
        BackendRequest::GetStatus => backend.get_status().await.map(BackendReply::Status),
        BackendRequest::GetAccountInfo => {
            backend.get_account_info().await.map(BackendReply::Account)
        }
        BackendRequest::RepairConnection => {
            backend.repair_connection().await.map(|_| BackendReply::Ack)
        }
        BackendRequest::ResetSession => backend.reset_session().await.map(|_| BackendReply::Ack),
    }
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from the tokio clock, so paused-time tests move both.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}

/// What the UI layer receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PresenterUpdate {
    State(StateChange),
    Notice(Notice),
    ShowQr { payload: String },
    ClearQr,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Logout,
    Push(PushEvent),
    RawPush(Value),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Cloneable handle to a running driver.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    pub fn logout(&self) -> Result<()> {
        self.send(Command::Logout)
    }

    pub fn push(&self, event: PushEvent) -> Result<()> {
        self.send(Command::Push(event))
    }

    /// Forwards an unparsed bridge envelope.
    pub fn push_raw(&self, raw: Value) -> Result<()> {
        self.send(Command::RawPush(raw))
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        response.await.map_err(|_| LinkError::DriverStopped)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::DriverStopped)
    }
}

pub struct LinkRuntime {
    pub handle: LinkHandle,
    pub updates: mpsc::UnboundedReceiver<PresenterUpdate>,
    pub task: JoinHandle<()>,
}

impl LinkRuntime {
    /// Spawns the driver on the current tokio runtime and runs the startup
    /// session check.
    pub fn spawn(config: LinkConfig, backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            call_timeout: config.call_timeout(),
            manager: LifecycleManager::new(config, clock.now()),
            backend,
            clock,
            replies: reply_tx,
            presenter: update_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, reply_rx));

        Self {
            handle: LinkHandle {
                commands: command_tx,
            },
            updates: update_rx,
            task,
        }
    }
}

type Reply = (CallId, std::result::Result<BackendReply, BackendError>);

struct Driver {
    manager: LifecycleManager,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    replies: mpsc::UnboundedSender<Reply>,
    presenter: mpsc::UnboundedSender<PresenterUpdate>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut replies: mpsc::UnboundedReceiver<Reply>,
    ) {
        info!("Lifecycle driver started");
        let actions = self.manager.start(self.clock.now());
        self.perform(actions);

        loop {
            let delay = self.manager.next_deadline().map(|deadline| {
                deadline
                    .signed_duration_since(self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if matches!(command, Command::Shutdown) {
                        break;
                    }
                    self.on_command(command);
                }
                Some((id, result)) = replies.recv() => {
                    let actions = self.manager.handle_reply(self.clock.now(), id, result);
                    self.perform(actions);
                }
                _ = wait(delay) => {
                    let actions = self.manager.tick(self.clock.now());
                    self.perform(actions);
                }
            }
        }
        info!("Lifecycle driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        let now = self.clock.now();
        let actions = match command {
            Command::Connect => self.manager.connect(now),
            Command::Disconnect => self.manager.disconnect(now),
            Command::Logout => self.manager.logout(now),
            Command::Push(event) => self.manager.handle_push(now, event),
            Command::RawPush(raw) => self.manager.handle_raw_push(now, raw),
            Command::Snapshot(reply) => {
                if reply.send(self.manager.snapshot()).is_err() {
                    debug!("Snapshot requester went away");
                }
                Vec::new()
            }
            Command::Shutdown => Vec::new(),
        };
        self.perform(actions);
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Call { id, request } => self.spawn_call(id, request),
                Action::Publish(change) => self.present(PresenterUpdate::State(change)),
                Action::Notice(notice) => self.present(PresenterUpdate::Notice(notice)),
                Action::ShowQr { payload } => self.present(PresenterUpdate::ShowQr { payload }),
                Action::ClearQr => self.present(PresenterUpdate::ClearQr),
            }
        }
    }

    fn present(&self, update: PresenterUpdate) {
        if self.presenter.send(update).is_err() {
            debug!("Presenter channel closed; update dropped");
        }
    }

    fn spawn_call(&self, id: CallId, request: BackendRequest) {
        let backend = Arc::clone(&self.backend);
        let replies = self.replies.clone();
        let limit = self.call_timeout;

        tokio::spawn(async move {
            let mut call = tokio::spawn(async move { dispatch(backend.as_ref(), request).await });
            let result = match time::timeout(limit, &mut call).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    warn!(
                        call_id = id,
                        operation = request.operation(),
                        error = %join_err,
                        "Backend call aborted"
                    );
                    Err(BackendError::Crashed(join_err.to_string()))
                }
                Err(_) => {
                    call.abort();
                    warn!(call_id = id, operation = request.operation(), "Backend call timed out");
                    Err(BackendError::Timeout {
                        secs: limit.as_secs(),
                    })
                }
            };
            if replies.send((id, result)).is_err() {
                debug!(call_id = id, "Driver gone; reply dropped");
            }
        });
    }
}

async fn wait(delay: Option<Duration>) {
    match delay {
        Some(delay) => time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
