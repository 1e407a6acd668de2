use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sessionlink_core::protocol::{AccountInfo, BackendRequest, PushEvent, StatusReport};
use sessionlink_core::{
    Backend, BackendError, ConnectionStatus, LinkConfig, LinkError, LinkRuntime, PresenterUpdate,
    TokioClock,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[derive(Default)]
struct ScriptedBackend {
    calls: Mutex<Vec<BackendRequest>>,
    has_session: bool,
    connected: AtomicBool,
    hang_connect: bool,
}

impl ScriptedBackend {
    fn record(&self, request: BackendRequest) {
        self.calls.lock().unwrap().push(request);
    }

    fn calls(&self) -> Vec<BackendRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, request: BackendRequest) -> usize {
        self.calls()
            .into_iter()
            .filter(|call| *call == request)
            .count()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn connect(&self, force_new_session: bool) -> Result<(), BackendError> {
        self.record(BackendRequest::Connect { force_new_session });
        if self.hang_connect {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    async fn disconnect(&self, delete_session: bool) -> Result<(), BackendError> {
        self.record(BackendRequest::Disconnect { delete_session });
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_status(&self) -> Result<StatusReport, BackendError> {
        self.record(BackendRequest::GetStatus);
        Ok(StatusReport {
            is_connected: self.connected.load(Ordering::SeqCst),
            has_existing_session: self.has_session,
            status: String::new(),
        })
    }

    async fn get_account_info(&self) -> Result<Option<AccountInfo>, BackendError> {
        self.record(BackendRequest::GetAccountInfo);
        Ok(Some(AccountInfo {
            phone_number: "15550100".to_string(),
            display_name: "Ana".to_string(),
            avatar_url: None,
            connected: true,
            observed_at: t0(),
        }))
    }

    async fn repair_connection(&self) -> Result<(), BackendError> {
        self.record(BackendRequest::RepairConnection);
        Ok(())
    }

    async fn reset_session(&self) -> Result<(), BackendError> {
        self.record(BackendRequest::ResetSession);
        Ok(())
    }
}

fn spawn(backend: Arc<ScriptedBackend>) -> LinkRuntime {
    LinkRuntime::spawn(
        LinkConfig::default(),
        backend,
        Arc::new(TokioClock::new(t0())),
    )
}

/// Lets the driver and its call tasks run to quiescence.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn drain(updates: &mut UnboundedReceiver<PresenterUpdate>) -> Vec<PresenterUpdate> {
    let mut drained = Vec::new();
    while let Ok(update) = updates.try_recv() {
        drained.push(update);
    }
    drained
}

fn statuses(updates: &[PresenterUpdate]) -> Vec<ConnectionStatus> {
    updates
        .iter()
        .filter_map(|update| match update {
            PresenterUpdate::State(change) => Some(change.status),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_startup_resumes_stored_session() {
    let backend = Arc::new(ScriptedBackend {
        has_session: true,
        ..Default::default()
    });
    let mut link = spawn(backend.clone());
    settle().await;

    assert_eq!(
        backend.calls(),
        vec![
            BackendRequest::GetStatus,
            BackendRequest::Connect {
                force_new_session: false
            },
        ]
    );

    backend.connected.store(true, Ordering::SeqCst);
    link.handle.push(PushEvent::Ready).unwrap();
    settle().await;

    let updates = drain(&mut link.updates);
    assert_eq!(
        statuses(&updates),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Connected,
        ]
    );
    let Some(PresenterUpdate::State(last)) = updates.last() else {
        panic!("expected a state update, got {:?}", updates);
    };
    assert_eq!(
        last.account.as_ref().map(|info| info.display_name.as_str()),
        Some("Ana")
    );
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_probes_once_per_fast_interval() {
    let backend = Arc::new(ScriptedBackend {
        has_session: true,
        ..Default::default()
    });
    let link = spawn(backend.clone());
    settle().await;
    backend.connected.store(true, Ordering::SeqCst);
    link.handle.push(PushEvent::Ready).unwrap();
    settle().await;
    assert_eq!(backend.count(BackendRequest::GetStatus), 1);

    tokio::time::sleep(Duration::from_secs(181)).await;

    assert_eq!(backend.count(BackendRequest::GetStatus), 2);
    assert_eq!(backend.count(BackendRequest::GetAccountInfo), 2);
    assert_eq!(backend.count(BackendRequest::RepairConnection), 0);
    let snapshot = link.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert!(snapshot.watchdog_armed);
}

#[tokio::test(start_paused = true)]
async fn test_hung_connect_times_out_into_error() {
    let backend = Arc::new(ScriptedBackend {
        hang_connect: true,
        ..Default::default()
    });
    let mut link = spawn(backend.clone());
    settle().await;

    link.handle.connect().unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let updates = drain(&mut link.updates);
    assert_eq!(
        statuses(&updates),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
    );
    assert!(updates
        .iter()
        .any(|update| matches!(update, PresenterUpdate::Notice(_))));
    let Some(PresenterUpdate::State(error)) = updates
        .iter()
        .find(|update| {
            matches!(
                update,
                PresenterUpdate::State(change) if change.status == ConnectionStatus::Error
            )
        })
    else {
        panic!("expected error update");
    };
    assert!(error
        .reason
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_driver() {
    let backend = Arc::new(ScriptedBackend::default());
    let link = spawn(backend.clone());
    settle().await;

    let snapshot = link.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.session.map(|record| record.has_existing_session), Some(false));

    link.handle.shutdown().unwrap();
    link.task.await.unwrap();

    assert!(matches!(link.handle.connect(), Err(LinkError::DriverStopped)));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_raw_push_is_ignored() {
    let backend = Arc::new(ScriptedBackend::default());
    let mut link = spawn(backend.clone());
    settle().await;

    link.handle
        .push_raw(serde_json::json!({"channel": "nonsense", "payload": {}}))
        .unwrap();
    settle().await;

    assert!(drain(&mut link.updates).is_empty());
    let snapshot = link.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
}
