//! # sessionlink-core
//!
//! Connection lifecycle manager for a QR-paired messaging session, providing
//! the state machine, supervision and recovery shared by every front end
//! (desktop app, replay CLI, tests).
//!
//! ## Design Principles
//!
//! - **Sans-IO core**: [`LifecycleManager`] takes `now` and returns actions.
//!   It never sleeps, spawns or talks to the backend itself.
//! - **One writer**: all status changes go through the transition table in
//!   [`state`]; illegal edges are logged and ignored.
//! - **User intent wins**: after a logout nothing reconnects on its own until
//!   the user connects again.
//! - **Single recovery**: at most one recovery attempt is pending; other
//!   failure reports are coalesced into it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sessionlink_core::{load_config, LinkRuntime, SystemClock};
//!
//! let config = load_config(None)?;
//! let mut link = LinkRuntime::spawn(config, backend, Arc::new(SystemClock));
//! link.handle.connect()?;
//! while let Some(update) = link.updates.recv().await {
//!     render(update);
//! }
//! ```

pub mod account;
pub mod config;
pub mod error;
pub mod ingest;
pub mod intent;
pub mod manager;
pub mod recovery;
pub mod runtime;
pub mod state;
pub mod timers;
pub mod watchdog;

pub use account::{AccountInfoCache, CacheUpdate, FetchDecision};
pub use config::{default_config_path, load_config, LinkConfig};
pub use error::{BackendError, LinkError, Result};
pub use ingest::{EventIngester, Ingested};
pub use intent::SessionIntent;
pub use manager::{Action, CallId, LifecycleManager, Notice, NoticeLevel, Snapshot, StateChange};
pub use recovery::{
    RecoveryAttempt, RecoveryCause, RecoveryEscalator, RecoveryOutcome, RecoveryTier,
};
pub use runtime::{
    Backend, Clock, LinkHandle, LinkRuntime, PresenterUpdate, SystemClock, TokioClock,
};
pub use state::{ConnectionState, ConnectionStatus, Signal};
pub use timers::{TimerKind, TimerTable};
pub use watchdog::Watchdog;

pub use sessionlink_protocol as protocol;
