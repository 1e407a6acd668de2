//! Connection state and its transition table.
//!
//! - [`types`]: `ConnectionStatus` and the `ConnectionState` record
//! - [`transition`]: the pure reducer (`apply_transition`) and staleness rule

mod transition;
mod types;

pub use transition::{apply_transition, is_allowed, is_stale, Effect, Signal, Transition};
pub use types::{ConnectionState, ConnectionStatus};
