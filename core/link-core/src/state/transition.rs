//! Transition table for the connection status.
//!
//! `apply_transition` is pure: it decides the next status and the side effects
//! the caller must perform. It never touches timers or the backend itself.
//!
//! ```text
//! disconnected  -> connecting
//! connecting    -> scanning | authenticated | connected | disconnected | error
//! scanning      -> authenticated | connected | disconnected | error
//! authenticated -> connected | disconnected | error
//! connected     -> disconnecting | reconnecting | disconnected | error
//! disconnecting -> disconnected | logging_out
//! logging_out   -> logged_out
//! logged_out    -> connecting            (explicit connect only)
//! reconnecting  -> connected | disconnected | error
//! error         -> reconnecting | disconnected
//! ```

use super::types::ConnectionStatus;
use crate::error::LinkError;

/// Normalized reducer input. Push events, poll results and user commands are
/// all lowered to one of these before they reach the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ConnectRequested { explicit: bool },
    QrIssued,
    Authenticated,
    Ready,
    Reported(ConnectionStatus),
    DisconnectRequested,
    LogoutRequested,
    LogoutCompleted,
    Dropped,
    Failed,
    RecoveryStarted,
}

impl Signal {
    pub fn target(&self) -> ConnectionStatus {
        match self {
            Signal::ConnectRequested { .. } => ConnectionStatus::Connecting,
            Signal::QrIssued => ConnectionStatus::Scanning,
            Signal::Authenticated => ConnectionStatus::Authenticated,
            Signal::Ready => ConnectionStatus::Connected,
            Signal::Reported(status) => *status,
            Signal::DisconnectRequested => ConnectionStatus::Disconnecting,
            Signal::LogoutRequested => ConnectionStatus::LoggingOut,
            Signal::LogoutCompleted => ConnectionStatus::LoggedOut,
            Signal::Dropped => ConnectionStatus::Disconnected,
            Signal::Failed => ConnectionStatus::Error,
            Signal::RecoveryStarted => ConnectionStatus::Reconnecting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Notify,
    ClearQr,
    ArmWatchdog,
    DisarmWatchdog,
    FetchAccountInfo,
    ClearAccountInfo,
    ArmStallTimer,
    CancelStallTimer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub fn is_allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::*;

    match from {
        Disconnected => matches!(to, Connecting),
        Connecting => matches!(to, Scanning | Authenticated | Connected | Disconnected | Error),
        Scanning => matches!(to, Authenticated | Connected | Disconnected | Error),
        Authenticated => matches!(to, Connected | Disconnected | Error),
        Connected => matches!(to, Disconnecting | Reconnecting | Disconnected | Error),
        Disconnecting => matches!(to, Disconnected | LoggingOut),
        LoggingOut => matches!(to, LoggedOut),
        LoggedOut => matches!(to, Connecting),
        Reconnecting => matches!(to, Connected | Disconnected | Error),
        Error => matches!(to, Reconnecting | Disconnected),
    }
}

/// True when `implied` sits earlier on the handshake path than `current`.
/// Such events are late deliveries and must not regress the status.
pub fn is_stale(current: ConnectionStatus, implied: ConnectionStatus) -> bool {
    match (current.lifecycle_rank(), implied.lifecycle_rank()) {
        (Some(current_rank), Some(implied_rank)) => implied_rank < current_rank,
        _ => false,
    }
}

pub fn apply_transition(
    current: ConnectionStatus,
    signal: Signal,
) -> Result<Transition, LinkError> {
    let to = signal.target();
    if to == current {
        return Ok(Transition {
            from: current,
            to,
            effects: Vec::new(),
        });
    }

    let explicit_only = current == ConnectionStatus::LoggedOut
        && !matches!(signal, Signal::ConnectRequested { explicit: true });
    if explicit_only || !is_allowed(current, to) {
        return Err(LinkError::IllegalTransition { from: current, to });
    }

    Ok(Transition {
        from: current,
        to,
        effects: effects_for(current, to),
    })
}

fn effects_for(from: ConnectionStatus, to: ConnectionStatus) -> Vec<Effect> {
    let mut effects = vec![Effect::Notify];

    if from == ConnectionStatus::Scanning {
        effects.push(Effect::ClearQr);
    }

    match to {
        ConnectionStatus::Connected => {
            effects.push(Effect::ArmWatchdog);
            effects.push(Effect::FetchAccountInfo);
        }
        ConnectionStatus::Disconnecting | ConnectionStatus::LoggingOut => {
            effects.push(Effect::DisarmWatchdog);
        }
        ConnectionStatus::LoggedOut => {
            effects.push(Effect::DisarmWatchdog);
            effects.push(Effect::ClearAccountInfo);
        }
        ConnectionStatus::Disconnected => {
            effects.push(Effect::ClearAccountInfo);
        }
        _ => {}
    }

    if to.is_terminal() {
        effects.push(Effect::CancelStallTimer);
    } else {
        effects.push(Effect::ArmStallTimer);
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn table_matches_documented_edges() {
        let edges = [
            (Disconnected, vec![Connecting]),
            (Connecting, vec![Scanning, Authenticated, Connected, Disconnected, Error]),
            (Scanning, vec![Authenticated, Connected, Disconnected, Error]),
            (Authenticated, vec![Connected, Disconnected, Error]),
            (Connected, vec![Disconnecting, Reconnecting, Disconnected, Error]),
            (Disconnecting, vec![Disconnected, LoggingOut]),
            (LoggingOut, vec![LoggedOut]),
            (LoggedOut, vec![Connecting]),
            (Reconnecting, vec![Connected, Disconnected, Error]),
            (Error, vec![Reconnecting, Disconnected]),
        ];
        for (from, allowed) in edges {
            for to in ConnectionStatus::ALL {
                assert_eq!(
                    is_allowed(from, to),
                    allowed.contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn same_status_is_a_silent_no_op() {
        let transition = apply_transition(Connected, Signal::Reported(Connected)).unwrap();
        assert!(!transition.changed());
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn illegal_edge_is_rejected() {
        let err = apply_transition(Disconnected, Signal::Ready).unwrap_err();
        assert!(matches!(
            err,
            LinkError::IllegalTransition {
                from: Disconnected,
                to: Connected
            }
        ));
    }

    #[test]
    fn logged_out_requires_explicit_connect() {
        assert!(apply_transition(LoggedOut, Signal::ConnectRequested { explicit: false }).is_err());
        assert!(apply_transition(LoggedOut, Signal::Reported(Connecting)).is_err());
        let transition =
            apply_transition(LoggedOut, Signal::ConnectRequested { explicit: true }).unwrap();
        assert_eq!(transition.to, Connecting);
    }

    #[test]
    fn entering_connected_arms_watchdog_and_fetches_identity() {
        let transition = apply_transition(Scanning, Signal::Ready).unwrap();
        assert_eq!(
            transition.effects,
            vec![
                Effect::Notify,
                Effect::ClearQr,
                Effect::ArmWatchdog,
                Effect::FetchAccountInfo,
                Effect::CancelStallTimer,
            ]
        );
    }

    #[test]
    fn teardown_disarms_watchdog() {
        let transition = apply_transition(Connected, Signal::DisconnectRequested).unwrap();
        assert!(transition.effects.contains(&Effect::DisarmWatchdog));
        assert!(transition.effects.contains(&Effect::ArmStallTimer));

        let transition = apply_transition(LoggingOut, Signal::LogoutCompleted).unwrap();
        assert!(transition.effects.contains(&Effect::DisarmWatchdog));
        assert!(transition.effects.contains(&Effect::ClearAccountInfo));
    }

    #[test]
    fn involuntary_drop_keeps_watchdog_running() {
        let transition = apply_transition(Connected, Signal::Failed).unwrap();
        assert!(!transition.effects.contains(&Effect::DisarmWatchdog));
    }

    #[test]
    fn handshake_regressions_are_stale() {
        assert!(is_stale(Connected, Scanning));
        assert!(is_stale(Authenticated, Scanning));
        assert!(is_stale(Connected, Connecting));
        assert!(!is_stale(Scanning, Scanning));
        assert!(!is_stale(Scanning, Connected));
        assert!(!is_stale(Connected, Disconnected));
        assert!(!is_stale(Reconnecting, Scanning));
    }

    #[test]
    fn every_edge_reaches_a_defined_status() {
        let signals = [
            Signal::ConnectRequested { explicit: true },
            Signal::QrIssued,
            Signal::Authenticated,
            Signal::Ready,
            Signal::DisconnectRequested,
            Signal::LogoutRequested,
            Signal::LogoutCompleted,
            Signal::Dropped,
            Signal::Failed,
            Signal::RecoveryStarted,
        ];
        for from in ConnectionStatus::ALL {
            for signal in signals {
                if let Ok(transition) = apply_transition(from, signal) {
                    assert!(transition.from == transition.to || is_allowed(from, transition.to));
                }
            }
        }
    }
}
