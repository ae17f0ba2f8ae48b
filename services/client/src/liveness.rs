//! Liveness and reconnection rules (spec §4.7). Pure decision functions,
//! kept separate from the I/O in [`crate::control`] so they are unit
//! testable without a live socket.

use std::time::Duration;

/// How long the server is given to answer a `"ping"` with `"pong"` before
/// the control channel is torn down.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether the 1 Hz health check should fire a `"ping"` this tick.
pub fn should_ping(idle: Duration, ping_interval: Duration) -> bool {
    idle >= ping_interval
}

/// Outcome of a control-channel session ending, feeding the reconnect rule.
pub enum SessionEnd {
    /// The channel closed (or the pong timeout fired) after having
    /// previously reached `open`.
    ClosedAfterOpen,
    /// The channel errored before ever reaching `open`.
    ErrorBeforeOpen,
    /// The handshake failed with `401` -- the token is wrong.
    Unauthorized,
}

pub enum ReconnectDecision {
    Immediate,
    After(Duration),
    Stop,
}

/// Spec §4.7 "Reconnection loop".
pub fn decide_reconnect(end: SessionEnd) -> ReconnectDecision {
    match end {
        SessionEnd::ClosedAfterOpen => ReconnectDecision::Immediate,
        SessionEnd::ErrorBeforeOpen => ReconnectDecision::After(Duration::from_secs(5)),
        SessionEnd::Unauthorized => ReconnectDecision::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_fires_once_idle_reaches_interval() {
        let interval = Duration::from_secs(30);
        assert!(!should_ping(Duration::from_secs(29), interval));
        assert!(should_ping(Duration::from_secs(30), interval));
        assert!(should_ping(Duration::from_secs(31), interval));
    }

    #[test]
    fn closed_after_open_reconnects_immediately() {
        assert!(matches!(
            decide_reconnect(SessionEnd::ClosedAfterOpen),
            ReconnectDecision::Immediate
        ));
    }

    #[test]
    fn error_before_open_waits_five_seconds() {
        match decide_reconnect(SessionEnd::ErrorBeforeOpen) {
            ReconnectDecision::After(d) => assert_eq!(d, Duration::from_secs(5)),
            _ => panic!("expected a delayed reconnect"),
        }
    }

    #[test]
    fn unauthorized_never_reconnects() {
        assert!(matches!(
            decide_reconnect(SessionEnd::Unauthorized),
            ReconnectDecision::Stop
        ));
    }
}
