//! C4 — the socket unit's 12-state machine and the classification helpers
//! the controller, dispatcher and serializer all consult.

use std::fmt;

/// The full state set a socket unit can occupy (§4.4). Listed in the order
/// a normal start/stop cycle visits them; the `stop-pre-sig*`/`final-sig*`
/// pairs are the escalation states entered only when a control process
/// doesn't exit before its phase timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Dead,
    StartPre,
    StartPost,
    Listening,
    Running,
    StopPre,
    StopPreSigterm,
    StopPreSigkill,
    StopPost,
    FinalSigterm,
    FinalSigkill,
    Failed,
}

impl SocketState {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketState::Dead => "dead",
            SocketState::StartPre => "start-pre",
            SocketState::StartPost => "start-post",
            SocketState::Listening => "listening",
            SocketState::Running => "running",
            SocketState::StopPre => "stop-pre",
            SocketState::StopPreSigterm => "stop-pre-sigterm",
            SocketState::StopPreSigkill => "stop-pre-sigkill",
            SocketState::StopPost => "stop-post",
            SocketState::FinalSigterm => "final-sigterm",
            SocketState::FinalSigkill => "final-sigkill",
            SocketState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "dead" => SocketState::Dead,
            "start-pre" => SocketState::StartPre,
            "start-post" => SocketState::StartPost,
            "listening" => SocketState::Listening,
            "running" => SocketState::Running,
            "stop-pre" => SocketState::StopPre,
            "stop-pre-sigterm" => SocketState::StopPreSigterm,
            "stop-pre-sigkill" => SocketState::StopPreSigkill,
            "stop-post" => SocketState::StopPost,
            "final-sigterm" => SocketState::FinalSigterm,
            "final-sigkill" => SocketState::FinalSigkill,
            "failed" => SocketState::Failed,
            _ => return None,
        })
    }

    /// States in which the port table is expected to be open and watched
    /// (§4.4/§4.1): listening for new connections, or actively running a
    /// dispatched/triggered service with ports still held open.
    pub fn holds_open_ports(self) -> bool {
        matches!(self, SocketState::Listening | SocketState::Running)
    }

    /// States that have an associated control process the controller is
    /// waiting on (any `*-pre`/`*-post` phase, plus the escalation states
    /// which are waiting on that same process to die).
    pub fn has_control_pid(self) -> bool {
        matches!(
            self,
            SocketState::StartPre
                | SocketState::StartPost
                | SocketState::StopPre
                | SocketState::StopPreSigterm
                | SocketState::StopPreSigkill
                | SocketState::StopPost
        )
    }

    /// True once the control process for the current phase has been sent
    /// SIGTERM or SIGKILL and the controller is just waiting for exit.
    pub fn is_escalated(self) -> bool {
        matches!(
            self,
            SocketState::StopPreSigterm
                | SocketState::StopPreSigkill
                | SocketState::FinalSigterm
                | SocketState::FinalSigkill
        )
    }

    /// Terminal states: no further transition happens without an external
    /// start/stop request.
    pub fn is_terminal(self) -> bool {
        matches!(self, SocketState::Dead | SocketState::Failed)
    }

    /// True for any state the unit passes through while winding down,
    /// whether the shutdown was requested or is the result of failure.
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            SocketState::StopPre
                | SocketState::StopPreSigterm
                | SocketState::StopPreSigkill
                | SocketState::StopPost
                | SocketState::FinalSigterm
                | SocketState::FinalSigkill
        )
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_its_string_form() {
        let all = [
            SocketState::Dead,
            SocketState::StartPre,
            SocketState::StartPost,
            SocketState::Listening,
            SocketState::Running,
            SocketState::StopPre,
            SocketState::StopPreSigterm,
            SocketState::StopPreSigkill,
            SocketState::StopPost,
            SocketState::FinalSigterm,
            SocketState::FinalSigkill,
            SocketState::Failed,
        ];
        for s in all {
            assert_eq!(SocketState::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn only_listening_and_running_hold_open_ports() {
        assert!(SocketState::Listening.holds_open_ports());
        assert!(SocketState::Running.holds_open_ports());
        assert!(!SocketState::StartPost.holds_open_ports());
        assert!(!SocketState::Dead.holds_open_ports());
    }

    #[test]
    fn escalation_states_are_a_subset_of_control_pid_or_final_states() {
        assert!(SocketState::StopPreSigterm.is_escalated());
        assert!(SocketState::StopPreSigterm.has_control_pid());
        assert!(SocketState::FinalSigterm.is_escalated());
        assert!(!SocketState::FinalSigterm.has_control_pid());
    }
}
