use std::fmt;

/// The error taxonomy of the controller: validation happens once at load time,
/// everything else can occur at any point after a socket unit starts.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Configuration contradicts one of the invariants in the data model.
    /// Permanent, reported at load time; carries every violation found.
    #[error("invalid socket unit configuration: {}", join(.0))]
    Validation(Vec<String>),

    /// open/bind/listen/mkfifo/mq_open/a mandatory setsockopt/child-spawn failed.
    #[error("resource acquisition failed: {0}")]
    Resources(#[source] std::io::Error),

    /// A phase deadline elapsed.
    #[error("phase timed out")]
    Timeout,

    /// A helper command exited with a non-zero code.
    #[error("helper command exited with code {0}")]
    ExitCode(i32),

    /// A helper command was killed by a signal.
    #[error("helper command killed by signal {0}")]
    Signal(i32),

    /// A helper command dumped core.
    #[error("helper command dumped core")]
    CoreDump,

    /// The triggered (non-accept) shared service failed permanently.
    #[error("triggered service failed permanently")]
    ServiceFailedPermanent,

    /// Anything else that reached us as a bare I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn join(items: &[String]) -> String {
    items.join("; ")
}

impl From<nix::Error> for SocketError {
    fn from(e: nix::Error) -> Self {
        SocketError::Resources(std::io::Error::from(e))
    }
}

/// User-visible result code, §7. Unlike [`SocketError`] this type is `Copy`
/// and round-trips through the textual serialization format (§4.7), so it
/// cannot carry an underlying `std::io::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketResult {
    #[default]
    Success,
    Resources,
    Timeout,
    ExitCode,
    Signal,
    CoreDump,
    ServiceFailedPermanent,
}

impl SocketResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketResult::Success => "success",
            SocketResult::Resources => "resources",
            SocketResult::Timeout => "timeout",
            SocketResult::ExitCode => "exit-code",
            SocketResult::Signal => "signal",
            SocketResult::CoreDump => "core-dump",
            SocketResult::ServiceFailedPermanent => "service-failed-permanent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "success" => SocketResult::Success,
            "resources" => SocketResult::Resources,
            "timeout" => SocketResult::Timeout,
            "exit-code" => SocketResult::ExitCode,
            "signal" => SocketResult::Signal,
            "core-dump" => SocketResult::CoreDump,
            "service-failed-permanent" => SocketResult::ServiceFailedPermanent,
            _ => return None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SocketResult::Success)
    }
}

impl fmt::Display for SocketResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&SocketError> for SocketResult {
    fn from(e: &SocketError) -> Self {
        match e {
            SocketError::Validation(_) => SocketResult::Resources,
            SocketError::Resources(_) => SocketResult::Resources,
            SocketError::Timeout => SocketResult::Timeout,
            SocketError::ExitCode(_) => SocketResult::ExitCode,
            SocketError::Signal(_) => SocketResult::Signal,
            SocketError::CoreDump => SocketResult::CoreDump,
            SocketError::ServiceFailedPermanent => SocketResult::ServiceFailedPermanent,
            SocketError::Io(_) => SocketResult::Resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_round_trips_through_its_string_form() {
        for r in [
            SocketResult::Success,
            SocketResult::Resources,
            SocketResult::Timeout,
            SocketResult::ExitCode,
            SocketResult::Signal,
            SocketResult::CoreDump,
            SocketResult::ServiceFailedPermanent,
        ] {
            assert_eq!(SocketResult::from_str(r.as_str()), Some(r));
        }
    }

    #[test]
    fn unknown_result_string_is_rejected() {
        assert_eq!(SocketResult::from_str("bogus"), None);
    }
}
