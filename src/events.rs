//! C5 — the event bridge between the outside world (descriptor readiness,
//! child exit, timers) and the controller, plus the §6 trait seams the
//! controller uses instead of reaching into a concrete reactor or a
//! concrete triggered-service type.

use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::SocketError;

/// An opaque token identifying one outstanding watch. Returned by
/// [`UnitManager::watch_fd`]/[`UnitManager::watch_pid`]/
/// [`UnitManager::watch_timer`] and handed back unchanged to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

/// The three event kinds the controller's main loop reacts to (§4.5),
/// always checked in this order — timer first, then child exit, then
/// descriptor readiness — so a deadline that has already elapsed always
/// wins a race against a last-instant exit or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The current phase's deadline elapsed.
    TimerExpired(WatchHandle),
    /// The watched control process exited.
    ChildExited { pid: Pid, status: ExitStatus },
    /// A watched descriptor became readable (new connection, or datagram/
    /// special/mqueue data pending).
    DescriptorReady(RawFd),
}

/// How a watched child exited, mirroring `waitpid`'s `WIFEXITED`/
/// `WIFSIGNALED`/`WCOREDUMP` outcomes (§4.4's exit classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn into_error(self) -> Option<SocketError> {
        match self {
            ExitStatus::Exited(0) => None,
            ExitStatus::Exited(code) => Some(SocketError::ExitCode(code)),
            ExitStatus::Signaled { core_dumped: true, .. } => Some(SocketError::CoreDump),
            ExitStatus::Signaled { signal, .. } => Some(SocketError::Signal(signal)),
        }
    }
}

/// Everything the controller needs from its host environment, without
/// naming a concrete reactor, process supervisor, or D-Bus layer (§6). A
/// production host implements this against its own event loop; tests
/// implement it in-memory.
pub trait UnitManager {
    /// Begin watching `fd` for readability. Returns a handle to later
    /// unwatch it. Must not take ownership of `fd`.
    fn watch_fd(&mut self, fd: RawFd) -> Result<WatchHandle, SocketError>;

    /// Stop watching a descriptor previously registered with `watch_fd`.
    fn unwatch_fd(&mut self, handle: WatchHandle);

    /// Begin watching `pid` for exit.
    fn watch_pid(&mut self, pid: Pid) -> Result<WatchHandle, SocketError>;

    /// Stop watching a pid previously registered with `watch_pid`.
    fn unwatch_pid(&mut self, handle: WatchHandle);

    /// Arm a one-shot timer that fires after `timeout`.
    fn watch_timer(&mut self, timeout: Duration) -> Result<WatchHandle, SocketError>;

    /// Disarm a timer previously registered with `watch_timer`.
    fn unwatch_timer(&mut self, handle: WatchHandle);

    /// Spawn a phase helper command, returning its pid. The manager owns
    /// the process's lifecycle bookkeeping; the controller only ever
    /// learns about it again via a `ChildExited` event for this pid.
    fn spawn_child(&mut self, command: &str, args: &[String], env: &[(String, String)]) -> Result<Pid, SocketError>;

    /// Send `signal` to the process group led by `pid`.
    fn kill_process_group(&mut self, pid: Pid, signal: Signal) -> Result<(), SocketError>;

    /// Enqueue a job to start (or otherwise drive) the triggered service
    /// unit, handing over `fds` for it to adopt (§4.6, shared-service mode,
    /// and per-connection mode via a freshly instanced unit).
    fn add_job(&mut self, fds: Vec<RawFd>, instance: Option<String>) -> Result<(), SocketError>;

    /// Report this unit's new externally-visible state, for whatever the
    /// host's unit manager does with state transitions (restart policies,
    /// dependency ordering, ...).
    fn notify_state_change(&mut self, state: &str, result: &str);

    /// Queue a property-change signal for this unit's external observers.
    /// A no-op host may do nothing here; it exists purely as a seam so the
    /// controller never reaches for a concrete D-Bus type.
    fn queue_dbus_property_change(&mut self, property: &str);
}
