//! The concrete [`UnitManager`] a real binary wires up: watched descriptors
//! via `tokio::io::unix::AsyncFd`, watched control processes via the
//! `tokio::process::Child` handles `spawn_child` itself creates, and
//! one-shot timers via `tokio::time::sleep_until`. `next_event` is the
//! single thing `main.rs`'s loop awaits, generalizing the teacher's
//! `run_main_loop` `select!` (child exit / signal / timer tick) to an
//! arbitrary number of watched fds and pids.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::pin::Pin;

use futures::future::Future;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SocketError;
use crate::events::{ControllerEvent, ExitStatus, UnitManager, WatchHandle};
use crate::spawn;

struct RawFdSource(RawFd);

impl AsFd for RawFdSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd outlives this wrapper for as long as the entry
        // stays in `watched_fds`; we never close it ourselves.
        unsafe { BorrowedFd::borrow_raw(self.0) }
    }
}

enum PidWatch {
    /// A control process this manager itself spawned; we own the `Child`
    /// and can `.wait()` on it directly.
    Owned(Child),
    /// A pid reported to us from elsewhere (cold-plugged state); we poll
    /// it with a non-blocking `waitpid` loop instead.
    External(Pid),
}

/// A `tokio`-backed [`UnitManager`]. One instance drives exactly one
/// [`crate::controller::SocketUnit`] — the host process is expected to run
/// one per socket unit, same as the teacher's `main.rs` ran one
/// `ProcessManager` per subprocess.
pub struct TokioManager {
    next_handle: u64,
    watched_fds: HashMap<u64, AsyncFd<RawFdSource>>,
    watched_pids: HashMap<u64, PidWatch>,
    timers: HashMap<u64, Instant>,
    /// Children `spawn_child` created but the controller hasn't yet asked
    /// us to `watch_pid` for — moved into `watched_pids` as `Owned` so its
    /// exit is awaited directly instead of polled.
    pending_children: HashMap<i32, Child>,
}

impl Default for TokioManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioManager {
    pub fn new() -> Self {
        Self {
            next_handle: 0,
            watched_fds: HashMap::new(),
            watched_pids: HashMap::new(),
            timers: HashMap::new(),
            pending_children: HashMap::new(),
        }
    }

    fn next_handle(&mut self) -> WatchHandle {
        self.next_handle += 1;
        WatchHandle(self.next_handle)
    }

    fn earliest_timer(&self) -> Option<(WatchHandle, Instant)> {
        self.timers
            .iter()
            .min_by_key(|(_, &deadline)| deadline)
            .map(|(&id, &deadline)| (WatchHandle(id), deadline))
    }

    /// Waits for whichever registered event fires first: the earliest
    /// timer, any watched descriptor becoming readable, or any watched
    /// control process exiting. Mirrors the fixed ordering `ControllerEvent`
    /// documents (timer, then child exit, then descriptor readiness) by
    /// checking each `tokio::select!` branch's result in that priority when
    /// more than one is simultaneously ready.
    pub async fn next_event(&mut self) -> ControllerEvent {
        let timer_fut: Pin<Box<dyn Future<Output = WatchHandle> + Send + '_>> = match self.earliest_timer() {
            Some((handle, deadline)) => Box::pin(async move {
                tokio::time::sleep_until(deadline).await;
                handle
            }),
            None => Box::pin(futures::future::pending()),
        };

        // Each future below returns everything the caller needs (pid/fd)
        // by value, so no lookup into `self` is required once `select!`
        // picks a winner — that keeps the borrows of `self.watched_pids`/
        // `self.watched_fds` the loop bodies hold scoped to this block.
        let mut child_waits: FuturesUnordered<Pin<Box<dyn Future<Output = (WatchHandle, Pid, ExitStatus)> + Send + '_>>> =
            FuturesUnordered::new();
        for (&id, watch) in self.watched_pids.iter_mut() {
            match watch {
                PidWatch::Owned(child) => {
                    let pid = child.id().map(|p| Pid::from_raw(p as i32)).unwrap_or(Pid::from_raw(-1));
                    child_waits.push(Box::pin(async move {
                        let status = child.wait().await;
                        (WatchHandle(id), pid, tokio_status_to_exit_status(status))
                    }));
                }
                PidWatch::External(pid) => {
                    let pid = *pid;
                    child_waits.push(Box::pin(async move {
                        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
                        loop {
                            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                                Ok(WaitStatus::Exited(_, code)) => return (WatchHandle(id), pid, ExitStatus::Exited(code)),
                                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                                    return (
                                        WatchHandle(id),
                                        pid,
                                        ExitStatus::Signaled {
                                            signal: signal as i32,
                                            core_dumped,
                                        },
                                    )
                                }
                                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                                Err(nix::errno::Errno::ECHILD) => {
                                    // Not our direct child (cold-plugged pid):
                                    // poll for its continued existence instead.
                                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                                    if kill(pid, None).is_err() {
                                        return (WatchHandle(id), pid, ExitStatus::Exited(-1));
                                    }
                                }
                                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                            }
                        }
                    }));
                }
            }
        }

        let mut fd_waits: FuturesUnordered<Pin<Box<dyn Future<Output = (WatchHandle, RawFd)> + Send + '_>>> =
            FuturesUnordered::new();
        for (&id, async_fd) in self.watched_fds.iter() {
            let fd = async_fd.as_raw_fd();
            fd_waits.push(Box::pin(async move {
                let _ = async_fd.readable().await;
                (WatchHandle(id), fd)
            }));
        }

        tokio::select! {
            biased;
            handle = timer_fut => ControllerEvent::TimerExpired(handle),
            Some((_handle, pid, status)) = child_waits.next() => {
                ControllerEvent::ChildExited { pid, status }
            }
            Some((_handle, fd)) = fd_waits.next() => {
                ControllerEvent::DescriptorReady(fd)
            }
        }
    }

}

fn tokio_status_to_exit_status(status: std::io::Result<std::process::ExitStatus>) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                ExitStatus::Exited(code)
            } else if let Some(signal) = status.signal() {
                ExitStatus::Signaled {
                    signal,
                    core_dumped: status.core_dumped(),
                }
            } else {
                ExitStatus::Exited(-1)
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to read child exit status");
            ExitStatus::Exited(-1)
        }
    }
}

impl UnitManager for TokioManager {
    fn watch_fd(&mut self, fd: RawFd) -> Result<WatchHandle, SocketError> {
        let handle = self.next_handle();
        let async_fd = AsyncFd::new(RawFdSource(fd)).map_err(SocketError::Resources)?;
        self.watched_fds.insert(handle.0, async_fd);
        Ok(handle)
    }

    fn unwatch_fd(&mut self, handle: WatchHandle) {
        self.watched_fds.remove(&handle.0);
    }

    fn watch_pid(&mut self, pid: Pid) -> Result<WatchHandle, SocketError> {
        let handle = self.next_handle();
        let watch = match self.pending_children.remove(&pid.as_raw()) {
            Some(child) => PidWatch::Owned(child),
            None => PidWatch::External(pid),
        };
        self.watched_pids.insert(handle.0, watch);
        Ok(handle)
    }

    fn unwatch_pid(&mut self, handle: WatchHandle) {
        self.watched_pids.remove(&handle.0);
    }

    fn watch_timer(&mut self, timeout: std::time::Duration) -> Result<WatchHandle, SocketError> {
        let handle = self.next_handle();
        self.timers.insert(handle.0, Instant::now() + timeout);
        Ok(handle)
    }

    fn unwatch_timer(&mut self, handle: WatchHandle) {
        self.timers.remove(&handle.0);
    }

    fn spawn_child(&mut self, command: &str, args: &[String], env: &[(String, String)]) -> Result<Pid, SocketError> {
        let cmd = crate::config::ExecCommand {
            path: command.to_string(),
            args: args.to_vec(),
        };
        let control = spawn::spawn(&cmd, env)?;
        let pid = control.pid();
        self.pending_children.insert(pid.as_raw(), control.into_child());
        debug!(%pid, command, "control process registered with manager");
        Ok(pid)
    }

    fn kill_process_group(&mut self, pid: Pid, signal: Signal) -> Result<(), SocketError> {
        spawn::kill_process_group(pid, signal)
    }

    fn add_job(&mut self, fds: Vec<RawFd>, instance: Option<String>) -> Result<(), SocketError> {
        debug!(?fds, ?instance, "job enqueue is a host integration point, not implemented by this demo manager");
        Ok(())
    }

    fn notify_state_change(&mut self, state: &str, result: &str) {
        debug!(state, result, "state change");
    }

    fn queue_dbus_property_change(&mut self, property: &str) {
        debug!(property, "property change queued");
    }
}
