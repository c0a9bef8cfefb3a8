//! One-shot helper command execution for the controller's four phases
//! (start-pre/start-post/stop-pre/stop-post). Narrowed from the teacher's
//! `process_manager.rs` long-running-subprocess-with-restart shape down to
//! "run one command to completion and report how it exited" — the
//! controller's FSM is the thing that decides what happens next, not this
//! module.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ExecCommand;
use crate::error::SocketError;
use crate::events::ExitStatus;

/// A running (or just-spawned) control process for one phase.
pub struct ControlProcess {
    child: Child,
    pid: Pid,
}

impl ControlProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Unwraps the underlying handle for a manager that wants to await its
    /// exit directly instead of through [`ControlProcess::wait`].
    pub fn into_child(self) -> Child {
        self.child
    }

    /// Waits for the process to exit and classifies the result (§4.4's
    /// `child_exited` classification).
    pub async fn wait(&mut self) -> Result<ExitStatus, SocketError> {
        let status = self.child.wait().await.map_err(SocketError::Resources)?;
        Ok(classify(status))
    }

    /// Non-blocking check for exit, used by the manager shim's `select!` arm.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, SocketError> {
        match self.child.try_wait().map_err(SocketError::Resources)? {
            Some(status) => Ok(Some(classify(status))),
            None => Ok(None),
        }
    }
}

fn classify(status: std::process::ExitStatus) -> ExitStatus {
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

/// Spawns one helper command, in its own process group, with the given
/// environment appended to the current one. Resets the child's signal mask
/// before exec so it doesn't inherit whatever the controller's process
/// has blocked for its own `sigwait` loop.
pub fn spawn(command: &ExecCommand, env: &[(String, String)]) -> Result<ControlProcess, SocketError> {
    info!(command = %command.path, args = ?command.args, "spawning control process");

    let mut cmd = Command::new(&command.path);
    cmd.args(&command.args);
    cmd.process_group(0);
    cmd.kill_on_drop(false);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    unsafe {
        cmd.pre_exec(|| {
            use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = cmd.spawn().map_err(SocketError::Resources)?;
    let raw_pid = child.id().ok_or_else(|| {
        SocketError::Resources(std::io::Error::other("spawned child has no pid"))
    })?;
    let pid = Pid::from_raw(raw_pid as i32);

    debug!(%pid, "control process spawned");
    Ok(ControlProcess { child, pid })
}

/// Sends `signal` to the process group led by `pid` (§6's
/// `kill_process_group`). Returns `Ok(())` both when the signal was
/// delivered and when the group no longer exists (ESRCH) — there being
/// nothing left to kill is not itself an error.
pub fn kill_process_group(pid: Pid, signal: NixSignal) -> Result<(), SocketError> {
    let pgid = match getpgid(Some(pid)) {
        Ok(pgid) => pgid,
        Err(nix::Error::ESRCH) => return Ok(()),
        Err(e) => return Err(SocketError::from(e)),
    };
    match kill(Pid::from_raw(-pgid.as_raw()), signal) {
        Ok(()) => {
            debug!(%pid, ?signal, "signal delivered to control process group");
            Ok(())
        }
        Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => {
            warn!(%pid, ?signal, error = %e, "failed to signal control process group");
            Err(SocketError::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_waits_for_a_successful_command() {
        let cmd = ExecCommand {
            path: "/bin/true".to_string(),
            args: vec![],
        };
        let mut proc = spawn(&cmd, &[]).unwrap();
        let status = proc.wait().await.unwrap();
        assert!(status.is_success());
    }

    #[tokio::test]
    async fn classifies_a_nonzero_exit_code() {
        let cmd = ExecCommand {
            path: "/bin/false".to_string(),
            args: vec![],
        };
        let mut proc = spawn(&cmd, &[]).unwrap();
        let status = proc.wait().await.unwrap();
        assert!(!status.is_success());
        assert!(matches!(status.into_error(), Some(SocketError::ExitCode(1))));
    }

    #[tokio::test]
    async fn passes_environment_variables_to_the_child() {
        let cmd = ExecCommand {
            path: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "test \"$SCINIT_TEST\" = ok".to_string()],
        };
        let mut proc = spawn(&cmd, &[("SCINIT_TEST".to_string(), "ok".to_string())]).unwrap();
        let status = proc.wait().await.unwrap();
        assert!(status.is_success());
    }

    #[test]
    fn killing_a_nonexistent_process_group_is_not_an_error() {
        assert!(kill_process_group(Pid::from_raw(i32::MAX - 1), NixSignal::SIGTERM).is_ok());
    }
}
