//! C6 — accept/dispatch policy: what happens when a listening port becomes
//! readable, for both shared-service and per-connection (`accept`) units.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{accept4, SockFlag};
use tracing::{debug, warn};

use crate::error::SocketError;
use crate::instance::encode_instance;

/// One outcome of draining a single readiness event on an accept-mode port.
pub enum AcceptOutcome {
    /// A connection was accepted, counted, and named; `fd` is the caller's
    /// to hand to the host manager's `add_job` for the freshly named
    /// service instance.
    Accepted { fd: OwnedFd, instance: String },
    /// `n_connections` was already at `max_connections`; the connection was
    /// closed immediately without being counted (§8's back-pressure
    /// invariant).
    BackPressured,
    /// The peer disconnected between `accept` and instance encoding
    /// (`ENOTCONN`); non-fatal, not counted (§4.4's tie-break).
    PeerReset,
}

/// Drains every connection currently pending on `listen_fd`, applying
/// back-pressure against `max_connections` and bumping `n_accepted`/
/// `n_connections` for each one actually accepted. Stops at `EAGAIN`;
/// retries on `EINTR`; any other `accept4` failure is reported as a
/// resource error (§4.4: "any other error transitions via stop-pre
/// (resources)").
pub fn drain_accept(
    listen_fd: RawFd,
    n_accepted: &mut u64,
    n_connections: &mut u32,
    max_connections: u32,
) -> Result<Vec<AcceptOutcome>, SocketError> {
    let mut outcomes = Vec::new();
    loop {
        match accept4(listen_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(raw_fd) => {
                // SAFETY: accept4 returns a freshly created, uniquely owned descriptor.
                let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };
                outcomes.push(handle_accepted(fd, n_accepted, n_connections, max_connections)?);
            }
            Err(nix::Error::EINTR) => continue,
            Err(nix::Error::EAGAIN) => break,
            Err(e) => return Err(SocketError::from(e)),
        }
    }
    Ok(outcomes)
}

fn handle_accepted(
    fd: OwnedFd,
    n_accepted: &mut u64,
    n_connections: &mut u32,
    max_connections: u32,
) -> Result<AcceptOutcome, SocketError> {
    if *n_connections >= max_connections {
        warn!(max_connections, "refusing connection: at capacity");
        drop(fd);
        return Ok(AcceptOutcome::BackPressured);
    }

    let candidate_n = *n_accepted + 1;
    match encode_instance(fd.as_raw_fd(), candidate_n) {
        Ok(instance) => {
            *n_accepted = candidate_n;
            *n_connections += 1;
            debug!(instance, n_connections, "accepted connection");
            Ok(AcceptOutcome::Accepted { fd, instance })
        }
        Err(SocketError::Resources(ref io_err)) if io_err.raw_os_error() == Some(libc::ENOTCONN) => {
            debug!("peer reset between accept and instance encoding");
            Ok(AcceptOutcome::PeerReset)
        }
        Err(e) => Err(e),
    }
}

/// Turns this unit's identity and an instance name into the per-connection
/// service unit name (§4.6: `"<prefix>@<instance>.service"`).
pub fn instanced_service_name(identity: &str, instance: &str) -> String {
    let prefix = identity.strip_suffix(".socket").unwrap_or(identity);
    format!("{prefix}@{instance}.service")
}
