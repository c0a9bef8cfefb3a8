//! C7 — the textual snapshot format used to carry a socket unit's state and
//! live descriptors across a supervisor re-exec. Grammar is bit-exact with
//! `socket_serialize`/`socket_deserialize_item` in the original `socket.c`.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::unistd::{dup, Pid};
use tracing::debug;

use crate::address::SockType;
use crate::config::Phase;
use crate::error::SocketResult;
use crate::port::{Port, PortKind, PortTable};
use crate::state::SocketState;

/// The shared descriptor set that survives a re-exec. Serialization dups
/// each live port fd into this set under a fresh fd number (`copyfd`); the
/// reverse path removes them one at a time as ports are matched back up.
#[derive(Default)]
pub struct FdSet {
    map: HashMap<RawFd, OwnedFd>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dups `fd` and stores the copy under its own (new) fd number,
    /// returning that number for the caller to write into the snapshot.
    pub fn put_dup(&mut self, fd: RawFd) -> Result<RawFd, crate::error::SocketError> {
        let copy = dup(fd).map_err(crate::error::SocketError::from)?;
        // SAFETY: `dup` returns a fresh, uniquely owned descriptor.
        self.map.insert(copy, unsafe { OwnedFd::from_raw_fd(copy) });
        Ok(copy)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.map.contains_key(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<OwnedFd> {
        self.map.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One port record parsed out of a `socket`/`netlink`/`fifo`/`special`/
/// `mqueue` key (§4.7).
#[derive(Debug, Clone)]
pub enum PortRecord {
    Socket { copy_fd: RawFd, sock_type: SockType, literal: String },
    Netlink { copy_fd: RawFd, literal: String },
    Fifo { copy_fd: RawFd, path: String },
    Special { copy_fd: RawFd, path: String },
    Mqueue { copy_fd: RawFd, path: String },
}

impl PortRecord {
    fn copy_fd(&self) -> RawFd {
        match self {
            PortRecord::Socket { copy_fd, .. }
            | PortRecord::Netlink { copy_fd, .. }
            | PortRecord::Fifo { copy_fd, .. }
            | PortRecord::Special { copy_fd, .. }
            | PortRecord::Mqueue { copy_fd, .. } => *copy_fd,
        }
    }

    fn kind_tag(&self) -> &'static str {
        match self {
            PortRecord::Socket { .. } => "socket",
            PortRecord::Netlink { .. } => "netlink",
            PortRecord::Fifo { .. } => "fifo",
            PortRecord::Special { .. } => "special",
            PortRecord::Mqueue { .. } => "mqueue",
        }
    }

    fn literal(&self) -> String {
        match self {
            PortRecord::Socket { sock_type, literal, .. } => format!("{} {}", sock_type.as_str(), literal),
            PortRecord::Netlink { literal, .. } => literal.clone(),
            PortRecord::Fifo { path, .. } => path.clone(),
            PortRecord::Special { path, .. } => path.clone(),
            PortRecord::Mqueue { path, .. } => path.clone(),
        }
    }
}

/// The in-memory accumulation of everything `deserialize_item` has parsed
/// so far, restored into a fresh unit by `distribute_fds`/`coldplug`.
#[derive(Default)]
pub struct DeserializedState {
    pub state: Option<SocketState>,
    pub result: Option<SocketResult>,
    pub n_accepted: u64,
    pub control_pid: Option<Pid>,
    pub control_command: Option<Phase>,
    pub ports: Vec<PortRecord>,
}

/// Serializes the snapshot fields of a running unit. Callers pass the
/// fields they hold on `SocketUnit` directly, since this module doesn't
/// own the controller type (`controller.rs` depends on this one, not vice
/// versa).
#[allow(clippy::too_many_arguments)]
pub fn serialize(
    state: SocketState,
    result: SocketResult,
    n_accepted: u64,
    control_pid: Option<Pid>,
    control_command: Option<Phase>,
    ports: &PortTable,
    fds: &mut FdSet,
) -> Result<String, crate::error::SocketError> {
    let mut out = String::new();
    out.push_str(&format!("state {}\n", state.as_str()));
    out.push_str(&format!("result {}\n", result.as_str()));
    out.push_str(&format!("n-accepted {n_accepted}\n"));

    if let Some(pid) = control_pid {
        out.push_str(&format!("control-pid {pid}\n"));
    }
    if let Some(phase) = control_command {
        out.push_str(&format!("control-command {}\n", phase.as_str()));
    }

    for port in ports.ports() {
        let Some(fd) = port.fd() else { continue };
        let copy = fds.put_dup(fd)?;
        match &port.kind {
            PortKind::Socket {
                address,
                sock_type,
                ..
            } => {
                if matches!(address, crate::address::Address::Netlink { .. }) {
                    out.push_str(&format!("netlink {copy} {}\n", address.print()));
                } else {
                    out.push_str(&format!("socket {copy} {} {}\n", sock_type.as_str(), address.print()));
                }
            }
            PortKind::Fifo { path } => out.push_str(&format!("fifo {copy} {}\n", path.display())),
            PortKind::Special { path } => out.push_str(&format!("special {copy} {}\n", path.display())),
            PortKind::Mqueue { path, .. } => out.push_str(&format!("mqueue {copy} {}\n", path.display())),
        }
    }

    Ok(out)
}

/// Parses one `key value` line into `shadow`. Unknown keys are logged at
/// debug level and otherwise ignored (§8 scenario 6) — this never fails.
pub fn deserialize_item(shadow: &mut DeserializedState, key: &str, value: &str) {
    match key {
        "state" => match SocketState::from_str(value) {
            Some(s) => shadow.state = Some(s),
            None => debug!(value, "failed to parse state value"),
        },
        "result" => match SocketResult::from_str(value) {
            Some(r) if !r.is_success() => shadow.result = Some(r),
            Some(_) => {}
            None => debug!(value, "failed to parse result value"),
        },
        "n-accepted" => match value.parse::<u64>() {
            Ok(k) => shadow.n_accepted += k,
            Err(_) => debug!(value, "failed to parse n-accepted value"),
        },
        "control-pid" => match value.parse::<i32>() {
            Ok(pid) => shadow.control_pid = Some(Pid::from_raw(pid)),
            Err(_) => debug!(value, "failed to parse control-pid value"),
        },
        "control-command" => match Phase::from_str(value) {
            Some(p) => shadow.control_command = Some(p),
            None => debug!(value, "failed to parse control-command value"),
        },
        "socket" => {
            if let Some((copy_fd, rest)) = split_leading_int(value) {
                if let Some((sock_type_str, literal)) = rest.split_once(' ') {
                    if let Some(sock_type) = SockType::from_str(sock_type_str) {
                        shadow.ports.push(PortRecord::Socket {
                            copy_fd,
                            sock_type,
                            literal: literal.to_string(),
                        });
                        return;
                    }
                }
            }
            debug!(value, "failed to parse socket value");
        }
        "netlink" => match split_leading_int(value) {
            Some((copy_fd, literal)) => shadow.ports.push(PortRecord::Netlink {
                copy_fd,
                literal: literal.to_string(),
            }),
            None => debug!(value, "failed to parse netlink value"),
        },
        "fifo" => match split_leading_int(value) {
            Some((copy_fd, path)) => shadow.ports.push(PortRecord::Fifo {
                copy_fd,
                path: path.to_string(),
            }),
            None => debug!(value, "failed to parse fifo value"),
        },
        "special" => match split_leading_int(value) {
            Some((copy_fd, path)) => shadow.ports.push(PortRecord::Special {
                copy_fd,
                path: path.to_string(),
            }),
            None => debug!(value, "failed to parse special value"),
        },
        "mqueue" => match split_leading_int(value) {
            Some((copy_fd, path)) => shadow.ports.push(PortRecord::Mqueue {
                copy_fd,
                path: path.to_string(),
            }),
            None => debug!(value, "failed to parse mqueue value"),
        },
        other => debug!(key = other, value, "ignoring unknown serialized key"),
    }
}

fn split_leading_int(value: &str) -> Option<(RawFd, &str)> {
    let (num, rest) = value.split_once(' ')?;
    let fd: RawFd = num.parse().ok()?;
    Some((fd, rest))
}

/// Matches every parsed port record to a closed port in `ports` by kind +
/// address/path equality, stealing its descriptor from `fds` and adopting
/// it. Matched ports end up open; unmatched records are dropped (stale
/// configuration) and their fds simply never get claimed — the caller is
/// responsible for disposing of any descriptors left in `fds` afterward.
pub fn distribute_fds(shadow: &DeserializedState, ports: &mut PortTable, fds: &mut FdSet) {
    for record in &shadow.ports {
        let copy_fd = record.copy_fd();
        if !fds.contains(copy_fd) {
            continue;
        }
        let kind_tag = record.kind_tag();
        let literal = record.literal();
        let matched = ports
            .ports_mut()
            .iter_mut()
            .find(|p| !p.is_open() && p.matches_record(kind_tag, &literal));
        match matched {
            Some(port) => {
                if let Some(fd) = fds.remove(copy_fd) {
                    port.adopt_fd(fd);
                }
            }
            None => debug!(kind_tag, literal, "no matching port for serialized record, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::options::SocketOptions;
    use crate::port::PortKind;

    #[test]
    fn round_trips_state_result_and_n_accepted() {
        let mut fds = FdSet::new();
        let ports = PortTable::new(vec![]);
        let text = serialize(SocketState::Listening, SocketResult::Success, 42, None, None, &ports, &mut fds).unwrap();

        let mut shadow = DeserializedState::default();
        for line in text.lines() {
            let (key, value) = line.split_once(' ').unwrap();
            deserialize_item(&mut shadow, key, value);
        }

        assert_eq!(shadow.state, Some(SocketState::Listening));
        assert_eq!(shadow.n_accepted, 42);
    }

    #[test]
    fn unknown_key_is_ignored_without_touching_other_fields() {
        let mut shadow = DeserializedState::default();
        deserialize_item(&mut shadow, "state", "listening");
        deserialize_item(&mut shadow, "totally-unknown-key", "whatever");
        assert_eq!(shadow.state, Some(SocketState::Listening));
        assert!(shadow.ports.is_empty());
    }

    #[test]
    fn distributes_an_open_stream_socket_fd_back_onto_a_matching_port() {
        let opts = SocketOptions::default();
        let mut original = PortTable::new(vec![Port::new(PortKind::Socket {
            address: Address::parse("127.0.0.1:0").unwrap(),
            sock_type: SockType::Stream,
            accept_mode: true,
        })]);
        original.open_all(&opts).unwrap();
        let address_literal = match &original.ports()[0].kind {
            PortKind::Socket { address, .. } => address.print(),
            _ => unreachable!(),
        };

        let mut fds = FdSet::new();
        let text = serialize(SocketState::Listening, SocketResult::Success, 0, None, None, &original, &mut fds).unwrap();

        let mut shadow = DeserializedState::default();
        for line in text.lines() {
            let (key, value) = line.split_once(' ').unwrap();
            deserialize_item(&mut shadow, key, value);
        }

        let mut fresh = PortTable::new(vec![Port::new(PortKind::Socket {
            address: Address::parse(&address_literal).unwrap(),
            sock_type: SockType::Stream,
            accept_mode: true,
        })]);
        distribute_fds(&shadow, &mut fresh, &mut fds);
        assert!(fresh.ports()[0].is_open());
    }
}
