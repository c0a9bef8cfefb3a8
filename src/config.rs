//! The configuration block of §3: validated, immutable-after-load input
//! that drives port-table construction, the options applier, and the
//! controller's phase/timeout/accept behavior.

use std::time::Duration;

use crate::address::{Address, SockType};
use crate::error::SocketError;
use crate::options::SocketOptions;
use crate::port::{MqueueAttrs, Port, PortKind};

/// One phase's helper command: the program and its already `%`-expanded
/// argument vector (placeholder expansion is the caller's responsibility,
/// per §6 — it happens before `spawn_child` is called).
#[derive(Debug, Clone)]
pub struct ExecCommand {
    pub path: String,
    pub args: Vec<String>,
}

/// The four helper-command phases of §3/GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StartPre,
    StartPost,
    StopPre,
    StopPost,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::StartPre => "start-pre",
            Phase::StartPost => "start-post",
            Phase::StopPre => "stop-pre",
            Phase::StopPost => "stop-post",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "start-pre" => Phase::StartPre,
            "start-post" => Phase::StartPost,
            "stop-pre" => Phase::StopPre,
            "stop-post" => Phase::StopPost,
            _ => return None,
        })
    }
}

/// A single `listen_*` directive: an address plus the socket type it binds,
/// or a non-socket filesystem kind.
#[derive(Debug, Clone)]
pub enum ListenDirective {
    Socket { address: Address, sock_type: SockType },
    Fifo(std::path::PathBuf),
    Special(std::path::PathBuf),
    Mqueue(std::path::PathBuf),
}

/// The validated, immutable configuration block of §3.
#[derive(Debug, Clone)]
pub struct SocketUnitConfig {
    pub identity: String,
    pub listen: Vec<ListenDirective>,
    pub backlog: u32,
    pub directory_mode: u32,
    pub socket_mode: u32,
    pub accept: bool,
    pub max_connections: u32,
    pub timeout: Duration,
    pub kill_mode_send_sigkill: bool,
    pub mqueue_attrs: MqueueAttrs,
    pub options: SocketOptions,
    pub start_pre: Vec<ExecCommand>,
    pub start_post: Vec<ExecCommand>,
    pub stop_pre: Vec<ExecCommand>,
    pub stop_post: Vec<ExecCommand>,
    /// Set when this unit is in shared-service mode; `None` for `accept`
    /// units, whose service is derived per-connection instead (§3's "accept
    /// ⇒ no explicit shared-service reference").
    pub shared_service: Option<String>,
}

impl SocketUnitConfig {
    pub fn commands_for(&self, phase: Phase) -> &[ExecCommand] {
        match phase {
            Phase::StartPre => &self.start_pre,
            Phase::StartPost => &self.start_post,
            Phase::StopPre => &self.stop_pre,
            Phase::StopPost => &self.stop_post,
        }
    }

    /// Builds the port table this configuration describes, one [`Port`] per
    /// `listen_*` directive in declaration order.
    pub fn build_ports(&self) -> Vec<Port> {
        self.listen
            .iter()
            .map(|d| match d {
                ListenDirective::Socket { address, sock_type } => Port::new(PortKind::Socket {
                    address: address.clone(),
                    sock_type: *sock_type,
                    accept_mode: self.accept,
                }),
                ListenDirective::Fifo(path) => Port::new(PortKind::Fifo { path: path.clone() }),
                ListenDirective::Special(path) => Port::new(PortKind::Special { path: path.clone() }),
                ListenDirective::Mqueue(path) => Port::new(PortKind::Mqueue {
                    path: path.clone(),
                    attrs: self.mqueue_attrs,
                }),
            })
            .map(|mut p| {
                p.directory_mode = self.directory_mode;
                p.socket_mode = self.socket_mode;
                p.backlog = self.backlog;
                p
            })
            .collect()
    }

    /// Checks every invariant from §3, collecting *all* violations rather
    /// than failing on the first (mirrors `socket_verify()` in the original
    /// `socket.c`, which logs every problem it finds before refusing load).
    pub fn validate(&self) -> Result<(), SocketError> {
        let mut problems = Vec::new();

        if self.accept {
            for d in &self.listen {
                match d {
                    ListenDirective::Socket { address, sock_type } => {
                        if !sock_type.is_connection_oriented() {
                            problems.push(format!(
                                "accept=true requires a connection-oriented socket type, found {}",
                                sock_type.as_str()
                            ));
                        }
                        if !address.is_listenable_stream_family() {
                            problems.push(format!("accept=true requires a listenable address, found {address}"));
                        }
                    }
                    other => problems.push(format!(
                        "accept=true requires every port to be a socket, found a non-socket port ({other:?})"
                    )),
                }
            }
            if self.max_connections == 0 {
                problems.push("accept=true requires max_connections > 0".to_string());
            }
            if self.shared_service.is_some() {
                problems.push(
                    "accept=true units derive their service per-connection and must not configure a shared service"
                        .to_string(),
                );
            }
        } else if self.shared_service.is_none() {
            problems.push("accept=false requires a shared service reference".to_string());
        }

        if self.listen.is_empty() {
            problems.push("at least one listen_* directive is required".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SocketError::Validation(problems))
        }
    }
}

impl std::fmt::Debug for ListenDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenDirective::Socket { address, sock_type } => {
                write!(f, "Socket({}, {})", sock_type.as_str(), address)
            }
            ListenDirective::Fifo(p) => write!(f, "Fifo({})", p.display()),
            ListenDirective::Special(p) => write!(f, "Special({})", p.display()),
            ListenDirective::Mqueue(p) => write!(f, "Mqueue({})", p.display()),
        }
    }
}

/// Builds a minimal, valid accept-mode configuration for one stream
/// address — convenience used by the CLI and by tests.
pub fn accept_stream_config(identity: String, address: Address, max_connections: u32, timeout: Duration) -> SocketUnitConfig {
    SocketUnitConfig {
        identity,
        listen: vec![ListenDirective::Socket {
            address,
            sock_type: SockType::Stream,
        }],
        backlog: 128,
        directory_mode: 0o755,
        socket_mode: 0o666,
        accept: true,
        max_connections,
        timeout,
        kill_mode_send_sigkill: true,
        mqueue_attrs: MqueueAttrs::default(),
        options: SocketOptions::default(),
        start_pre: Vec::new(),
        start_post: Vec::new(),
        stop_pre: Vec::new(),
        stop_post: Vec::new(),
        shared_service: None,
    }
}

/// Builds a minimal, valid shared-service configuration for one address.
pub fn shared_service_config(
    identity: String,
    listen: ListenDirective,
    service: String,
    timeout: Duration,
) -> SocketUnitConfig {
    SocketUnitConfig {
        identity,
        listen: vec![listen],
        backlog: 128,
        directory_mode: 0o755,
        socket_mode: 0o666,
        accept: false,
        max_connections: 64,
        timeout,
        kill_mode_send_sigkill: true,
        mqueue_attrs: MqueueAttrs::default(),
        options: SocketOptions::default(),
        start_pre: Vec::new(),
        start_post: Vec::new(),
        stop_pre: Vec::new(),
        stop_post: Vec::new(),
        shared_service: Some(service),
    }
}
