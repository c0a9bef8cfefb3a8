//! C1 — the port table: typed listening endpoints, opened/bound/listened in
//! declaration order, closed in reverse order on rollback.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sys::socket::{self, SockFlag};
use nix::sys::stat::{fstat, Mode, SFlag};
use nix::unistd::{getuid, mkfifo};
use socket2::Socket;
use tracing::{debug, warn};

use crate::address::{Address, SockType, UnixAddress};
use crate::error::SocketError;
use crate::events::WatchHandle;
use crate::options::SocketOptions;

/// Attributes for a POSIX message queue port.
#[derive(Debug, Clone, Copy)]
pub struct MqueueAttrs {
    pub max_messages: i64,
    pub max_message_size: i64,
}

impl Default for MqueueAttrs {
    fn default() -> Self {
        Self {
            max_messages: 10,
            max_message_size: 8192,
        }
    }
}

/// The tagged-variant redesign of the original's `kind` field + switch
/// (spec.md §9): one branch per port kind, each carrying only the data that
/// kind needs.
#[derive(Debug, Clone)]
pub enum PortKind {
    Socket {
        address: Address,
        sock_type: SockType,
        accept_mode: bool,
    },
    Fifo {
        path: PathBuf,
    },
    Special {
        path: PathBuf,
    },
    Mqueue {
        path: PathBuf,
        attrs: MqueueAttrs,
    },
}

impl PortKind {
    pub fn describe(&self) -> String {
        match self {
            PortKind::Socket { address, sock_type, .. } => {
                format!("socket {} {}", sock_type.as_str(), address)
            }
            PortKind::Fifo { path } => format!("fifo {}", path.display()),
            PortKind::Special { path } => format!("special {}", path.display()),
            PortKind::Mqueue { path, .. } => format!("mqueue {}", path.display()),
        }
    }
}

/// One listening endpoint. The descriptor is closed automatically on drop
/// (an `OwnedFd`, not a bare `RawFd`) — the redesign guidance in spec.md §9
/// asks for exactly this.
pub struct Port {
    pub kind: PortKind,
    pub directory_mode: u32,
    pub socket_mode: u32,
    pub backlog: u32,
    fd: Option<OwnedFd>,
    watch: Option<WatchHandle>,
}

impl Port {
    pub fn new(kind: PortKind) -> Self {
        Self {
            kind,
            directory_mode: 0o755,
            socket_mode: 0o666,
            backlog: 128,
            fd: None,
            watch: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn borrowed_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|f| f.as_fd())
    }

    pub fn watch_handle(&self) -> Option<WatchHandle> {
        self.watch
    }

    pub fn accept_mode(&self) -> bool {
        matches!(
            self.kind,
            PortKind::Socket { accept_mode: true, .. }
        )
    }

    pub fn set_accept_mode(&mut self, accept: bool) {
        if let PortKind::Socket { accept_mode, .. } = &mut self.kind {
            *accept_mode = accept;
        }
    }

    /// Matches this port against a serialized record by kind + address/path
    /// equality, per §4.7's restore rule.
    pub fn matches_record(&self, kind_tag: &str, literal: &str) -> bool {
        match (&self.kind, kind_tag) {
            (PortKind::Socket { address, sock_type, .. }, "socket") if !matches!(address, Address::Netlink { .. }) => {
                format!("{} {}", sock_type.as_str(), address.print()) == literal
            }
            (PortKind::Socket { address: address @ Address::Netlink { .. }, .. }, "netlink") => {
                address.print() == literal
            }
            (PortKind::Fifo { path }, "fifo") => path.to_string_lossy() == literal,
            (PortKind::Special { path }, "special") => path.to_string_lossy() == literal,
            (PortKind::Mqueue { path, .. }, "mqueue") => path.to_string_lossy() == literal,
            _ => false,
        }
    }

    /// Adopts an already-open descriptor restored from a re-exec (§4.7),
    /// bypassing `open()`. The caller is responsible for having matched
    /// this port to the right serialized record first.
    pub(crate) fn adopt_fd(&mut self, fd: OwnedFd) {
        self.fd = Some(fd);
    }

    fn open_socket(&self, address: &Address, sock_type: SockType) -> Result<OwnedFd, SocketError> {
        let protocol = address.protocol(sock_type);
        let socket = Socket::new(address.domain(), sock_type.to_socket2(), protocol)
            .map_err(SocketError::Resources)?;
        socket.set_nonblocking(true).map_err(SocketError::Resources)?;

        match address {
            Address::Inet(addr) => {
                socket.bind(&(*addr).into()).map_err(SocketError::Resources)?;
            }
            Address::Unix(UnixAddress::Path(path)) => {
                let _ = std::fs::remove_file(path);
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let sock_addr = socket2::SockAddr::unix(path).map_err(SocketError::Resources)?;
                socket.bind(&sock_addr).map_err(SocketError::Resources)?;
                let _ = std::fs::set_permissions(
                    path,
                    std::os::unix::fs::PermissionsExt::from_mode(self.socket_mode),
                );
            }
            Address::Unix(UnixAddress::Abstract(name)) => {
                bind_abstract_unix(socket.as_raw_fd(), name)?;
            }
            Address::Netlink { protocol: _, groups } => {
                bind_netlink(socket.as_raw_fd(), *groups)?;
            }
        }

        if sock_type.is_connection_oriented() && address.is_listenable_stream_family() {
            socket.listen(self.backlog as i32).map_err(SocketError::Resources)?;
        }

        // SAFETY: `socket` owns a valid, open fd; we take ownership via into_raw_fd
        // immediately and wrap it, so no double-close happens.
        Ok(unsafe { OwnedFd::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(socket)) })
    }

    fn open_fifo(&self, path: &Path) -> Result<OwnedFd, SocketError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(SocketError::Resources)?;
            let _ = std::fs::set_permissions(
                parent,
                std::os::unix::fs::PermissionsExt::from_mode(self.directory_mode),
            );
        }

        match mkfifo(path, Mode::from_bits_truncate(self.socket_mode)) {
            Ok(()) => {}
            Err(nix::Error::EEXIST) => {
                debug!(path = %path.display(), "FIFO already exists, reusing");
            }
            Err(e) => return Err(SocketError::Resources(std::io::Error::from(e))),
        }

        let flags = OFlag::O_RDWR
            | OFlag::O_NONBLOCK
            | OFlag::O_CLOEXEC
            | OFlag::O_NOCTTY
            | OFlag::O_NOFOLLOW;
        let fd = open(path, flags, Mode::empty()).map_err(|e| SocketError::Resources(e.into()))?;
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let st = fstat(owned.as_raw_fd()).map_err(|e| SocketError::Resources(e.into()))?;
        if !SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFIFO) {
            return Err(SocketError::Validation(vec![format!(
                "{} exists and is not a FIFO",
                path.display()
            )]));
        }
        if st.st_uid != getuid().as_raw() {
            return Err(SocketError::Validation(vec![format!(
                "{} exists but is not owned by the current user",
                path.display()
            )]));
        }
        if st.st_mode & 0o777 != self.socket_mode & 0o777 {
            warn!(path = %path.display(), "FIFO mode differs from configured socket_mode");
        }

        Ok(owned)
    }

    fn open_special(&self, path: &Path) -> Result<OwnedFd, SocketError> {
        let flags = OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC;
        let fd = open(path, flags, Mode::empty()).map_err(|e| SocketError::Resources(e.into()))?;
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let st = fstat(owned.as_raw_fd()).map_err(|e| SocketError::Resources(e.into()))?;
        let mode = SFlag::from_bits_truncate(st.st_mode);
        if !(mode.contains(SFlag::S_IFREG) || mode.contains(SFlag::S_IFCHR)) {
            return Err(SocketError::Validation(vec![format!(
                "{} is neither a regular file nor a character device",
                path.display()
            )]));
        }

        Ok(owned)
    }

    fn open_mqueue(&self, path: &Path, attrs: &MqueueAttrs) -> Result<OwnedFd, SocketError> {
        use nix::mqueue::{mq_open, MQ_OFlag, MqAttr};

        let name = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| SocketError::Validation(vec!["mqueue path contains a NUL byte".into()]))?;
        let attr = MqAttr::new(0, attrs.max_messages, attrs.max_message_size, 0);
        let flags = MQ_OFlag::O_RDWR | MQ_OFlag::O_CREAT | MQ_OFlag::O_NONBLOCK;
        mq_open(&name, flags, Mode::from_bits_truncate(self.socket_mode), Some(&attr))
            .map_err(|e| SocketError::Resources(e.into()))
    }

    /// Opens this port if it is currently closed. No-op if already open
    /// (idempotence, per §4.1 and the property in §8).
    fn open(&mut self, opts: &SocketOptions) -> Result<(), SocketError> {
        if self.is_open() {
            return Ok(());
        }
        let fd = match &self.kind {
            PortKind::Socket { address, sock_type, .. } => {
                let fd = self.open_socket(address, *sock_type)?;
                opts.apply(fd.as_raw_fd(), *sock_type)?;
                fd
            }
            PortKind::Fifo { path } => {
                let fd = self.open_fifo(&path.clone())?;
                opts.apply_fifo(fd.as_raw_fd())?;
                fd
            }
            PortKind::Special { path } => self.open_special(&path.clone())?,
            PortKind::Mqueue { path, attrs } => self.open_mqueue(&path.clone(), attrs)?,
        };
        self.fd = Some(fd);
        Ok(())
    }

    /// Closes the descriptor if open. Never unlinks the filesystem object —
    /// that is the re-creation path's job, not teardown's (§4.1).
    fn close(&mut self) {
        self.fd = None;
        self.watch = None;
    }
}

fn bind_abstract_unix(fd: RawFd, name: &str) -> Result<(), SocketError> {
    use std::mem::size_of;
    unsafe {
        let mut sockaddr: libc::sockaddr_un = std::mem::zeroed();
        sockaddr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = name.as_bytes();
        let len = bytes.len().min(sockaddr.sun_path.len() - 1);
        // sun_path[0] stays 0: the leading NUL is what makes this abstract.
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            sockaddr.sun_path.as_mut_ptr().add(1) as *mut u8,
            len,
        );
        let addr_len = (size_of::<libc::sa_family_t>() + 1 + len) as libc::socklen_t;
        if libc::bind(fd, &sockaddr as *const _ as *const libc::sockaddr, addr_len) < 0 {
            return Err(SocketError::Resources(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn bind_netlink(fd: RawFd, groups: u32) -> Result<(), SocketError> {
    unsafe {
        let mut sockaddr: libc::sockaddr_nl = std::mem::zeroed();
        sockaddr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sockaddr.nl_groups = groups;
        let addr_len = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        if libc::bind(fd, &sockaddr as *const _ as *const libc::sockaddr, addr_len) < 0 {
            return Err(SocketError::Resources(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// The ordered collection of a socket unit's configured ports.
pub struct PortTable {
    ports: Vec<Port>,
}

impl PortTable {
    pub fn new(ports: Vec<Port>) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut [Port] {
        &mut self.ports
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn collect_fds(&self) -> Vec<RawFd> {
        self.ports.iter().filter_map(Port::fd).collect()
    }

    pub fn all_open(&self) -> bool {
        self.ports.iter().all(Port::is_open)
    }

    pub fn all_closed(&self) -> bool {
        self.ports.iter().all(|p| !p.is_open())
    }

    /// Opens every closed port in declaration order. On failure, rolls back
    /// by closing every port this call opened (not ports that were already
    /// open before the call), in reverse order.
    pub fn open_all(&mut self, opts: &SocketOptions) -> Result<(), SocketError> {
        let mut opened_this_call = Vec::new();
        for (idx, port) in self.ports.iter_mut().enumerate() {
            if port.is_open() {
                continue;
            }
            match port.open(opts) {
                Ok(()) => opened_this_call.push(idx),
                Err(e) => {
                    for idx in opened_this_call.into_iter().rev() {
                        self.ports[idx].close();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Closes every open descriptor. Idempotent. Never unlinks filesystem
    /// objects.
    pub fn close_all(&mut self) {
        for port in self.ports.iter_mut() {
            port.close();
        }
    }

    /// Installs a readable-readiness watch on every open, unwatched
    /// descriptor.
    pub fn watch_all(&mut self, manager: &mut dyn crate::events::UnitManager) -> Result<(), SocketError> {
        for port in self.ports.iter_mut() {
            if port.watch.is_some() {
                continue;
            }
            if let Some(fd) = port.fd() {
                let handle = manager.watch_fd(fd)?;
                port.watch = Some(handle);
            }
        }
        Ok(())
    }

    /// Removes the readiness watch from every port, without closing the
    /// descriptor.
    pub fn unwatch_all(&mut self, manager: &mut dyn crate::events::UnitManager) {
        for port in self.ports.iter_mut() {
            if let Some(handle) = port.watch.take() {
                manager.unwatch_fd(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SockType;

    fn loopback_port() -> Port {
        Port::new(PortKind::Socket {
            address: Address::parse("127.0.0.1:0").unwrap(),
            sock_type: SockType::Stream,
            accept_mode: true,
        })
    }

    #[test]
    fn open_all_is_idempotent() {
        let opts = SocketOptions::default();
        let mut table = PortTable::new(vec![loopback_port()]);
        table.open_all(&opts).unwrap();
        assert!(table.all_open());
        let fd_before = table.ports()[0].fd();
        table.open_all(&opts).unwrap();
        assert_eq!(table.ports()[0].fd(), fd_before, "re-opening must not touch an already-open port");
    }

    #[test]
    fn close_all_is_idempotent() {
        let opts = SocketOptions::default();
        let mut table = PortTable::new(vec![loopback_port()]);
        table.open_all(&opts).unwrap();
        table.close_all();
        assert!(table.all_closed());
        table.close_all();
        assert!(table.all_closed());
    }

    #[test]
    fn fifo_round_trip_create_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fifo");
        let opts = SocketOptions::default();

        let mut first = PortTable::new(vec![Port::new(PortKind::Fifo { path: path.clone() })]);
        first.open_all(&opts).unwrap();
        first.close_all();
        assert!(path.exists());

        let mut second = PortTable::new(vec![Port::new(PortKind::Fifo { path })]);
        second.open_all(&opts).unwrap();
        assert!(second.all_open());
    }

    #[test]
    fn rollback_closes_ports_opened_during_a_failed_open_all() {
        let opts = SocketOptions::default();
        let bad = Port::new(PortKind::Special {
            path: PathBuf::from("/nonexistent/path/for/sure"),
        });
        let mut table = PortTable::new(vec![loopback_port(), bad]);
        let result = table.open_all(&opts);
        assert!(result.is_err());
        assert!(table.all_closed());
    }
}
