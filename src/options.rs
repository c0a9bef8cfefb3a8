//! C2 — idempotent, best-effort application of kernel-level tunables to an
//! open descriptor. Each tunable is attempted independently; a failure is
//! logged and does not abort activation, except that the receive/send
//! buffer sizes try the privileged override first and only then the
//! unprivileged setter (§4.2).

use std::mem::size_of;
use std::os::fd::RawFd;

use nix::sys::socket::{setsockopt, sockopt};
use tracing::warn;

use crate::address::SockType;
use crate::error::SocketError;

/// One extended-attribute label to apply to an accepted/opened descriptor.
/// Best-effort; failures are logged uniformly at `warn!` (spec.md's Open
/// Question on log-level asymmetry is resolved toward uniformity — see
/// DESIGN.md).
#[derive(Debug, Clone)]
pub struct XattrLabel {
    pub name: String,
    pub value: Vec<u8>,
}

/// `bind_ipv6_only` modes, §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ipv6Only {
    #[default]
    Default,
    Both,
    Ipv6Only,
}

/// The options applier's configuration: one field per tunable named in §3.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub bind_ipv6_only: Ipv6Only,
    pub bind_to_device: Option<String>,
    pub free_bind: bool,
    pub transparent: bool,
    pub broadcast: bool,
    pub keep_alive: bool,
    pub pass_credentials: bool,
    pub pass_security: bool,
    pub priority: Option<i32>,
    pub ip_tos: Option<i32>,
    pub ip_ttl: Option<i32>,
    pub mark: Option<i32>,
    pub receive_buffer: Option<usize>,
    pub send_buffer: Option<usize>,
    pub pipe_size: Option<usize>,
    pub tcp_congestion: Option<String>,
    pub incoming_label: Option<XattrLabel>,
    pub outgoing_label: Option<XattrLabel>,
}

fn set_raw(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl SocketOptions {
    /// Applies the full tunable set to a socket descriptor (§4.2's "full
    /// set" for sockets). Never returns an error for any individual
    /// tunable's failure — those are logged and skipped.
    pub fn apply(&self, fd: RawFd, sock_type: SockType) -> Result<(), SocketError> {
        if self.keep_alive {
            if let Err(e) = setsockopt(&unsafe_borrow(fd), sockopt::KeepAlive, &true) {
                warn!(error = %e, "failed to set SO_KEEPALIVE");
            }
        }

        if self.broadcast {
            if let Err(e) = setsockopt(&unsafe_borrow(fd), sockopt::Broadcast, &true) {
                warn!(error = %e, "failed to set SO_BROADCAST");
            }
        }

        if let Some(priority) = self.priority {
            if let Err(e) = set_raw(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, priority) {
                warn!(error = %e, "failed to set SO_PRIORITY");
            }
        }

        if let Some(mark) = self.mark {
            if let Err(e) = set_raw(fd, libc::SOL_SOCKET, libc::SO_MARK, mark) {
                warn!(error = %e, "failed to set SO_MARK");
            }
        }

        if self.free_bind {
            if let Err(e) = set_raw(fd, libc::IPPROTO_IP, libc::IP_FREEBIND, 1) {
                warn!(error = %e, "failed to set IP_FREEBIND");
            }
        }

        if self.transparent {
            if let Err(e) = set_raw(fd, libc::IPPROTO_IP, libc::IP_TRANSPARENT, 1) {
                warn!(error = %e, "failed to set IP_TRANSPARENT");
            }
        }

        if let Some(bytes) = self.receive_buffer {
            self.apply_buffer(fd, libc::SO_RCVBUFFORCE, libc::SO_RCVBUF, bytes, "receive buffer");
        }
        if let Some(bytes) = self.send_buffer {
            self.apply_buffer(fd, libc::SO_SNDBUFFORCE, libc::SO_SNDBUF, bytes, "send buffer");
        }

        if let Some(ref device) = self.bind_to_device {
            if let Err(e) = bind_to_device(fd, device) {
                warn!(error = %e, device, "failed to set SO_BINDTODEVICE");
            }
        }

        self.apply_ip_tos_ttl(fd);
        self.apply_ipv6_only(fd);

        if let Some(ref cc) = self.tcp_congestion {
            if sock_type == SockType::Stream {
                if let Err(e) = set_string_opt(fd, libc::IPPROTO_TCP, libc::TCP_CONGESTION, cc) {
                    warn!(error = %e, congestion = cc, "failed to set TCP_CONGESTION");
                }
            }
        }

        if self.pass_credentials {
            if let Err(e) = set_raw(fd, libc::SOL_SOCKET, libc::SO_PASSCRED, 1) {
                warn!(error = %e, "failed to set SO_PASSCRED");
            }
        }

        if self.pass_security {
            if let Err(e) = set_raw(fd, libc::SOL_SOCKET, libc::SO_PASSSEC, 1) {
                warn!(error = %e, "failed to set SO_PASSSEC");
            }
        }

        self.apply_labels(fd);

        Ok(())
    }

    /// Applies the reduced tunable set for a FIFO (§4.2: "For FIFOs, the
    /// only tunable is pipe size").
    pub fn apply_fifo(&self, fd: RawFd) -> Result<(), SocketError> {
        if let Some(bytes) = self.pipe_size {
            let ret = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, bytes as libc::c_int) };
            if ret < 0 {
                warn!(error = %std::io::Error::last_os_error(), "failed to set pipe size");
            }
        }
        Ok(())
    }

    fn apply_buffer(&self, fd: RawFd, forced: libc::c_int, plain: libc::c_int, bytes: usize, what: &str) {
        let value = bytes as libc::c_int;
        if set_raw(fd, libc::SOL_SOCKET, forced, value).is_err() {
            if let Err(e) = set_raw(fd, libc::SOL_SOCKET, plain, value) {
                warn!(error = %e, "failed to set {} (both privileged and unprivileged setters)", what);
            }
        }
    }

    fn apply_ip_tos_ttl(&self, fd: RawFd) {
        if let Some(tos) = self.ip_tos {
            if let Err(e) = set_raw(fd, libc::IPPROTO_IP, libc::IP_TOS, tos) {
                warn!(error = %e, "failed to set IP_TOS");
            }
        }
        if let Some(ttl) = self.ip_ttl {
            let v4_ok = set_raw(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl).is_ok();
            let v6_ok = if ipv6_supported() {
                set_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, ttl).is_ok()
            } else {
                true
            };
            if !v4_ok && !v6_ok {
                warn!("failed to set TTL/hop-limit on either IPv4 or IPv6");
            }
        }
    }

    fn apply_ipv6_only(&self, fd: RawFd) {
        let value = match self.bind_ipv6_only {
            Ipv6Only::Default => return,
            Ipv6Only::Both => 0,
            Ipv6Only::Ipv6Only => 1,
        };
        if let Err(e) = set_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, value) {
            warn!(error = %e, "failed to set IPV6_V6ONLY");
        }
    }

    fn apply_labels(&self, fd: RawFd) {
        if let Some(ref label) = self.incoming_label {
            if let Err(e) = xattr::fset(unsafe_borrow_raw(fd), &label.name, &label.value) {
                warn!(error = %e, label = label.name, "failed to set incoming security label");
            }
        }
        if let Some(ref label) = self.outgoing_label {
            if let Err(e) = xattr::fset(unsafe_borrow_raw(fd), &label.name, &label.value) {
                warn!(error = %e, label = label.name, "failed to set outgoing security label");
            }
        }
    }
}

fn ipv6_supported() -> bool {
    std::fs::metadata("/proc/net/if_inet6").is_ok()
}

fn unsafe_borrow(fd: RawFd) -> std::os::fd::BorrowedFd<'static> {
    // SAFETY: callers only use the BorrowedFd for the duration of a single
    // setsockopt call on an fd they know is open; the 'static lifetime is an
    // artifact of not threading a real borrow through this helper.
    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }
}

fn unsafe_borrow_raw(fd: RawFd) -> std::os::fd::BorrowedFd<'static> {
    unsafe_borrow(fd)
}

fn bind_to_device(fd: RawFd, device: &str) -> std::io::Result<()> {
    let c_device = std::ffi::CString::new(device)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "device name contains NUL"))?;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            c_device.as_ptr() as *const libc::c_void,
            c_device.as_bytes().len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_string_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &str) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value.as_ptr() as *const libc::c_void,
            value.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;

    #[test]
    fn keepalive_and_priority_are_best_effort_and_never_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let opts = SocketOptions {
            keep_alive: true,
            priority: Some(1),
            receive_buffer: Some(4096),
            ..Default::default()
        };
        assert!(opts.apply(listener.as_raw_fd(), SockType::Stream).is_ok());
    }

    #[test]
    fn unset_options_are_all_no_ops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let opts = SocketOptions::default();
        assert!(opts.apply(listener.as_raw_fd(), SockType::Stream).is_ok());
    }
}
