//! C3 — per-connection peer-instance name encoding, bit-exact with
//! `instance_from_socket()` in `src/core/socket.c`.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use nix::sys::socket::{getpeername, getsockname, SockaddrIn, SockaddrIn6};
use nix::unistd::{Gid, Pid, Uid};

use crate::address::{ipv4_mapped_octets, is_ipv4_mapped};
use crate::error::SocketError;

/// Peer credentials as returned by `SO_PEERCRED`, used for the AF_UNIX case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: Pid,
    pub uid: Uid,
    pub gid: Gid,
}

fn peer_cred(fd: RawFd) -> Result<PeerCred, SocketError> {
    let cred = nix::sys::socket::getsockopt(
        &unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
        nix::sys::socket::sockopt::PeerCredentials,
    )
    .map_err(SocketError::from)?;
    Ok(PeerCred {
        pid: Pid::from_raw(cred.pid()),
        uid: Uid::from_raw(cred.uid()),
        gid: Gid::from_raw(cred.gid()),
    })
}

/// Encodes the instance name for an accepted connection on `fd`, where `n`
/// is the 1-based count of connections accepted so far on this port (§4.3).
///
/// - AF_INET / AF_INET6 (including v4-mapped v6): `"{n}-{local}:{lport}-{remote}:{rport}"`.
/// - AF_UNIX: `"{n}-{peer_pid}-{peer_uid}"`.
///
/// Any other family is rejected — per-connection instancing is only defined
/// for the families §4.3 names.
pub fn encode_instance(fd: RawFd, n: u64) -> Result<String, SocketError> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let local = getsockname::<nix::sys::socket::SockaddrStorage>(fd).map_err(SocketError::from)?;

    if let Some(local_in) = local.as_sockaddr_in() {
        let peer = getpeername::<SockaddrIn>(fd).map_err(SocketError::from)?;
        return Ok(format!(
            "{n}-{}:{}-{}:{}",
            SocketAddr::from(*local_in).ip(),
            local_in.port(),
            SocketAddr::from(peer).ip(),
            peer.port(),
        ));
    }

    if let Some(local_in6) = local.as_sockaddr_in6() {
        let peer = getpeername::<SockaddrIn6>(fd).map_err(SocketError::from)?;
        let local_addr = local_in6.ip();
        let peer_addr = peer.ip();
        if is_ipv4_mapped(&local_addr) && is_ipv4_mapped(&peer_addr) {
            let [a, b, c, d] = ipv4_mapped_octets(&local_addr);
            let [e, f, g, h] = ipv4_mapped_octets(&peer_addr);
            return Ok(format!(
                "{n}-{a}.{b}.{c}.{d}:{}-{e}.{f}.{g}.{h}:{}",
                local_in6.port(),
                peer.port(),
            ));
        }
        return Ok(format!(
            "{n}-{}:{}-{}:{}",
            local_addr,
            local_in6.port(),
            peer_addr,
            peer.port(),
        ));
    }

    if local.as_unix_addr().is_some() {
        let cred = peer_cred(fd)?;
        return Ok(format!("{n}-{}-{}", cred.pid, cred.uid));
    }

    let _ = borrowed;
    Err(SocketError::Validation(vec![format![
        "no peer-instance encoding is defined for this socket's address family"
    ]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixListener;

    #[test]
    fn encodes_inet_stream_instance() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let instance = encode_instance(accepted.as_raw_fd(), 1).unwrap();
        assert!(instance.starts_with("1-127.0.0.1:"));
        drop(client);
    }

    #[test]
    fn encodes_unix_stream_instance_with_peer_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let instance = encode_instance(accepted.as_raw_fd(), 3).unwrap();
        let parts: Vec<&str> = instance.splitn(3, '-').collect();
        assert_eq!(parts[0], "3");
        assert_eq!(parts[1], nix::unistd::getpid().to_string());
        assert_eq!(parts[2], nix::unistd::getuid().to_string());
    }
}
