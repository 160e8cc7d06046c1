//! Raw file-descriptor helpers shared by the ambient handoff (TUN fd,
//! pidfd) and the userland stack, plus socket tuning for the SOCKS5
//! control connection.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::os::fd::RawFd;
use std::time::Duration;
use tokio::net::TcpStream;

/// Put `fd` into non-blocking mode, required before wrapping it in
/// `tokio::io::unix::AsyncFd`.
pub fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

/// TCP keepalive applied to the SOCKS5 UDP ASSOCIATE's control connection:
/// since the relay's entire lifetime is tied to this one TCP connection
/// staying open (RFC 1928), a dead peer that never sends a FIN must still
/// be detected and torn down rather than leaking the relay forever.
pub fn apply_tcp_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    socket.set_tcp_keepalive(&keepalive)
}
