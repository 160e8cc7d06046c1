//! The ambient OS collaborator boundary.
//!
//! Namespace/mount setup, TUN creation, and privilege dropping are out of
//! scope; this module only defines the handoff this crate receives from
//! that (external) setup process and the trait it uses to notice that
//! process has exited.
//!
//! Grounded on `original_source/main.go`'s `runDaemon`: fds 3/4/5/6 are the
//! pipe, the TUN fd, the parent's pidfd, and the pre-bound DNS packet
//! socket, decoded once at startup; `runDaemon`'s trailing `unix.Poll` on
//! the pidfd is `ExitWatch` here.

use crate::config::Config;
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Read;
use std::os::fd::RawFd;
use tokio::io::unix::AsyncFd;

/// Everything the out-of-scope ambient collaborator hands the core exactly
/// once at startup.
#[derive(Debug)]
pub struct AmbientHandoff {
    pub tun_fd: RawFd,
    pub tun_mtu: u32,
    pub dns_socket_fd: Option<RawFd>,
    pub config: Config,
}

/// Fixed fd numbers the ambient collaborator hands off on, mirroring
/// `runDaemon`'s fd 3/4/5/6 layout. Fd 0-2 are stdin/stdout/stderr.
const FD_HANDOFF_PIPE: RawFd = 3;
const FD_TUN: RawFd = 4;
const FD_PIDFD: RawFd = 5;
const FD_DNS_SOCKET: RawFd = 6;

/// The small JSON envelope read off `FD_HANDOFF_PIPE`: everything the
/// ambient collaborator knows that isn't already a file descriptor or
/// config-file content (the TUN's negotiated MTU, and whether a DNS
/// socket was actually bound at `FD_DNS_SOCKET`).
#[derive(Debug, Deserialize)]
struct HandoffEnvelope {
    tun_mtu: u32,
    has_dns_socket: bool,
    has_pidfd: bool,
}

/// Reads the ambient collaborator's handoff: a JSON envelope on
/// `FD_HANDOFF_PIPE` plus the TUN fd (always) and DNS socket/pidfd fds
/// (conditionally) at their fixed numbers. `config` is the already
/// resolved CLI+file configuration; this function only recovers the
/// resources the namespace-setup wrapper owns. Returns the handoff plus
/// the pidfd, if any, so the caller can choose between
/// [`PidFdExitWatch`] and [`SignalExitWatch`].
///
/// Not used by the test/integration harness, which constructs
/// `AmbientHandoff` directly with loopback sockets instead of real fds.
pub fn receive_handoff(config: Config) -> std::io::Result<(AmbientHandoff, Option<RawFd>)> {
    use std::os::fd::FromRawFd;

    let mut pipe = unsafe { std::fs::File::from_raw_fd(FD_HANDOFF_PIPE) };
    let mut json = String::new();
    pipe.read_to_string(&mut json)?;
    let envelope: HandoffEnvelope = serde_json::from_str(&json)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    let dns_socket_fd = envelope.has_dns_socket.then_some(FD_DNS_SOCKET);
    let pidfd = envelope.has_pidfd.then_some(FD_PIDFD);

    Ok((
        AmbientHandoff {
            tun_fd: FD_TUN,
            tun_mtu: envelope.tun_mtu,
            dns_socket_fd,
            config,
        },
        pidfd,
    ))
}

/// Waits for the ambient collaborator's process to exit. The signal-based
/// implementation below is what the test/integration harness uses; a real
/// pidfd-backed implementation is the ambient collaborator's to supply.
#[async_trait]
pub trait ExitWatch: Send + Sync {
    async fn wait(&self);
}

/// Watches `SIGTERM`/`SIGINT`/ctrl-c, standing in for "the parent process
/// that owns the guest children has exited" when no real pidfd is wired up
/// (e.g. under test, or when this binary itself is the top-level process).
pub struct SignalExitWatch;

#[async_trait]
impl ExitWatch for SignalExitWatch {
    async fn wait(&self) {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        #[cfg(unix)]
        let terminate = async {
            if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                sig.recv().await;
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }
}

/// Watches a pidfd (Linux `pidfd_open`) becoming readable, which happens
/// exactly when the referenced process exits. This is the real-world
/// analogue of `runDaemon`'s `unix.Poll` loop on fd 5.
pub struct PidFdExitWatch {
    fd: AsyncFd<RawPidFd>,
}

struct RawPidFd(RawFd);

impl std::os::fd::AsRawFd for RawPidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl PidFdExitWatch {
    pub fn new(pidfd: RawFd) -> std::io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(RawPidFd(pidfd))?,
        })
    }
}

#[async_trait]
impl ExitWatch for PidFdExitWatch {
    async fn wait(&self) {
        // A pidfd becomes readable (POLLIN) once and stays that way once the
        // process has exited; one readiness wait is sufficient.
        let _ = self.fd.readable().await;
    }
}
