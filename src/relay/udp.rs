//! Shared-socket UDP relay: one SOCKS5 UDP ASSOCIATE backs many virtual
//! per-destination streams (component C).
//!
//! Grounded on `original_source/proxy/socks5.go`'s `dialUDP`/`socks5UDPConn`:
//! the all-zero client address for the ASSOCIATE request, the unspecified
//! bound-IP substitution, and the "TCP EOF tears down the whole relay" rule
//! (there realized with `io.Copy(io.Discard, conn)`; here with a background
//! discard-reader task racing a shutdown notification).

use crate::addr::{decode_udp_packet, encode_udp_packet, Addr, MAX_PACKET_SIZE};
use crate::error::RelayError;
use crate::handshake::{self, Credentials, CMD_UDP_ASSOCIATE};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

const BINDING_CHANNEL_DEPTH: usize = 64;

struct Inner {
    relay_addr: SocketAddr,
    udp: UdpSocket,
    refcount: AtomicUsize,
    bindings: DashMap<Addr, mpsc::Sender<Bytes>>,
    closed: AtomicBool,
    shutdown: Notify,
}

/// A SOCKS5 UDP ASSOCIATE session shared by every [`VirtualUdpStream`] dialed
/// from it. Closes itself (TCP and UDP sockets) when the last virtual stream
/// is dropped, or when the controlling TCP connection is closed by the peer.
pub struct UdpRelayClient {
    inner: Arc<Inner>,
}

impl UdpRelayClient {
    /// Negotiate a UDP ASSOCIATE with `proxy_addr` and start the background
    /// reader tasks. `proxy_addr` must already be resolved to a concrete
    /// socket address (name resolution is the caller's responsibility).
    pub async fn connect(
        proxy_addr: SocketAddr,
        creds: Option<&Credentials>,
    ) -> Result<Arc<Self>, RelayError> {
        let mut tcp = TcpStream::connect(proxy_addr).await?;
        if let Err(err) = crate::util::apply_tcp_keepalive(&tcp) {
            warn!(%err, "failed to set keepalive on SOCKS5 control connection");
        }
        let zero_target = handshake::zero_ipv4();
        let bound = handshake::handshake(&mut tcp, CMD_UDP_ASSOCIATE, &zero_target, creds).await?;

        let relay_addr = resolve_bound_addr(bound, proxy_addr.ip());

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        udp.connect(relay_addr).await?;

        let inner = Arc::new(Inner {
            relay_addr,
            udp,
            refcount: AtomicUsize::new(0),
            bindings: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        spawn_tcp_guard(tcp, inner.clone());
        spawn_udp_reader(inner.clone());

        Ok(Arc::new(Self { inner }))
    }

    /// Open a new virtual stream to `target`. Fails if the relay has already
    /// been torn down (peer closed the control TCP connection).
    pub fn dial(self: &Arc<Self>, target: Addr) -> Result<VirtualUdpStream, RelayError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        let (tx, rx) = mpsc::channel(BINDING_CHANNEL_DEPTH);
        self.inner.bindings.insert(target.clone(), tx);
        self.inner.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(VirtualUdpStream {
            relay: self.inner.clone(),
            target,
            rx,
            closed: false,
        })
    }

    /// Number of virtual streams currently referencing this relay.
    pub fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.inner.relay_addr
    }
}

fn resolve_bound_addr(bound: Addr, proxy_ip: IpAddr) -> SocketAddr {
    let sa: SocketAddr = match &bound {
        Addr::V4(ip, port) => SocketAddr::new(IpAddr::V4(*ip), *port),
        Addr::V6(ip, port) => SocketAddr::new(IpAddr::V6(*ip), *port),
        // A domain bound address would be unusual for UDP ASSOCIATE; fall
        // back to the proxy's own address rather than fail the whole relay.
        Addr::Domain(_, port) => SocketAddr::new(proxy_ip, *port),
    };
    if sa.ip().is_unspecified() {
        SocketAddr::new(proxy_ip, sa.port())
    } else {
        sa
    }
}

fn spawn_tcp_guard(mut tcp: TcpStream, inner: Arc<Inner>) {
    tokio::spawn(async move {
        let mut discard = [0u8; 256];
        loop {
            tokio::select! {
                res = tcp.read(&mut discard) => {
                    match res {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                _ = inner.shutdown.notified() => break,
            }
        }
        close_relay(&inner);
    });
}

fn spawn_udp_reader(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = tokio::select! {
                res = inner.udp.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(_) => break,
                },
                _ = inner.shutdown.notified() => break,
            };
            let packet = Bytes::copy_from_slice(&buf[..n]);
            match decode_udp_packet(packet) {
                Ok((src, payload)) => {
                    if let Some(tx) = inner.bindings.get(&src) {
                        if tx.try_send(payload).is_err() {
                            warn!(target = ?src, "virtual UDP stream inbox full, dropping packet");
                        }
                    } else {
                        debug!(target = ?src, "dropping UDP relay packet: no binding");
                    }
                }
                Err(err) => debug!(%err, "dropping malformed UDP relay packet"),
            }
        }
        close_relay(&inner);
    });
}

fn close_relay(inner: &Arc<Inner>) {
    if inner.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    inner.shutdown.notify_waiters();
    inner.bindings.clear();
}

/// A full-duplex, per-destination view over a shared [`UdpRelayClient`].
pub struct VirtualUdpStream {
    relay: Arc<Inner>,
    target: Addr,
    rx: mpsc::Receiver<Bytes>,
    closed: bool,
}

impl VirtualUdpStream {
    /// Receive the next datagram from `target`. Returns `None` once the
    /// relay has closed and no more datagrams will ever arrive.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send `payload` to `target` through the shared relay socket.
    pub async fn send(&self, payload: &[u8]) -> Result<(), RelayError> {
        if self.relay.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        let packet = encode_udp_packet(&self.target, payload)?;
        let wrote = self.relay.udp.send(&packet).await?;
        if wrote != packet.len() {
            return Err(RelayError::ShortWrite {
                wrote,
                expected: packet.len(),
            });
        }
        Ok(())
    }

    pub fn target(&self) -> &Addr {
        &self.target
    }

    /// Close this virtual stream, decrementing the relay's refcount.
    /// Idempotent; calling it more than once (or letting `Drop` run after an
    /// explicit call) never double-decrements.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.relay.bindings.remove(&self.target);
        let prev = self.relay.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow");
        if prev == 1 {
            close_relay(&self.relay);
        }
    }
}

impl Drop for VirtualUdpStream {
    fn drop(&mut self) {
        self.close();
    }
}
