//! Flow forwarder (component F).
//!
//! Resolves the destination each accepted flow named (literal IP, or a
//! fake-DNS name recovered by reverse lookup), opens the matching SOCKS5
//! primitive (`CONNECT` for TCP, a virtual stream off the shared UDP relay
//! for UDP), and splices bytes in both directions until either side closes.
//!
//! Grounded on `original_source/stack.go`'s `forwardConn`/`copyPacketData`:
//! the per-direction `io.Copy` pair with close-both-on-either-exit, and the
//! UDP side's `udpSessionTimeout`-bounded read deadline that is reset after
//! every successful read *and* write.

use crate::addr::Addr;
use crate::dns::FakeDnsTable;
use crate::error::FlowError;
use crate::flow::{FlowGuard, FlowKind};
use crate::handshake::{self, Credentials, CMD_CONNECT};
use crate::relay::UdpRelayClient;
use crate::stack::{TcpFlow, TunUdpStream, UdpFlow};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Everything the forwarder needs that outlives any single flow.
pub struct Forwarder {
    socks5_addr: SocketAddr,
    creds: Option<Credentials>,
    fake_dns: Option<Arc<FakeDnsTable>>,
    udp_session_timeout: Duration,
    /// One shared UDP relay per guest source endpoint, created lazily and
    /// reused by every subsequent destination that same guest endpoint
    /// talks to — mirrors `original_source/proxy/socks5.go`'s single
    /// `socks5UDPConn` backing many targets.
    udp_relays: DashMap<SocketAddr, Arc<OnceCell<Result<Arc<UdpRelayClient>, String>>>>,
}

impl Forwarder {
    pub fn new(
        socks5_addr: SocketAddr,
        creds: Option<Credentials>,
        fake_dns: Option<Arc<FakeDnsTable>>,
        udp_session_timeout: Duration,
    ) -> Self {
        Self {
            socks5_addr,
            creds,
            fake_dns,
            udp_session_timeout,
            udp_relays: DashMap::new(),
        }
    }

    /// Resolve `local` (the address the guest dialed) to the `Addr` we'll
    /// hand to the SOCKS5 proxy: a domain name if fake-DNS owns this IP and
    /// still has a binding for it, otherwise the literal address.
    fn resolve_destination(&self, local: SocketAddr) -> Result<Addr, FlowError> {
        if let (IpAddr::V4(v4), Some(table)) = (local.ip(), &self.fake_dns) {
            if table.contains(v4) {
                return match table.name_from_ip(v4) {
                    Some(name) => Ok(Addr::Domain(name, local.port())),
                    None => Err(FlowError::UnresolvedFakeAddress(v4)),
                };
            }
        }
        Ok(Addr::from(local))
    }

    pub async fn handle_tcp(self: Arc<Self>, flow: TcpFlow) {
        let _guard = FlowGuard::open(FlowKind::Tcp);
        let target = match self.resolve_destination(flow.local) {
            Ok(t) => t,
            Err(err) => {
                debug!(%err, remote = %flow.remote, "tcp flow dropped: could not resolve destination");
                crate::metrics::METRICS.error();
                flow.stream.reject();
                return;
            }
        };

        let mut upstream = match TcpStream::connect(self.socks5_addr).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, %target, "could not reach SOCKS5 proxy");
                crate::metrics::METRICS.error();
                flow.stream.reject();
                return;
            }
        };

        if let Err(err) =
            handshake::handshake(&mut upstream, CMD_CONNECT, &target, self.creds.as_ref()).await
        {
            debug!(%err, %target, "SOCKS5 CONNECT failed");
            crate::metrics::METRICS.error();
            flow.stream.reject();
            return;
        }

        let mut guest = flow.stream;
        match copy_bidirectional(&mut guest, &mut upstream).await {
            Ok((to_upstream, to_guest)) => {
                crate::metrics::METRICS.bytes_tx(to_upstream);
                crate::metrics::METRICS.bytes_rx(to_guest);
            }
            Err(err) => debug!(%err, %target, "tcp flow ended with an error"),
        }
    }

    async fn relay_for(self: &Arc<Self>, guest: SocketAddr) -> Result<Arc<UdpRelayClient>, FlowError> {
        let mut evict = false;
        if let Some(existing) = self.udp_relays.get(&guest) {
            match existing.get() {
                Some(Ok(relay)) if !relay.is_closed() => return Ok(relay.clone()),
                // Resolved, but to a closed relay or a failed connect: safe
                // to evict and retry.
                Some(_) => evict = true,
                // Still initializing: never evict here. Two callers racing
                // for the same guest endpoint must share the one in-flight
                // connect attempt instead of each opening their own UDP
                // ASSOCIATE.
                None => {}
            }
        }
        if evict && self.udp_relays.remove(&guest).is_some() {
            crate::metrics::METRICS.udp_relay_evicted();
        }

        let cell = self
            .udp_relays
            .entry(guest)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let proxy_addr = self.socks5_addr;
        let creds = self.creds.clone();
        let result = cell
            .get_or_init(|| async move {
                UdpRelayClient::connect(proxy_addr, creds.as_ref())
                    .await
                    .map_err(|err| err.to_string())
            })
            .await;

        match result {
            Ok(relay) => {
                crate::metrics::METRICS.udp_relay_opened();
                Ok(relay.clone())
            }
            Err(err) => Err(FlowError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.clone()))),
        }
    }

    pub async fn handle_udp(self: Arc<Self>, flow: UdpFlow) {
        let _guard = FlowGuard::open(FlowKind::Udp);
        let target = match self.resolve_destination(flow.local) {
            Ok(t) => t,
            Err(err) => {
                debug!(%err, remote = %flow.remote, "udp flow dropped: could not resolve destination");
                crate::metrics::METRICS.error();
                return;
            }
        };

        let relay = match self.relay_for(flow.remote).await {
            Ok(r) => r,
            Err(err) => {
                debug!(%err, %target, "udp flow dropped: could not reach SOCKS5 relay");
                crate::metrics::METRICS.error();
                return;
            }
        };

        let mut virt = match relay.dial(target.clone()) {
            Ok(v) => v,
            Err(err) => {
                debug!(%err, %target, "udp flow dropped: relay dial failed");
                crate::metrics::METRICS.error();
                return;
            }
        };

        if let Err(err) = splice_udp(flow.stream, &mut virt, self.udp_session_timeout).await {
            debug!(%err, %target, "udp flow ended with an error");
        }
    }
}

/// Bidirectional datagram copy between the guest-facing `TunUdpStream` and
/// the SOCKS5 virtual stream, idle-timed out in either direction — mirrors
/// `copyPacketData`'s deadline reset after every read and write, except
/// expressed as two independent `tokio::select!` loops instead of two
/// blocking-read goroutines.
async fn splice_udp(
    mut guest: TunUdpStream,
    upstream: &mut crate::relay::VirtualUdpStream,
    idle_timeout: Duration,
) -> Result<(), FlowError> {
    loop {
        tokio::select! {
            guest_pkt = tokio::time::timeout(idle_timeout, guest.recv()) => {
                match guest_pkt {
                    Ok(Some(payload)) => {
                        crate::metrics::METRICS.datagram_rx();
                        upstream.send(&payload).await?;
                    }
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        crate::metrics::METRICS.timeout();
                        return Ok(()); // idle timeout
                    }
                }
            }
            upstream_pkt = tokio::time::timeout(idle_timeout, upstream.recv()) => {
                match upstream_pkt {
                    Ok(Some(payload)) => {
                        crate::metrics::METRICS.datagram_tx();
                        guest.send(&payload).await?;
                    }
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        crate::metrics::METRICS.timeout();
                        return Ok(()); // idle timeout
                    }
                }
            }
        }
    }
}
