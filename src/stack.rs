//! Userland L3+L4 stack terminating the TUN device (component E).
//!
//! Grounded on `original_source/stack.go`'s `manageTun`: that code attaches a
//! gVisor `stack.Stack` to the TUN fd, enables promiscuous mode + spoofing so
//! the NIC accepts and originates traffic for addresses it doesn't itself
//! own, installs a catch-all IPv4/IPv6 route, and terminates every inbound
//! flow locally through `tcp.Forwarder`/`udp.Forwarder` callbacks rather than
//! routing packets onward at L3.
//!
//! `smoltcp` has no direct equivalent of gVisor's forwarder hook (a callback
//! invoked for every *new* flow regardless of destination port). The
//! behavioural contract is reproduced instead with `Interface::set_any_ip`
//! (smoltcp's analogue of promiscuous + spoofing: accept packets addressed
//! to IPs the interface doesn't own) plus *dynamic per-destination-port
//! listening sockets*: the driving loop peeks the destination port of every
//! inbound TCP SYN / UDP datagram and lazily adds a listening socket for that
//! port the first time it's seen, so `Interface::poll` has something to
//! match the packet against before we hand it to smoltcp proper.

use crate::error::FlowError;
use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv6Address, Ipv6Packet, TcpPacket, UdpPacket,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Backlog depth for the accepted-flow channels. A full channel means the
/// forwarder (component F) isn't keeping up; new flows block briefly rather
/// than being silently dropped.
const ACCEPT_CHANNEL_DEPTH: usize = 256;
const STREAM_CHANNEL_DEPTH: usize = 64;
const TCP_BUFFER_SIZE: usize = 64 * 1024;
const UDP_BUFFER_SIZE: usize = 64 * 1024;
const UDP_METADATA_SLOTS: usize = 64;

/// A newly terminated TCP flow. `local` is the address the guest dialed
/// (the stack answers on its behalf, per gVisor's `LocalAddress`/
/// `LocalPort` naming); `remote` is the guest's own source endpoint.
pub struct TcpFlow {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub stream: TunTcpStream,
}

/// A newly observed UDP 4-tuple. Subsequent datagrams for the same
/// `(local, remote)` pair arrive on the same `TunUdpStream`.
pub struct UdpFlow {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub stream: TunUdpStream,
}

/// `phy::Device` implementation reading and writing whole IP packets on a
/// TUN file descriptor. One packet is staged at a time by the driving loop
/// before each `Interface::poll` call.
struct TunDevice {
    fd: RawFd,
    mtu: usize,
    rx_pending: Option<Vec<u8>>,
}

impl TunDevice {
    fn new(fd: RawFd, mtu: usize) -> Self {
        Self { fd, mtu, rx_pending: None }
    }

    fn write_packet(fd: RawFd, buf: &[u8]) {
        // SAFETY: `fd` is the TUN descriptor handed to us by the ambient
        // collaborator and kept open for the process lifetime.
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                warn!(%err, "write to TUN device failed");
            }
        }
    }
}

struct TunRxToken(Vec<u8>);
struct TunTxToken(RawFd);

impl phy::RxToken for TunRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

impl phy::TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        TunDevice::write_packet(self.0, &buf);
        result
    }
}

impl Device for TunDevice {
    type RxToken<'a> = TunRxToken;
    type TxToken<'a> = TunTxToken;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx_pending.take()?;
        Some((TunRxToken(packet), TunTxToken(self.fd)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TunTxToken(self.fd))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

fn now() -> SmolInstant {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    SmolInstant::from_micros(since_epoch.as_micros() as i64)
}

/// Peeked header: which transport the packet carries and, for a TCP SYN or
/// any UDP datagram, its destination port. Anything else (TCP non-SYN to an
/// unprovisioned port, unsupported protocols) is `None` and is left for
/// `Interface::poll` to discard or RST on its own.
enum Peek {
    TcpSyn(u16),
    Udp(u16),
    Other,
}

fn peek_packet(bytes: &[u8]) -> Peek {
    if bytes.is_empty() {
        return Peek::Other;
    }
    match bytes[0] >> 4 {
        4 => peek_ipv4(bytes),
        6 => peek_ipv6(bytes),
        _ => Peek::Other,
    }
}

fn peek_ipv4(bytes: &[u8]) -> Peek {
    let Ok(ip) = Ipv4Packet::new_checked(bytes) else {
        return Peek::Other;
    };
    peek_transport(ip.next_header(), ip.payload())
}

fn peek_ipv6(bytes: &[u8]) -> Peek {
    let Ok(ip) = Ipv6Packet::new_checked(bytes) else {
        return Peek::Other;
    };
    peek_transport(ip.next_header(), ip.payload())
}

fn peek_transport(protocol: IpProtocol, payload: &[u8]) -> Peek {
    match protocol {
        IpProtocol::Tcp => match TcpPacket::new_checked(payload) {
            Ok(tcp) if tcp.syn() && !tcp.ack() => Peek::TcpSyn(tcp.dst_port()),
            _ => Peek::Other,
        },
        IpProtocol::Udp => match UdpPacket::new_checked(payload) {
            Ok(udp) => Peek::Udp(udp.dst_port()),
            Err(_) => Peek::Other,
        },
        _ => Peek::Other,
    }
}

/// One live, not-yet-delivered-to-the-forwarder, or already-bridged TCP
/// listener/connection slot.
enum TcpSlot {
    /// Listening for the next SYN on this port; replaced by a fresh
    /// listener of the same shape once it transitions to `Established`.
    Listening,
    /// Handed off to a `TunTcpStream`; the bridge channels are drained each
    /// poll iteration until the peer closes.
    Bridged {
        to_app: mpsc::Sender<Bytes>,
        from_app: mpsc::Receiver<Bytes>,
        half_closed: bool,
        /// Set by `TunTcpStream::reject` when the forwarder couldn't
        /// resolve the destination or complete the SOCKS5 CONNECT: the
        /// guest's SYN was already ack'd by smoltcp before the forwarder
        /// ever saw the flow, so the only way to signal failure is an RST
        /// (`socket.abort()`) rather than a graceful FIN.
        reject: Arc<AtomicBool>,
    },
}

struct UdpBinding {
    to_app: mpsc::Sender<(SocketAddr, Bytes)>,
    from_app: mpsc::Receiver<(SocketAddr, Bytes)>,
    /// The address the guest originally dialed (possibly a fake-DNS IP).
    /// Replies must appear to come from this address — the listening
    /// socket itself is bound wildcard, so without this the reply would
    /// leave with the TUN's own address as source instead of the
    /// spoofed/fake one the guest expects (SOCKS5 UDP replies may come
    /// from any source, not just the address the ASSOCIATE bound).
    local_ip: IpAddr,
}

/// Owns the smoltcp `Interface`/`SocketSet` and the TUN fd for the lifetime
/// of the process. Runs as a single task; nothing else touches the socket
/// set, avoiding any need for internal locking.
pub struct TunStack {
    device: TunDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    tcp_slots: HashMap<SocketHandle, TcpSlot>,
    tcp_ports: HashMap<u16, SocketHandle>,
    udp_ports: HashMap<u16, SocketHandle>,
    /// Keyed by `(local_port, remote, local_ip)`: `local_ip` is the
    /// destination the guest actually dialed (possibly a fake-DNS IP), and
    /// must be part of the key — otherwise two destinations sharing a
    /// source port but differing only in destination IP (spec scenario:
    /// 8.8.8.8:53 and 1.1.1.1:53 from the same guest socket) would
    /// collapse onto the same binding.
    udp_bindings: HashMap<(u16, SocketAddr, IpAddr), UdpBinding>,
}

impl TunStack {
    /// `fd` must already be non-blocking (see `util::set_nonblocking`).
    /// `ipv4`/`ipv6` are the TUN interface's own addresses; they're
    /// attached to the interface for completeness but `set_any_ip` means
    /// inbound traffic is accepted regardless of destination address.
    pub fn new(
        fd: RawFd,
        mtu: u32,
        ipv4: (Ipv4Addr, u8),
        ipv6: Option<(Ipv6Addr, u8)>,
    ) -> Self {
        let mut device = TunDevice::new(fd, mtu as usize);
        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, now());
        iface.set_any_ip(true);

        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(Ipv4Address::from(ipv4.0)), ipv4.1));
            if let Some((addr6, prefix6)) = ipv6 {
                let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(Ipv6Address::from(addr6)), prefix6));
            }
        });

        Self {
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            tcp_slots: HashMap::new(),
            tcp_ports: HashMap::new(),
            udp_ports: HashMap::new(),
            udp_bindings: HashMap::new(),
        }
    }

    fn provision_tcp_listener(&mut self, port: u16) {
        if self.tcp_ports.contains_key(&port) {
            return;
        }
        let handle = self.spawn_tcp_listener(port);
        self.tcp_ports.insert(port, handle);
    }

    fn spawn_tcp_listener(&mut self, port: u16) -> SocketHandle {
        let rx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let mut socket = tcp::Socket::new(rx_buf, tx_buf);
        let _ = socket.listen(IpListenEndpoint { addr: None, port });
        let handle = self.sockets.add(socket);
        self.tcp_slots.insert(handle, TcpSlot::Listening);
        handle
    }

    fn provision_udp_socket(&mut self, port: u16) {
        if self.udp_ports.contains_key(&port) {
            return;
        }
        let rx_meta = udp::PacketMetadata::EMPTY;
        let tx_meta = udp::PacketMetadata::EMPTY;
        let rx_buf = udp::PacketBuffer::new(vec![rx_meta; UDP_METADATA_SLOTS], vec![0u8; UDP_BUFFER_SIZE]);
        let tx_buf = udp::PacketBuffer::new(vec![tx_meta; UDP_METADATA_SLOTS], vec![0u8; UDP_BUFFER_SIZE]);
        let mut socket = udp::Socket::new(rx_buf, tx_buf);
        let _ = socket.bind(IpListenEndpoint { addr: None, port });
        let handle = self.sockets.add(socket);
        self.udp_ports.insert(port, handle);
    }

    /// Drive the stack until the TUN fd errors out (process shutdown).
    /// New flows are pushed to `tcp_out`/`udp_out`; the forwarder
    /// (component F) consumes those channels and is responsible for
    /// dialing upstream and splicing.
    pub async fn run(
        mut self,
        tcp_out: mpsc::Sender<TcpFlow>,
        udp_out: mpsc::Sender<UdpFlow>,
    ) -> std::io::Result<()> {
        let async_fd = AsyncFd::new(self.device.fd)?;
        let mut read_buf = vec![0u8; self.device.mtu.max(2048)];

        loop {
            let mut guard = async_fd.readable().await?;
            let read_result = guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let ret = unsafe {
                    libc::read(fd, read_buf.as_mut_ptr() as *mut libc::c_void, read_buf.len())
                };
                if ret < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            });

            let n = match read_result {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            };
            if n == 0 {
                continue;
            }

            let packet = read_buf[..n].to_vec();
            match peek_packet(&packet) {
                Peek::TcpSyn(port) => self.provision_tcp_listener(port),
                Peek::Udp(port) => self.provision_udp_socket(port),
                Peek::Other => {}
            }
            self.device.rx_pending = Some(packet);

            let timestamp = now();
            self.iface.poll(timestamp, &mut self.device, &mut self.sockets);

            self.drain_tcp(&tcp_out).await;
            self.drain_udp(&udp_out).await;
        }
    }

    async fn drain_tcp(&mut self, tcp_out: &mpsc::Sender<TcpFlow>) {
        let handles: Vec<SocketHandle> = self.tcp_slots.keys().copied().collect();
        for handle in handles {
            let promote = {
                let socket = self.sockets.get_mut::<tcp::Socket>(handle);
                match self.tcp_slots.get(&handle) {
                    Some(TcpSlot::Listening) if socket.state() == tcp::State::Established => true,
                    _ => false,
                }
            };

            if promote {
                let local_port = {
                    let socket = self.sockets.get::<tcp::Socket>(handle);
                    socket.local_endpoint().map(|e| e.port)
                };
                if let Some(port) = local_port {
                    let replacement = self.spawn_tcp_listener(port);
                    self.tcp_ports.insert(port, replacement);
                }

                let (local, remote) = {
                    let socket = self.sockets.get::<tcp::Socket>(handle);
                    (socket.local_endpoint(), socket.remote_endpoint())
                };
                if let (Some(local), Some(remote)) = (local, remote) {
                    let (to_app, app_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
                    let (app_tx, from_app) = mpsc::channel(STREAM_CHANNEL_DEPTH);
                    let reject = Arc::new(AtomicBool::new(false));
                    self.tcp_slots.insert(
                        handle,
                        TcpSlot::Bridged { to_app, from_app, half_closed: false, reject: reject.clone() },
                    );
                    let stream = TunTcpStream { rx: app_rx, tx: app_tx, read_buf: Bytes::new(), reject };
                    let flow = TcpFlow {
                        local: endpoint_to_socket_addr(local),
                        remote: endpoint_to_socket_addr(remote),
                        stream,
                    };
                    if tcp_out.send(flow).await.is_err() {
                        debug!("tcp flow receiver dropped; closing newly accepted connection");
                        self.sockets.get_mut::<tcp::Socket>(handle).close();
                    }
                } else {
                    warn!("established tcp socket missing endpoints");
                }
                continue;
            }

            self.pump_bridged_tcp(handle);
        }
    }

    fn pump_bridged_tcp(&mut self, handle: SocketHandle) {
        let Some(TcpSlot::Bridged { to_app, from_app, half_closed, reject }) =
            self.tcp_slots.get_mut(&handle)
        else {
            return;
        };
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);

        while socket.can_recv() {
            let mut chunk = [0u8; 4096];
            match socket.recv_slice(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if to_app.try_send(Bytes::copy_from_slice(&chunk[..n])).is_err() {
                        warn!("tcp flow inbox full or closed, dropping bytes");
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        while socket.can_send() {
            match from_app.try_recv() {
                Ok(bytes) => {
                    if let Err(err) = socket.send_slice(&bytes) {
                        debug!(?err, "tcp send into smoltcp socket failed");
                        break;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !*half_closed {
                        if reject.load(Ordering::Acquire) {
                            socket.abort();
                        } else {
                            socket.close();
                        }
                        *half_closed = true;
                    }
                    break;
                }
            }
        }

        if !socket.is_open() && matches!(self.tcp_slots.get(&handle), Some(TcpSlot::Bridged { .. })) {
            self.tcp_slots.remove(&handle);
            self.sockets.remove(handle);
        }
    }

    async fn drain_udp(&mut self, udp_out: &mpsc::Sender<UdpFlow>) {
        let ports: Vec<u16> = self.udp_ports.keys().copied().collect();
        for port in ports {
            let handle = self.udp_ports[&port];
            loop {
                let received = {
                    let socket = self.sockets.get_mut::<udp::Socket>(handle);
                    if !socket.can_recv() {
                        break;
                    }
                    socket.recv()
                };
                let Ok((payload, meta)) = received else { break };
                let remote = endpoint_to_socket_addr(meta.endpoint);
                // `set_any_ip` means this socket is bound to a wildcard address, so
                // the destination the guest actually dialed (possibly a fake-DNS IP)
                // only survives via `UdpMetadata::local_address`, not the socket's
                // own listen endpoint.
                let local_ip = meta
                    .local_address
                    .map(|addr| match addr {
                        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
                        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6)),
                    })
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let local = SocketAddr::new(local_ip, port);
                let key = (port, remote, local_ip);
                let payload = Bytes::copy_from_slice(payload);

                if let Some(binding) = self.udp_bindings.get(&key) {
                    if binding.to_app.try_send((remote, payload)).is_err() {
                        warn!(%remote, "udp flow inbox full, dropping datagram");
                    }
                    continue;
                }

                let (to_app, app_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
                let (app_tx, from_app) = mpsc::channel(STREAM_CHANNEL_DEPTH);
                let _ = to_app.try_send((remote, payload));
                self.udp_bindings
                    .insert(key, UdpBinding { to_app, from_app, local_ip });

                let stream = TunUdpStream { local_port: port, remote, rx: app_rx, tx: app_tx };
                let flow = UdpFlow {
                    local,
                    remote,
                    stream,
                };
                if udp_out.send(flow).await.is_err() {
                    debug!("udp flow receiver dropped; discarding new binding");
                    self.udp_bindings.remove(&key);
                }
            }

            let mut dead = Vec::new();
            for (key, binding) in self.udp_bindings.iter_mut() {
                if key.0 != port {
                    continue;
                }
                while let Ok((dst, payload)) = binding.from_app.try_recv() {
                    let meta = udp::UdpMetadata {
                        local_address: Some(ip_addr_to_wire(binding.local_ip)),
                        ..socket_addr_to_endpoint(dst).into()
                    };
                    let socket = self.sockets.get_mut::<udp::Socket>(handle);
                    if let Err(err) = socket.send_slice(&payload, meta) {
                        debug!(?err, %dst, "udp send into smoltcp socket failed");
                    }
                }
                if binding.to_app.is_closed() {
                    dead.push(*key);
                }
            }
            for key in dead {
                self.udp_bindings.remove(&key);
            }
        }
    }
}

fn endpoint_to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6)),
    };
    SocketAddr::new(ip, endpoint.port)
}

fn socket_addr_to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(ip_addr_to_wire(addr.ip()), addr.port())
}

fn ip_addr_to_wire(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6)),
    }
}

/// A TCP flow bridged out of the stack task as ordinary `AsyncRead`/
/// `AsyncWrite`, so the forwarder can treat it exactly like a
/// `TcpStream`. Mirrors the channel-bridge idiom used to expose
/// smoltcp-internal sockets to async consumers without sharing the
/// `SocketSet` across tasks.
pub struct TunTcpStream {
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    read_buf: Bytes,
    reject: Arc<AtomicBool>,
}

impl TunTcpStream {
    /// Mark this flow for RST instead of graceful close. The guest's SYN
    /// was already ack'd by smoltcp by the time the forwarder saw this
    /// flow, so a destination-resolution or SOCKS5 CONNECT failure can
    /// only be surfaced as an abort once the stream is dropped.
    pub fn reject(&self) {
        self.reject.store(true, Ordering::Release);
    }
}

impl AsyncRead for TunTcpStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let take = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..take]);
            self.read_buf = self.read_buf.split_off(take);
            return std::task::Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            std::task::Poll::Ready(Some(chunk)) => {
                let take = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..take]);
                if take < chunk.len() {
                    self.read_buf = chunk.slice(take..);
                }
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(())),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl AsyncWrite for TunTcpStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.tx.try_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => std::task::Poll::Ready(Ok(buf.len())),
            Err(mpsc::error::TrySendError::Full(_)) => std::task::Poll::Pending,
            Err(mpsc::error::TrySendError::Closed(_)) => std::task::Poll::Ready(Err(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack closed the flow"),
            )),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        drop(self.tx.clone());
        std::task::Poll::Ready(Ok(()))
    }
}

/// A UDP 4-tuple bridged out of the stack task. `recv`/`send` operate on
/// whole datagrams, matching the SOCKS5 UDP relay's own framing.
pub struct TunUdpStream {
    local_port: u16,
    remote: SocketAddr,
    rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    tx: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl TunUdpStream {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await.map(|(_, payload)| payload)
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), FlowError> {
        self.tx
            .send((self.remote, Bytes::copy_from_slice(payload)))
            .await
            .map_err(|_| FlowError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack closed the flow")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_recognizes_ipv4_tcp_syn_destination_port() {
        // Minimal IPv4 + TCP SYN header: enough for `Ipv4Packet`/`TcpPacket`
        // to validate lengths and checkserve-free fields.
        let mut ip = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0, 10, 0, 0, 2, 10, 0, 0, 1];
        let mut tcp = vec![0u8; 20];
        tcp[2] = 0x01;
        tcp[3] = 0xbb; // dst port 443
        tcp[13] = 0x02; // SYN flag only
        ip.extend_from_slice(&tcp);
        match peek_packet(&ip) {
            Peek::TcpSyn(port) => assert_eq!(port, 443),
            _ => panic!("expected TcpSyn"),
        }
    }

    #[test]
    fn peek_ignores_non_syn_tcp() {
        let mut ip = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0, 10, 0, 0, 2, 10, 0, 0, 1];
        let mut tcp = vec![0u8; 20];
        tcp[13] = 0x10; // ACK only
        ip.extend_from_slice(&tcp);
        assert!(matches!(peek_packet(&ip), Peek::Other));
    }
}
