//! Supervisor (component G).
//!
//! Wires components A-F together once the ambient OS collaborator has
//! produced a TUN fd and (optionally) a pre-bound fake-DNS listening
//! socket. Owns nothing the other components don't already own; its only
//! job is construction order and the top-level shutdown race.
//!
//! Grounded on `original_source/main.go`'s `run`: logging/metrics init,
//! then `dns.NewServer` + `go dnsServer.ListenAndServe()`, then
//! `manageTun`, then a blocking wait on the child/parent process.

use crate::ambient::{AmbientHandoff, ExitWatch};
use crate::config::Config;
use crate::dns::{FakeDnsServer, FakeDnsTable};
use crate::forwarder::Forwarder;
use crate::handshake::Credentials;
use crate::relay::UdpRelayClient;
use crate::stack::TunStack;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};

const FLOW_CHANNEL_DEPTH: usize = 256;

/// Resolves `config.socks5_address` (a `host:port` string) to a concrete
/// [`SocketAddr`] once at startup, matching §9's "process-wide
/// configuration captured at startup, not re-read per packet."
async fn resolve_socks5_addr(config: &Config) -> Result<SocketAddr> {
    tokio::net::lookup_host(&config.socks5_address)
        .await
        .with_context(|| format!("resolving socks5_address {:?}", config.socks5_address))?
        .next()
        .with_context(|| format!("socks5_address {:?} resolved to no addresses", config.socks5_address))
}

fn credentials(config: &Config) -> Option<Credentials> {
    if config.username.is_empty() {
        None
    } else {
        Some(Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

/// Runs the forwarder until `exit_watch` fires or the TUN stack's read
/// loop errors out. Consumes `handoff`: every field becomes an owned
/// resource of a running task, never re-read afterward.
pub async fn run(handoff: AmbientHandoff, exit_watch: Arc<dyn ExitWatch>) -> Result<()> {
    let AmbientHandoff {
        tun_fd,
        tun_mtu,
        dns_socket_fd,
        config,
    } = handoff;

    crate::util::set_nonblocking(tun_fd).context("failed to set TUN fd non-blocking")?;

    let socks5_addr = resolve_socks5_addr(&config).await?;
    let creds = credentials(&config);

    let fake_dns = if config.fake_dns {
        let table = Arc::new(FakeDnsTable::new(config.fake_network, config.fake_prefix));

        let dns_socket_fd = dns_socket_fd
            .context("fake-DNS is enabled but the ambient collaborator provided no DNS socket")?;
        crate::util::set_nonblocking(dns_socket_fd)
            .context("failed to set fake-DNS socket non-blocking")?;
        let std_socket = unsafe {
            use std::os::fd::FromRawFd;
            std::net::UdpSocket::from_raw_fd(dns_socket_fd)
        };
        let dns_socket = UdpSocket::from_std(std_socket).context("wrapping fake-DNS listener socket")?;

        // A dedicated relay for upstream DNS forwarding (component D),
        // independent from the forwarder's per-guest-endpoint relays
        // (component F keys its relays by guest 5-tuple; DNS queries have
        // no such 5-tuple to key on).
        let dns_relay = UdpRelayClient::connect(socks5_addr, creds.as_ref())
            .await
            .context("connecting fake-DNS upstream relay")?;
        let upstream: SocketAddr = SocketAddr::new(config.dns_server.into(), 53);
        let server = Arc::new(FakeDnsServer::new(table.clone(), dns_relay, upstream));

        tokio::spawn(async move {
            if let Err(err) = server.serve(dns_socket).await {
                warn!(%err, "fake-dns server stopped");
            }
        });
        info!(fake_network = %config.fake_network, fake_prefix = config.fake_prefix, "fake-DNS enabled");
        Some(table)
    } else {
        None
    };

    let forwarder = Arc::new(Forwarder::new(
        socks5_addr,
        creds,
        fake_dns,
        config.udp_session_timeout,
    ));

    let stack = TunStack::new(
        tun_fd,
        tun_mtu,
        (config.tun_ip, config.tun_prefix),
        config.tun_ip6.map(|ip6| (ip6, config.tun_prefix6)),
    );

    let (tcp_tx, mut tcp_rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);
    let (udp_tx, mut udp_rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);

    let stack_task = tokio::spawn(stack.run(tcp_tx, udp_tx));

    let tcp_forwarder = forwarder.clone();
    tokio::spawn(async move {
        while let Some(flow) = tcp_rx.recv().await {
            tokio::spawn(tcp_forwarder.clone().handle_tcp(flow));
        }
    });
    let udp_forwarder = forwarder.clone();
    tokio::spawn(async move {
        while let Some(flow) = udp_rx.recv().await {
            tokio::spawn(udp_forwarder.clone().handle_udp(flow));
        }
    });

    info!(socks5_address = %socks5_addr, tun_name = %config.tun_name, "supervisor running");

    tokio::select! {
        result = stack_task => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err).context("TUN stack terminated"),
                Err(err) => Err(err).context("TUN stack task panicked"),
            }
        }
        _ = exit_watch.wait() => {
            info!("ambient collaborator process exited, shutting down");
            Ok(())
        }
    }
}
