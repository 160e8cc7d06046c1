//! SOCKS5 UDP relay client (component C).
//!
//! One TCP keepalive plus one UDP socket are shared by every virtual
//! per-destination stream dialed through [`UdpRelayClient::dial`]; the
//! association's lifetime is governed by the TCP connection per RFC 1928.

mod udp;

pub use udp::{UdpRelayClient, VirtualUdpStream};
