//! Typed error taxonomy
//!
//! Startup-phase failures are reported with `anyhow` (see `main.rs`); every
//! component boundary below returns one of these enums so callers can match
//! on the failure instead of inspecting strings.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors from encoding/decoding SOCKS5 addresses and UDP relay envelopes.
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("buffer too short to contain a SOCKS5 address")]
    ShortBuffer,
    #[error("unknown address type byte {0:#04x}")]
    InvalidAddressType(u8),
    #[error("domain name longer than 255 bytes")]
    DomainTooLong,
    #[error("fragmented UDP relay datagrams are not supported")]
    UnsupportedFragment,
    #[error("payload plus address exceeds the maximum UDP packet size")]
    PacketTooLarge,
}

/// Errors from the SOCKS5 method negotiation / CONNECT / UDP ASSOCIATE handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("proxy did not accept any offered authentication method")]
    NoAcceptableMethods,
    #[error("username/password authentication failed")]
    AuthFailed,
    #[error("unsupported SOCKS version {0}")]
    UnsupportedVersion(u8),
    #[error("proxy rejected the request: general SOCKS server failure")]
    GeneralFailure,
    #[error("proxy rejected the request: connection not allowed by ruleset")]
    NotAllowed,
    #[error("proxy rejected the request: network unreachable")]
    NetworkUnreachable,
    #[error("proxy rejected the request: host unreachable")]
    HostUnreachable,
    #[error("proxy rejected the request: connection refused")]
    ConnectionRefused,
    #[error("proxy rejected the request: TTL expired")]
    TtlExpired,
    #[error("proxy rejected the request: command not supported")]
    CmdNotSupported,
    #[error("proxy rejected the request: address type not supported")]
    AtypNotSupported,
    #[error("proxy returned unknown reply code {0:#04x}")]
    UnknownReply(u8),
    #[error("address codec error: {0}")]
    Addr(#[from] AddrError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Map an RFC 1928 reply byte (`REP`) to its typed variant.
    pub fn from_reply_code(code: u8) -> Self {
        match code {
            0x01 => Self::GeneralFailure,
            0x02 => Self::NotAllowed,
            0x03 => Self::NetworkUnreachable,
            0x04 => Self::HostUnreachable,
            0x05 => Self::ConnectionRefused,
            0x06 => Self::TtlExpired,
            0x07 => Self::CmdNotSupported,
            0x08 => Self::AtypNotSupported,
            other => Self::UnknownReply(other),
        }
    }
}

/// Errors from the UDP relay client (component C).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake with proxy failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("short write to relay socket: wrote {wrote}, expected {expected}")]
    ShortWrite { wrote: usize, expected: usize },
    #[error("relay has been closed")]
    Closed,
    #[error("no virtual stream registered for destination {0}")]
    NoBinding(SocketAddr),
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the fake-DNS resolver (component D).
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("malformed DNS message: {0}")]
    Malformed(String),
    #[error("fake address pool exhausted and reset failed")]
    PoolExhausted,
    #[error("upstream DNS query failed: {0}")]
    Upstream(#[from] RelayError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from loading and validating the JSON configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced while the userland stack or forwarder are servicing a flow.
///
/// These are always logged and the affected flow is dropped; they never
/// abort the process.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("fake-dns has no name bound for {0}")]
    UnresolvedFakeAddress(std::net::Ipv4Addr),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
