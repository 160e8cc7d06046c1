//! socks5-tun - transparent SOCKS5 forwarder over a TUN device
//!
//! Terminates a guest namespace's TCP/UDP traffic in a userland network
//! stack bound to a TUN fd and relays every flow through an upstream
//! SOCKS5 proxy, with a fake-DNS resolver so hostnames survive the trip
//! from the guest's `connect()` to the proxy's `CONNECT`/`UDP ASSOCIATE`.

pub mod addr;
pub mod ambient;
pub mod config;
pub mod dns;
pub mod error;
pub mod flow;
pub mod forwarder;
pub mod handshake;
pub mod metrics;
pub mod relay;
pub mod stack;
pub mod supervisor;
pub mod util;

pub use config::Config;

/// Crate version, surfaced by the CLI's `--version` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
