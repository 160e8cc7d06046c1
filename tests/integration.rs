//! Cargo only auto-discovers test binaries directly under `tests/`, so
//! this file pulls the suites living in `tests/integration/` in as
//! modules of a single black-box test binary.

#[path = "integration/tcp_proxy_tests.rs"]
mod tcp_proxy_tests;

#[path = "integration/udp_relay_tests.rs"]
mod udp_relay_tests;
