//! Utility modules: raw-fd helpers and tracing setup.

mod socket;
mod tracing_setup;

pub use socket::{apply_tcp_keepalive, set_nonblocking};
pub use tracing_setup::{init_quiet, init_tracing};
