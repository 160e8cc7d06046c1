//! Tracing/logging initialization.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Initialize the global tracing subscriber from the resolved config's
/// `log_level`/`log_format`. `RUST_LOG` overrides `log_level` when set.
pub fn init_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);

    match log_format {
        "json" => {
            let fmt_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE);
            subscriber.with(fmt_layer).init();
        }
        _ => {
            let fmt_layer = fmt::layer().with_target(true).with_span_events(FmtSpan::CLOSE);
            subscriber.with(fmt_layer).init();
        }
    }

    Ok(())
}

/// Installs a subscriber that discards everything — the Rust equivalent
/// of the original's `-q` (`dup2` stderr to `/dev/null`): redirecting a
/// raw file descriptor is not something idiomatic Rust code does to its
/// own process, so quiet mode suppresses output at the tracing layer
/// instead.
pub fn init_quiet() {
    tracing_subscriber::registry()
        .with(EnvFilter::new("off"))
        .with(fmt::layer())
        .init();
}
