//! socks5-tun - Entry Point
//!
//! Loads configuration, initializes logging/metrics, receives the
//! ambient collaborator's TUN/DNS-socket handoff (§6), and runs the
//! supervisor (component G) until that process exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use socks5_tun::ambient::{self, ExitWatch, PidFdExitWatch, SignalExitWatch};
use socks5_tun::config::{Config, ConfigOverlay};
use socks5_tun::{supervisor, VERSION};

/// Transparent SOCKS5 forwarder over a TUN device.
#[derive(Parser, Debug)]
#[command(name = "socks5-tun", version = VERSION, about = "Transparent SOCKS5 forwarder over a TUN device")]
struct Cli {
    /// Suppress all logging output.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, default_value = "config.json")]
    config: PathBuf,

    #[arg(long)]
    tun_name: Option<String>,
    #[arg(long)]
    tun_ip: Option<String>,
    #[arg(long)]
    tun_ip6: Option<String>,
    #[arg(long)]
    socks5_address: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    fake_dns: Option<bool>,
    #[arg(long)]
    fake_network: Option<String>,
    #[arg(long)]
    dns_server: Option<String>,
    #[arg(long)]
    udp_session_timeout: Option<String>,

    /// The guest command to run inside the isolated namespace, and its
    /// arguments. Spawning it belongs to the ambient collaborator (out of
    /// scope here, see `src/ambient.rs`); accepted so the CLI grammar
    /// is complete end to end.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

impl Cli {
    fn into_overlay(self) -> (bool, PathBuf, ConfigOverlay) {
        let overlay = ConfigOverlay {
            tun_name: self.tun_name,
            tun_ip: self.tun_ip,
            tun_ip6: self.tun_ip6,
            socks5_address: self.socks5_address,
            username: self.username,
            password: self.password,
            fake_dns: self.fake_dns,
            fake_network: self.fake_network,
            dns_server: self.dns_server,
            udp_session_timeout: self.udp_session_timeout,
            log_level: None,
            log_format: None,
            metrics_enabled: None,
            metrics_bind_addr: None,
        };
        (self.quiet, self.config, overlay)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (quiet, config_path, overlay) = cli.into_overlay();

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path:?}"))?;
    config
        .apply(overlay)
        .context("invalid configuration override on the command line")?;

    if quiet {
        socks5_tun::util::init_quiet();
    } else {
        socks5_tun::util::init_tracing(&config.log_level, &config.log_format)?;
    }

    tracing::info!(version = VERSION, config_path = ?config_path, "starting socks5-tun");

    if config.metrics_enabled {
        socks5_tun::metrics::init_metrics(config.metrics_bind_addr)?;
        socks5_tun::metrics::start_api_server(config.metrics_bind_addr);
        tracing::info!(bind_addr = %config.metrics_bind_addr, "metrics endpoint started");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;

    let result = runtime.block_on(run(config));
    if let Err(err) = &result {
        tracing::error!(error = %err, "socks5-tun exiting with error");
    }
    result
}

async fn run(config: Config) -> Result<()> {
    let (handoff, pidfd) = ambient::receive_handoff(config)
        .context("failed to receive the ambient collaborator's handoff")?;

    let exit_watch: Arc<dyn ExitWatch> = match pidfd {
        Some(fd) => Arc::new(PidFdExitWatch::new(fd).context("opening pidfd exit watch")?),
        None => Arc::new(SignalExitWatch),
    };

    supervisor::run(handoff, exit_watch).await?;
    tracing::info!("socks5-tun stopped");
    Ok(())
}
