//! Prometheus metrics exporter.
//!
//! HTTP endpoint for Prometheus scraping, syncing the forwarder's own
//! counters (flows, bytes, datagrams, fake-DNS allocations, relay
//! evictions) into the `metrics` facade on a background interval.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use super::counters::METRICS;

/// Install the Prometheus exporter and start the background sync task.
/// A no-op if metrics are disabled in config (callers check `config.metrics_enabled`).
pub fn init_metrics(bind_addr: SocketAddr) -> Result<()> {
    describe_counter!("socks5_tun_tcp_flows_opened", "TCP flows accepted from the TUN stack");
    describe_counter!("socks5_tun_tcp_flows_closed", "TCP flows that completed or errored");
    describe_counter!("socks5_tun_udp_flows_opened", "UDP guest sessions accepted");
    describe_counter!("socks5_tun_udp_flows_closed", "UDP guest sessions closed or timed out");
    describe_counter!("socks5_tun_bytes_received", "Bytes copied from upstream to guest");
    describe_counter!("socks5_tun_bytes_sent", "Bytes copied from guest to upstream");
    describe_counter!("socks5_tun_datagrams_received", "UDP datagrams relayed from upstream");
    describe_counter!("socks5_tun_datagrams_sent", "UDP datagrams relayed to upstream");
    describe_counter!("socks5_tun_dns_allocations", "Fake-DNS name-to-IP allocations");
    describe_counter!("socks5_tun_dns_epoch_resets", "Fake-DNS allocator epoch wraps");
    describe_counter!("socks5_tun_dns_upstream_forwards", "DNS queries forwarded upstream");
    describe_counter!("socks5_tun_udp_relays_opened", "SOCKS5 UDP ASSOCIATE relays opened");
    describe_counter!("socks5_tun_udp_relays_evicted", "SOCKS5 UDP ASSOCIATE relays torn down");
    describe_counter!("socks5_tun_errors_total", "Per-flow and per-query errors");
    describe_counter!("socks5_tun_timeouts_total", "UDP session idle timeouts");
    describe_gauge!(
        "socks5_tun_fakedns_reverse_map_len",
        "Current size of the fake-DNS reverse map, bounded to roughly two allocator epochs"
    );

    PrometheusBuilder::new().with_http_listener(bind_addr).install()?;

    tokio::spawn(sync_metrics_task());
    Ok(())
}

/// Periodically mirrors the atomic counters into the `metrics` facade so
/// the Prometheus exporter has something to scrape; avoids touching
/// `metrics::counter!` on every packet on the hot path.
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut last = METRICS.snapshot();

    loop {
        interval.tick().await;
        let now = METRICS.snapshot();

        macro_rules! sync_counter {
            ($name:literal, $field:ident) => {
                let delta = now.$field.saturating_sub(last.$field);
                if delta > 0 {
                    counter!($name).increment(delta);
                }
            };
        }

        sync_counter!("socks5_tun_tcp_flows_opened", tcp_flows_opened);
        sync_counter!("socks5_tun_tcp_flows_closed", tcp_flows_closed);
        sync_counter!("socks5_tun_udp_flows_opened", udp_flows_opened);
        sync_counter!("socks5_tun_udp_flows_closed", udp_flows_closed);
        sync_counter!("socks5_tun_bytes_received", bytes_received);
        sync_counter!("socks5_tun_bytes_sent", bytes_sent);
        sync_counter!("socks5_tun_datagrams_received", datagrams_received);
        sync_counter!("socks5_tun_datagrams_sent", datagrams_sent);
        sync_counter!("socks5_tun_dns_allocations", dns_allocations);
        sync_counter!("socks5_tun_dns_epoch_resets", dns_epoch_resets);
        sync_counter!("socks5_tun_dns_upstream_forwards", dns_upstream_forwards);
        sync_counter!("socks5_tun_udp_relays_opened", udp_relays_opened);
        sync_counter!("socks5_tun_udp_relays_evicted", udp_relays_evicted);
        sync_counter!("socks5_tun_errors_total", errors_total);
        sync_counter!("socks5_tun_timeouts_total", timeouts_total);

        gauge!("socks5_tun_tcp_flows_active")
            .set((now.tcp_flows_opened.saturating_sub(now.tcp_flows_closed)) as f64);
        gauge!("socks5_tun_udp_flows_active")
            .set((now.udp_flows_opened.saturating_sub(now.udp_flows_closed)) as f64);
        gauge!("socks5_tun_fakedns_reverse_map_len").set(now.fakedns_reverse_map_len as f64);

        last = now;
    }
}
