//! Performance benchmarks for the address codec and fake-DNS allocator —
//! the two hottest pure-CPU paths (every packet touches the codec; every
//! new hostname touches the allocator).

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use socks5_tun::addr::{decode_udp_packet, encode_udp_packet, format_addr, parse_addr, Addr};
use socks5_tun::dns::FakeDnsTable;
use socks5_tun::metrics::METRICS;
use std::net::Ipv4Addr;

fn addr_codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("addr_codec");
    group.throughput(Throughput::Elements(1));

    let v4 = Addr::V4(Ipv4Addr::new(93, 184, 216, 34), 443);
    group.bench_function("format_parse_ipv4", |b| {
        b.iter(|| {
            let bytes = format_addr(black_box(&v4));
            let (parsed, _) = parse_addr(&bytes).unwrap();
            black_box(parsed);
        })
    });

    let domain = Addr::Domain("example.org".to_string(), 443);
    group.bench_function("format_parse_domain", |b| {
        b.iter(|| {
            let bytes = format_addr(black_box(&domain));
            let (parsed, _) = parse_addr(&bytes).unwrap();
            black_box(parsed);
        })
    });

    let payload = vec![0u8; 512];
    group.bench_function("encode_decode_udp_packet", |b| {
        b.iter(|| {
            let packet = encode_udp_packet(black_box(&v4), black_box(&payload)).unwrap();
            let (addr, decoded) = decode_udp_packet(packet).unwrap();
            black_box((addr, decoded));
        })
    });

    group.finish();
}

fn fake_dns_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fake_dns");
    group.throughput(Throughput::Elements(1));

    let table = FakeDnsTable::new(Ipv4Addr::new(240, 0, 0, 0), 4);
    group.bench_function("allocate_repeated_name", |b| {
        b.iter(|| {
            black_box(table.allocate("cached.example.org"));
        })
    });

    let mut counter = 0u64;
    group.bench_function("allocate_fresh_name", |b| {
        b.iter(|| {
            counter += 1;
            black_box(table.allocate(&format!("host-{counter}.example.org")));
        })
    });

    group.finish();
}

fn metrics_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("counter_increment", |b| {
        b.iter(|| {
            METRICS.bytes_rx(black_box(1024));
        })
    });

    group.bench_function("snapshot", |b| {
        b.iter(|| {
            let snapshot = METRICS.snapshot();
            black_box(snapshot);
        })
    });

    group.finish();
}

criterion_group!(benches, addr_codec_benchmark, fake_dns_benchmark, metrics_benchmark);
criterion_main!(benches);
