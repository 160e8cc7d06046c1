//! Fake-DNS resolver (component D).
//!
//! Synthesizes A answers from a reserved IPv4 range so that hostnames
//! survive the guest's `connect()` call through to the SOCKS5 `CONNECT`/
//! `UDP ASSOCIATE` request (§4.F rewrites the destination by reverse
//! lookup through [`FakeDnsTable`]). Everything other than `A`/`AAAA` is
//! forwarded upstream over a virtual UDP stream dialed from the shared
//! relay (component C).
//!
//! Grounded on `original_source/fakedns/fakedns.go`: the `min`/`max`/`next`
//! allocator, the `sync.Map`-based forward/reverse bindings, and the
//! "only A/AAAA answered locally, everything else forwarded" dispatch.

use crate::addr::Addr;
use crate::relay::UdpRelayClient;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const ANSWER_TTL: u32 = 10;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// The name<->IP allocation table. Shared between the DNS server (which
/// mutates it) and the userland stack's address rewriter (which only
/// reads `name_from_ip`), mirroring the Go original passing one `*Server`
/// into both `manageTun` and the DNS listener goroutine.
pub struct FakeDnsTable {
    forward: DashMap<String, u32>,
    /// Each entry is tagged with the epoch `generation` it was allocated
    /// in, so a reset can prune entries more than one epoch stale instead
    /// of growing this map forever.
    reverse: DashMap<u32, (String, u64)>,
    /// Raw counter; `next_ip` returns `old + 1`, so the field holds the
    /// last value *used to compute* a candidate, not the last candidate
    /// itself — see `next_ip`.
    next: AtomicU32,
    min: u32,
    max: u32,
    resetting: AtomicBool,
    generation: AtomicU64,
}

impl FakeDnsTable {
    /// `network`/`prefix` describe the reserved fake CIDR (e.g.
    /// `240.0.0.0/4`). `prefix` must be `<= 31` (enforced by
    /// `Config::validate`, not re-checked here).
    pub fn new(network: Ipv4Addr, prefix: u8) -> Self {
        let min = u32::from(network);
        let size: u64 = 1u64 << (32 - prefix as u32);
        let max = min + (size - 1) as u32;
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            next: AtomicU32::new(min),
            min,
            max,
            resetting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Is `ip` inside the fake CIDR (network and broadcast included)?
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        v >= self.min && v <= self.max
    }

    /// Reverse lookup for the stack's address rewriter. An absent
    /// binding (never allocated, or allocated in a prior epoch and since
    /// pruned) returns `None`.
    pub fn name_from_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.reverse.get(&u32::from(ip)).map(|r| r.0.clone())
    }

    /// Current size of the reverse map, surfaced as a gauge so operators
    /// can see the bounded-leak's actual size instead of just trusting
    /// the bound exists.
    pub fn reverse_map_len(&self) -> usize {
        self.reverse.len()
    }

    /// Look up (or allocate) the fake IP bound to `name`. `name` should
    /// already have its trailing FQDN dot stripped.
    pub fn allocate(&self, name: &str) -> Ipv4Addr {
        if let Some(ip) = self.forward.get(name) {
            return Ipv4Addr::from(*ip);
        }
        let candidate = self.next_ip();
        let generation = self.generation.load(Ordering::Acquire);
        let ip = match self.forward.entry(name.to_string()) {
            // Lost a race with a concurrent allocation for the same name;
            // the counter value we drew is simply not reused. Acceptable:
            // the address space is vast relative to concurrent lookups.
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                e.insert(candidate);
                self.reverse.insert(candidate, (name.to_string(), generation));
                crate::metrics::METRICS.dns_allocation();
                crate::metrics::METRICS.set_fakedns_reverse_map_len(self.reverse.len() as u64);
                candidate
            }
        };
        Ipv4Addr::from(ip)
    }

    /// Draw the next candidate, resetting the forward map whenever the
    /// counter would reach the CIDR's broadcast address. The reverse map
    /// is pruned at the same time, but only down to entries from the
    /// current and immediately preceding epoch — bounding its growth
    /// without a global pause. The allocatable range is
    /// therefore `(min, max)` exclusive of both endpoints: `min` is the
    /// network address (never allocated, since `next` starts there) and
    /// `max` is the broadcast address (rejected here and treated as the
    /// overflow trigger) — e.g. a `/30` yields exactly 2 usable
    /// addresses, matching scenario 4.
    fn next_ip(&self) -> u32 {
        loop {
            let old = self.next.fetch_add(1, Ordering::AcqRel);
            let candidate = old + 1;
            if candidate < self.max {
                return candidate;
            }
            if self
                .resetting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.forward.clear();
                let new_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.reverse.retain(|_, (_, gen)| *gen + 1 >= new_generation);
                self.next.store(self.min, Ordering::Release);
                crate::metrics::METRICS.dns_epoch_reset();
                crate::metrics::METRICS.set_fakedns_reverse_map_len(self.reverse.len() as u64);
                self.resetting.store(false, Ordering::Release);
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Serves the fake-DNS UDP endpoint: synthesizes A answers locally,
/// empties AAAA answers, and forwards everything else upstream.
pub struct FakeDnsServer {
    table: Arc<FakeDnsTable>,
    relay: Arc<UdpRelayClient>,
    upstream: SocketAddr,
}

impl FakeDnsServer {
    pub fn new(table: Arc<FakeDnsTable>, relay: Arc<UdpRelayClient>, upstream: SocketAddr) -> Self {
        Self { table, relay, upstream }
    }

    /// Run the query-response loop on `socket` until it errors or is
    /// dropped. Each query is handled on its own task so a slow upstream
    /// forward cannot stall local A-record answers.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> std::io::Result<()> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; 512];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            let packet = buf[..n].to_vec();
            let this = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let reply = this.handle_query(&packet).await;
                if let Some(reply) = reply {
                    if let Err(err) = socket.send_to(&reply, from).await {
                        warn!(%err, %from, "failed to send fake-dns reply");
                    }
                }
            });
        }
    }

    async fn handle_query(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::from_bytes(packet) {
            Ok(m) => m,
            Err(err) => {
                debug!(%err, "dropping malformed DNS query");
                return None;
            }
        };

        let mut reply = Message::new();
        reply.set_id(query.id());
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(OpCode::Query);

        if query.queries().len() != 1 {
            return encode(&reply);
        }
        let question = query.queries()[0].clone();
        if question.query_class() != DNSClass::IN {
            return encode(&reply);
        }
        reply.add_query(question.clone());

        match question.query_type() {
            RecordType::A => {
                let name = strip_trailing_dot(&question.name().to_utf8());
                let ip = self.table.allocate(&name);
                let mut record = Record::new();
                record.set_name(question.name().clone());
                record.set_record_type(RecordType::A);
                record.set_dns_class(DNSClass::IN);
                record.set_ttl(ANSWER_TTL);
                record.set_data(Some(RData::A(A(ip))));
                reply.add_answer(record);
                encode(&reply)
            }
            RecordType::AAAA => encode(&reply),
            _ => self.forward_upstream(packet, &query).await.or_else(|| encode(&reply)),
        }
    }

    async fn forward_upstream(&self, raw_query: &[u8], query: &Message) -> Option<Vec<u8>> {
        crate::metrics::METRICS.dns_upstream_forward();
        let target = Addr::from(self.upstream);
        let mut stream = match self.relay.dial(target) {
            Ok(s) => s,
            Err(err) => {
                debug!(%err, "fake-dns upstream dial failed");
                return None;
            }
        };
        if let Err(err) = stream.send(raw_query).await {
            debug!(%err, "fake-dns upstream send failed");
            return None;
        }
        let reply_bytes = match tokio::time::timeout(UPSTREAM_TIMEOUT, stream.recv()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(_) => {
                debug!("fake-dns upstream query timed out or relay closed");
                return None;
            }
        };
        match Message::from_bytes(&reply_bytes) {
            Ok(reply) if reply.id() == query.id() => Some(reply_bytes.to_vec()),
            Ok(_) => {
                debug!("fake-dns upstream reply id mismatch");
                None
            }
            Err(err) => {
                debug!(%err, "fake-dns upstream reply malformed");
                None
            }
        }
    }
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(%err, "failed to encode DNS reply");
            None
        }
    }
}

fn strip_trailing_dot(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FakeDnsTable {
        FakeDnsTable::new(Ipv4Addr::new(240, 0, 0, 0), 30)
    }

    #[test]
    fn allocate_is_stable_and_contained() {
        let t = table();
        let ip1 = t.allocate("example.org");
        let ip2 = t.allocate("example.org");
        assert_eq!(ip1, ip2);
        assert!(t.contains(ip1));
        assert_eq!(t.name_from_ip(ip1).as_deref(), Some("example.org"));
    }

    #[test]
    fn slash_30_has_exactly_two_usable_addresses() {
        let t = table();
        let a = t.allocate("a");
        let b = t.allocate("b");
        assert_ne!(a, b);
        assert_eq!(a, Ipv4Addr::new(240, 0, 0, 1));
        assert_eq!(b, Ipv4Addr::new(240, 0, 0, 2));

        // Third allocation overflows (candidate would be .3, the
        // broadcast address) and triggers an epoch reset.
        let c = t.allocate("c");
        assert_eq!(c, Ipv4Addr::new(240, 0, 0, 1));
        // `a`'s binding is gone from the forward map post-reset: a fresh
        // lookup reallocates rather than returning the stale IP.
        assert_eq!(t.allocate("a"), Ipv4Addr::new(240, 0, 0, 2));
    }

    #[test]
    fn reverse_map_is_bounded_across_epoch_resets() {
        let t = table();
        for i in 0..20 {
            t.allocate(&format!("host-{i}"));
        }
        // A `/30` allocates 2 names per epoch, so 20 allocations span many
        // resets; the reverse map should never grow past roughly two
        // epochs' worth of entries instead of accumulating all 20.
        assert!(t.reverse_map_len() <= 4, "reverse map grew unbounded: {}", t.reverse_map_len());
    }

    #[test]
    fn never_allocates_network_or_broadcast() {
        let t = table();
        for i in 0..10 {
            let ip = t.allocate(&format!("host-{i}"));
            assert_ne!(ip, Ipv4Addr::new(240, 0, 0, 0));
            assert_ne!(ip, Ipv4Addr::new(240, 0, 0, 3));
        }
    }
}
