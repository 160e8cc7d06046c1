//! Black-box UDP ASSOCIATE tests against a fake SOCKS5 proxy (no real TUN
//! device, no real upstream) covering many destinations sharing one
//! association, non-A DNS forwarding, and relay lifecycle tied to the
//! control TCP connection.

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use socks5_tun::addr::{decode_udp_packet, encode_udp_packet, Addr};
use socks5_tun::dns::{FakeDnsServer, FakeDnsTable};
use socks5_tun::relay::UdpRelayClient;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// A minimal fake SOCKS5 proxy: negotiates no-auth, accepts one UDP
/// ASSOCIATE, then echoes every relayed datagram back to its sender.
/// Returns the proxy's TCP address and a handle that, when dropped,
/// closes the control connection (tearing down the association per
/// RFC 1928).
async fn spawn_echo_proxy() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_socket.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        negotiate_and_associate(&mut tcp, relay_addr).await;

        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                res = relay_socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, from)) => { let _ = relay_socket.send_to(&buf[..n], from).await; }
                        Err(_) => break,
                    }
                }
                // Holding a read on the control connection means dropping
                // `tcp` (by returning) is what actually closes it; this
                // branch just keeps the task alive until the test is done.
                _ = tokio::time::sleep(Duration::from_secs(30)) => break,
            }
        }
    });

    (proxy_addr, handle)
}

async fn negotiate_and_associate(tcp: &mut TcpStream, relay_addr: SocketAddr) {
    let mut greeting = [0u8; 2];
    tcp.read_exact(&mut greeting).await.unwrap();
    let mut methods = vec![0u8; greeting[1] as usize];
    tcp.read_exact(&mut methods).await.unwrap();
    tcp.write_all(&[0x05, 0x00]).await.unwrap();

    let mut header = [0u8; 4];
    tcp.read_exact(&mut header).await.unwrap();
    let mut rest = [0u8; 6]; // all-zero IPv4 client address + port
    tcp.read_exact(&mut rest).await.unwrap();

    let mut reply = vec![0x05, 0x00, 0x00, 0x01];
    let SocketAddr::V4(v4) = relay_addr else { unreachable!() };
    reply.extend_from_slice(&v4.ip().octets());
    reply.extend_from_slice(&relay_addr.port().to_be_bytes());
    tcp.write_all(&reply).await.unwrap();
}

/// Scenario 3: three distinct destinations from one guest source
/// multiplex onto a single UDP ASSOCIATE; each reply routes back to the
/// virtual stream that dialed it.
#[tokio::test]
async fn many_destinations_share_one_association() {
    let (proxy_addr, _proxy) = spawn_echo_proxy().await;
    let relay = UdpRelayClient::connect(proxy_addr, None).await.unwrap();

    let mut a = relay.dial(Addr::V4(Ipv4Addr::new(8, 8, 8, 8), 53)).unwrap();
    let mut b = relay.dial(Addr::V4(Ipv4Addr::new(1, 1, 1, 1), 53)).unwrap();
    let mut c = relay.dial(Addr::V4(Ipv4Addr::new(9, 9, 9, 9), 53)).unwrap();
    assert_eq!(relay.refcount(), 3);

    a.send(b"to-8.8.8.8").await.unwrap();
    b.send(b"to-1.1.1.1").await.unwrap();
    c.send(b"to-9.9.9.9").await.unwrap();

    assert_eq!(&a.recv().await.unwrap()[..], b"to-8.8.8.8");
    assert_eq!(&b.recv().await.unwrap()[..], b"to-1.1.1.1");
    assert_eq!(&c.recv().await.unwrap()[..], b"to-9.9.9.9");

    drop(a);
    drop(b);
    drop(c);
    assert_eq!(relay.refcount(), 0);
}

/// Scenario 6: closing the control TCP connection tears down the
/// association — every outstanding virtual stream observes end of
/// stream shortly after.
#[tokio::test]
async fn closing_control_connection_closes_every_virtual_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_socket.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        negotiate_and_associate(&mut tcp, relay_addr).await;
        // Immediately drop the control connection: the relay must notice
        // EOF and tear itself down.
        drop(tcp);
        // Keep the UDP socket alive briefly so a racing send doesn't
        // error before the client observes the TCP EOF.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let relay = UdpRelayClient::connect(proxy_addr, None).await.unwrap();
    let mut stream = relay.dial(Addr::Domain("example.org".to_string(), 443)).unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        assert!(stream.recv().await.is_none());
    })
    .await
    .expect("virtual stream should observe relay teardown promptly");

    assert!(relay.is_closed());
}

/// Scenario 5: a non-A query (MX) is forwarded upstream through the
/// shared relay and the upstream's reply (with its transaction id) is
/// returned verbatim.
#[tokio::test]
async fn fake_dns_forwards_non_a_queries_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_socket.local_addr().unwrap();

    let upstream_dns: SocketAddr = "203.0.113.1:53".parse().unwrap();

    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        negotiate_and_associate(&mut tcp, relay_addr).await;

        let mut buf = vec![0u8; 65535];
        loop {
            let (n, from) = match relay_socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let (target, payload) = decode_udp_packet(bytes::Bytes::copy_from_slice(&buf[..n])).unwrap();
            assert_eq!(target, Addr::from(upstream_dns));

            let query = Message::from_bytes(&payload).unwrap();
            let mut reply = Message::new();
            reply.set_id(query.id());
            reply.set_message_type(MessageType::Response);
            reply.set_op_code(OpCode::Query);
            reply.add_query(query.queries()[0].clone());
            let encoded = reply.to_vec().unwrap();
            let packet = encode_udp_packet(&Addr::from(upstream_dns), &encoded).unwrap();
            let _ = relay_socket.send_to(&packet, from).await;
        }
    });

    let relay = UdpRelayClient::connect(proxy_addr, None).await.unwrap();
    let table = Arc::new(FakeDnsTable::new(Ipv4Addr::new(240, 0, 0, 0), 4));
    let server = Arc::new(FakeDnsServer::new(table, relay, upstream_dns));

    let mut query = Message::new();
    query.set_id(0xBEEF);
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    let mut q = Query::new();
    q.set_name(Name::from_ascii("example.org.").unwrap());
    q.set_query_type(RecordType::MX);
    query.add_query(q);
    let raw_query = query.to_vec().unwrap();

    let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let dns_server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dns_server_addr = dns_server_socket.local_addr().unwrap();

    tokio::spawn(server.serve(dns_server_socket));

    client_socket.send_to(&raw_query, dns_server_addr).await.unwrap();
    let mut buf = vec![0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client_socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let reply = Message::from_bytes(&buf[..n]).unwrap();
    assert_eq!(reply.id(), 0xBEEF);
    assert_eq!(reply.message_type(), MessageType::Response);
}
