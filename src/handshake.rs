//! SOCKS5 method negotiation, CONNECT and UDP ASSOCIATE handshakes
//! (RFC 1928, with RFC 1929 username/password sub-negotiation).
//!
//! Stateless: every function here takes an already-connected TCP stream and
//! leaves it to the caller to close it on failure.

use crate::addr::{format_addr, parse_addr, Addr};
use crate::error::HandshakeError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Optional username/password for RFC 1929 sub-negotiation.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Perform method negotiation, optional auth, and the given command request.
/// Returns the address the proxy bound for the operation (the relay address
/// for UDP ASSOCIATE, or an address of no particular interest for CONNECT).
pub async fn handshake(
    stream: &mut TcpStream,
    cmd: u8,
    target: &Addr,
    creds: Option<&Credentials>,
) -> Result<Addr, HandshakeError> {
    negotiate_method(stream, creds).await?;
    request(stream, cmd, target).await
}

async fn negotiate_method(
    stream: &mut TcpStream,
    creds: Option<&Credentials>,
) -> Result<(), HandshakeError> {
    let methods: &[u8] = if creds.is_some() {
        &[METHOD_NO_AUTH, METHOD_USERPASS]
    } else {
        &[METHOD_NO_AUTH]
    };

    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(HandshakeError::UnsupportedVersion(reply[0]));
    }
    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USERPASS => {
            let creds = creds.ok_or(HandshakeError::NoAcceptableMethods)?;
            subnegotiate_userpass(stream, creds).await
        }
        METHOD_NO_ACCEPTABLE => Err(HandshakeError::NoAcceptableMethods),
        other => Err(HandshakeError::UnknownReply(other)),
    }
}

async fn subnegotiate_userpass(
    stream: &mut TcpStream,
    creds: &Credentials,
) -> Result<(), HandshakeError> {
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    if user.is_empty() || user.len() > 255 || pass.is_empty() || pass.len() > 255 {
        return Err(HandshakeError::AuthFailed);
    }

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(AUTH_VERSION);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    stream.write_all(&req).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(HandshakeError::AuthFailed);
    }
    Ok(())
}

async fn request(stream: &mut TcpStream, cmd: u8, target: &Addr) -> Result<Addr, HandshakeError> {
    let addr_bytes = format_addr(target);
    let mut req = Vec::with_capacity(3 + addr_bytes.len());
    req.push(VERSION);
    req.push(cmd);
    req.push(0x00); // RSV
    req.extend_from_slice(&addr_bytes);
    stream.write_all(&req).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(HandshakeError::UnsupportedVersion(header[0]));
    }
    let rep = header[1];

    // The reply always carries a bound address, even on failure, so drain it
    // before inspecting `rep` to leave the stream in a well-defined state.
    let bound = read_bound_addr(stream, header[3]).await?;

    if rep != 0x00 {
        return Err(HandshakeError::from_reply_code(rep));
    }
    Ok(bound)
}

async fn read_bound_addr(stream: &mut TcpStream, atyp: u8) -> Result<Addr, HandshakeError> {
    let mut buf = Vec::new();
    buf.push(atyp);
    match atyp {
        crate::addr::ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
            buf.extend_from_slice(&rest);
        }
        crate::addr::ATYP_IPV6 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
            buf.extend_from_slice(&rest);
        }
        crate::addr::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            buf.push(len[0]);
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
            buf.extend_from_slice(&rest);
        }
        _ => return Err(HandshakeError::AtypNotSupported),
    }
    let (addr, _) = parse_addr(&buf)?;
    Ok(addr)
}

/// The zero IPv4 address SOCKS5 clients may send as `DST.ADDR`/`DST.PORT`
/// for `UDP ASSOCIATE` when they do not yet know their own source address
/// (RFC 1928 §6, also used for the CONNECT target builder in tests).
pub fn zero_ipv4() -> Addr {
    Addr::V4(std::net::Ipv4Addr::UNSPECIFIED, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            client
        );
        (server, client.unwrap())
    }

    #[tokio::test]
    async fn connect_success_roundtrip() {
        let (mut server, mut client) = loopback_pair().await;

        let target = Addr::Domain("example.org".to_string(), 443);
        let target_for_server = target.clone();

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 2];
            server.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            server.read_exact(&mut methods).await.unwrap();
            server.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();

            let mut header = [0u8; 3];
            server.read_exact(&mut header).await.unwrap();
            let mut atyp = [0u8; 1];
            server.read_exact(&mut atyp).await.unwrap();
            let mut rest = Vec::new();
            rest.push(atyp[0]);
            let _ = &target_for_server;
            // domain: length byte + name + port
            let mut len = [0u8; 1];
            server.read_exact(&mut len).await.unwrap();
            rest.push(len[0]);
            let mut tail = vec![0u8; len[0] as usize + 2];
            server.read_exact(&mut tail).await.unwrap();
            rest.extend_from_slice(&tail);

            let bound = Addr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1), 9999);
            let mut reply = vec![VERSION, 0x00, 0x00];
            reply.extend_from_slice(&format_addr(&bound));
            server.write_all(&reply).await.unwrap();
        });

        let bound = handshake(&mut client, CMD_CONNECT, &target, None)
            .await
            .unwrap();
        server_task.await.unwrap();
        assert_eq!(bound, Addr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1), 9999));
    }

    #[tokio::test]
    async fn no_acceptable_methods_is_typed_error() {
        let (mut server, mut client) = loopback_pair().await;
        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 2];
            server.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            server.read_exact(&mut methods).await.unwrap();
            server
                .write_all(&[VERSION, METHOD_NO_ACCEPTABLE])
                .await
                .unwrap();
        });
        let target = zero_ipv4();
        let err = handshake(&mut client, CMD_CONNECT, &target, None)
            .await
            .unwrap_err();
        server_task.await.unwrap();
        assert!(matches!(err, HandshakeError::NoAcceptableMethods));
    }
}
