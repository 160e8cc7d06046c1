//! SOCKS5 address codec (RFC 1928 §5) and UDP relay envelope framing.
//!
//! Every wire-facing function here is pure: no I/O, no allocation beyond the
//! returned buffer. Callers (the handshake and the relay) own the socket.

use crate::error::AddrError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A SOCKS5 address: either a literal IP or a domain name, plus a port.
///
/// Domain names are kept intact rather than collapsed into a display string,
/// since the fake-DNS flow needs to recover the original hostname bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Addr {
    pub fn port(&self) -> u16 {
        match self {
            Addr::V4(_, p) | Addr::V6(_, p) | Addr::Domain(_, p) => *p,
        }
    }

    /// Build the address variant appropriate for a literal IP or a hostname.
    pub fn new(host: &str, ip: Option<IpAddr>, port: u16) -> Result<Self, AddrError> {
        match ip {
            Some(IpAddr::V4(v4)) => Ok(Addr::V4(v4, port)),
            Some(IpAddr::V6(v6)) => Ok(Addr::V6(v6, port)),
            None => {
                if host.is_empty() || host.len() > 255 {
                    return Err(AddrError::DomainTooLong);
                }
                Ok(Addr::Domain(host.to_string(), port))
            }
        }
    }

    /// Render a `host:port` string suitable for logging or outbound resolution.
    pub fn to_host_port(&self) -> String {
        match self {
            Addr::V4(ip, port) => format!("{ip}:{port}"),
            Addr::V6(ip, port) => format!("[{ip}]:{port}"),
            Addr::Domain(name, port) => format!("{name}:{port}"),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Addr::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Addr::V6(*v6.ip(), v6.port()),
        }
    }
}

/// Encode `addr` into its RFC 1928 wire form: `ATYP | addr-bytes | port`.
pub fn format_addr(addr: &Addr) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 18 + 2);
    match addr {
        Addr::V4(ip, port) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        Addr::V6(ip, port) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        Addr::Domain(name, port) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
            buf.put_u16(*port);
        }
    }
    buf.freeze()
}

/// Parse one RFC 1928 address from the front of `data`, returning the parsed
/// address and the unconsumed remainder.
pub fn parse_addr(data: &[u8]) -> Result<(Addr, &[u8]), AddrError> {
    if data.is_empty() {
        return Err(AddrError::ShortBuffer);
    }
    let atyp = data[0];
    let rest = &data[1..];
    match atyp {
        ATYP_IPV4 => {
            if rest.len() < 6 {
                return Err(AddrError::ShortBuffer);
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            Ok((Addr::V4(ip, port), &rest[6..]))
        }
        ATYP_IPV6 => {
            if rest.len() < 18 {
                return Err(AddrError::ShortBuffer);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            Ok((Addr::V6(ip, port), &rest[18..]))
        }
        ATYP_DOMAIN => {
            if rest.is_empty() {
                return Err(AddrError::ShortBuffer);
            }
            let len = rest[0] as usize;
            let rest = &rest[1..];
            if rest.len() < len + 2 {
                return Err(AddrError::ShortBuffer);
            }
            let name = String::from_utf8_lossy(&rest[..len]).into_owned();
            let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
            Ok((Addr::Domain(name, port), &rest[len + 2..]))
        }
        other => Err(AddrError::InvalidAddressType(other)),
    }
}

/// Maximum SOCKS5 UDP relay payload; RFC 1928 datagrams cannot exceed this.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Encode a SOCKS5 UDP relay datagram: `RSV(2)=0 FRAG(1)=0 | addr | payload`.
pub fn encode_udp_packet(addr: &Addr, payload: &[u8]) -> Result<Bytes, AddrError> {
    let addr_bytes = format_addr(addr);
    if 3 + addr_bytes.len() + payload.len() > MAX_PACKET_SIZE {
        return Err(AddrError::PacketTooLarge);
    }
    let mut buf = BytesMut::with_capacity(3 + addr_bytes.len() + payload.len());
    buf.put_u16(0); // RSV
    buf.put_u8(0); // FRAG = 0, fragmentation unsupported
    buf.put_slice(&addr_bytes);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a SOCKS5 UDP relay datagram, returning the embedded address and
/// the payload (as an owned `Bytes` slice of the original buffer).
pub fn decode_udp_packet(mut data: Bytes) -> Result<(Addr, Bytes), AddrError> {
    if data.len() < 4 {
        return Err(AddrError::ShortBuffer);
    }
    data.advance(2); // RSV
    let frag = data.get_u8();
    if frag != 0 {
        return Err(AddrError::UnsupportedFragment);
    }
    let (addr, rest) = parse_addr(&data)?;
    let consumed = data.len() - rest.len();
    data.advance(consumed);
    Ok((addr, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let addr = Addr::V4(Ipv4Addr::new(1, 2, 3, 4), 443);
        let wire = format_addr(&addr);
        let (parsed, rest) = parse_addr(&wire).unwrap();
        assert_eq!(parsed, addr);
        assert!(rest.is_empty());
    }

    #[test]
    fn roundtrip_v6() {
        let addr = Addr::V6(Ipv6Addr::LOCALHOST, 8080);
        let wire = format_addr(&addr);
        let (parsed, rest) = parse_addr(&wire).unwrap();
        assert_eq!(parsed, addr);
        assert!(rest.is_empty());
    }

    #[test]
    fn roundtrip_domain() {
        let addr = Addr::Domain("example.org".to_string(), 53);
        let wire = format_addr(&addr);
        let (parsed, rest) = parse_addr(&wire).unwrap();
        assert_eq!(parsed, addr);
        assert!(rest.is_empty());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(parse_addr(&[ATYP_IPV4, 1, 2]), Err(AddrError::ShortBuffer)));
    }

    #[test]
    fn rejects_unknown_atyp() {
        assert!(matches!(
            parse_addr(&[0x7f, 0, 0, 0, 0]),
            Err(AddrError::InvalidAddressType(0x7f))
        ));
    }

    #[test]
    fn udp_packet_roundtrip() {
        let addr = Addr::Domain("dns.example".to_string(), 53);
        let payload = b"hello datagram";
        let encoded = encode_udp_packet(&addr, payload).unwrap();
        let (decoded_addr, decoded_payload) = decode_udp_packet(encoded).unwrap();
        assert_eq!(decoded_addr, addr);
        assert_eq!(&decoded_payload[..], payload);
    }

    #[test]
    fn udp_packet_rejects_fragmentation() {
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        buf.put_u8(1); // FRAG != 0
        buf.put_slice(&format_addr(&Addr::V4(Ipv4Addr::UNSPECIFIED, 0)));
        let err = decode_udp_packet(buf.freeze()).unwrap_err();
        assert!(matches!(err, AddrError::UnsupportedFragment));
    }

    #[test]
    fn udp_packet_rejects_oversize() {
        let addr = Addr::V4(Ipv4Addr::UNSPECIFIED, 0);
        let payload = vec![0u8; MAX_PACKET_SIZE];
        assert!(matches!(
            encode_udp_packet(&addr, &payload),
            Err(AddrError::PacketTooLarge)
        ));
    }
}
