//! PROXY protocol v2 header codec.
//!
//! The relay prepends one of these headers to each forwarded connection
//! (or each forwarded datagram) so the remote side learns the original
//! client address.
//!
//! Wire format (HAProxy PROXY protocol, version 2):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length (big endian)
//! - variable: addresses and ports
//!
//! Only version 2 is produced. Decoding exists so receivers (and tests)
//! can verify what was sent.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use thiserror::Error;

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Protocol version carried in the high nibble of byte 13.
pub const VERSION: u8 = 2;

/// Signature + version/command + family/transport + length.
pub const FIXED_HEADER_LEN: usize = 16;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;

const TRANSPORT_STREAM: u8 = 0x01;
const TRANSPORT_DGRAM: u8 = 0x02;

/// Errors produced while building a header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The address cannot be expressed as AF_INET or AF_INET6.
    #[error("unsupported address family: {0}")]
    UnsupportedFamily(String),

    /// The family policy forbids the address.
    #[error("address {addr} cannot be encoded under family policy {policy}")]
    FamilyMismatch { addr: SocketAddr, policy: FamilyPolicy },
}

/// Errors produced while parsing a header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are required before the header can be parsed.
    #[error("incomplete header: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// The first 12 bytes are not the v2 signature.
    #[error("invalid PROXY v2 signature")]
    BadSignature,

    /// Version nibble is not 2.
    #[error("unsupported PROXY protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Only the PROXY command carries addresses.
    #[error("unsupported PROXY command: {0:#x}")]
    UnsupportedCommand(u8),

    /// Family/transport byte is not INET/INET6 over STREAM/DGRAM.
    #[error("unsupported family/transport byte: {0:#04x}")]
    UnsupportedFamily(u8),

    /// Declared address length is too short for the family.
    #[error("address block too short: {len} bytes for {family}")]
    ShortAddressBlock { len: usize, family: AddressFamily },
}

/// Header command (low nibble of byte 13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Local,
    Proxy,
}

impl Command {
    fn nibble(self) -> u8 {
        match self {
            Command::Local => 0x0,
            Command::Proxy => 0x1,
        }
    }
}

/// Transport protocol of the proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP.
    Stream,
    /// UDP.
    Datagram,
}

impl Transport {
    fn nibble(self) -> u8 {
        match self {
            Transport::Stream => TRANSPORT_STREAM,
            Transport::Datagram => TRANSPORT_DGRAM,
        }
    }
}

/// Address family written into the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    fn nibble(self) -> u8 {
        match self {
            AddressFamily::Inet => AF_INET,
            AddressFamily::Inet6 => AF_INET6,
        }
    }

    fn addr_len(self) -> u16 {
        match self {
            AddressFamily::Inet => IPV4_ADDR_LEN,
            AddressFamily::Inet6 => IPV6_ADDR_LEN,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "AF_INET"),
            AddressFamily::Inet6 => write!(f, "AF_INET6"),
        }
    }
}

/// How the header family is chosen from the two connection addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyPolicy {
    /// AF_INET when both addresses are IPv4 (or IPv4-mapped), AF_INET6 otherwise.
    #[default]
    Auto,
    /// Always AF_INET; IPv6 addresses that are not IPv4-mapped are rejected.
    Ipv4,
    /// Always AF_INET6; IPv4 addresses are written IPv4-mapped.
    Ipv6,
}

impl fmt::Display for FamilyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyPolicy::Auto => write!(f, "auto"),
            FamilyPolicy::Ipv4 => write!(f, "ipv4"),
            FamilyPolicy::Ipv6 => write!(f, "ipv6"),
        }
    }
}

impl FromStr for FamilyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(FamilyPolicy::Auto),
            "ipv4" | "inet" | "v4" => Ok(FamilyPolicy::Ipv4),
            "ipv6" | "inet6" | "v6" => Ok(FamilyPolicy::Ipv6),
            other => Err(format!("unknown family policy: {other}")),
        }
    }
}

/// A PROXY protocol v2 header.
///
/// Constructed once per forwarded connection and immutable afterwards.
/// Both addresses are already normalized to `family`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    command: Command,
    transport: Transport,
    addresses: Addresses,
}

/// Source and destination, already normalized to one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addresses {
    V4 { src: SocketAddrV4, dst: SocketAddrV4 },
    V6 { src: SocketAddrV6, dst: SocketAddrV6 },
}

impl ProxyHeader {
    /// Build a PROXY-command header for the given connection.
    ///
    /// * `src_addr` - original client address
    /// * `dst_addr` - address the client connected to
    pub fn new(
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
        transport: Transport,
        policy: FamilyPolicy,
    ) -> Result<Self, EncodeError> {
        let family = match policy {
            FamilyPolicy::Ipv4 => AddressFamily::Inet,
            FamilyPolicy::Ipv6 => AddressFamily::Inet6,
            FamilyPolicy::Auto => {
                if as_v4(src_addr.ip()).is_some() && as_v4(dst_addr.ip()).is_some() {
                    AddressFamily::Inet
                } else {
                    AddressFamily::Inet6
                }
            }
        };

        let addresses = match family {
            AddressFamily::Inet => Addresses::V4 {
                src: to_v4(src_addr, policy)?,
                dst: to_v4(dst_addr, policy)?,
            },
            AddressFamily::Inet6 => Addresses::V6 {
                src: to_v6(src_addr),
                dst: to_v6(dst_addr),
            },
        };

        Ok(Self {
            command: Command::Proxy,
            transport,
            addresses,
        })
    }

    /// Shorthand for a TCP header with automatic family selection.
    pub fn stream(src_addr: SocketAddr, dst_addr: SocketAddr) -> Result<Self, EncodeError> {
        Self::new(src_addr, dst_addr, Transport::Stream, FamilyPolicy::Auto)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn family(&self) -> AddressFamily {
        match self.addresses {
            Addresses::V4 { .. } => AddressFamily::Inet,
            Addresses::V6 { .. } => AddressFamily::Inet6,
        }
    }

    pub fn src_addr(&self) -> SocketAddr {
        match self.addresses {
            Addresses::V4 { src, .. } => SocketAddr::V4(src),
            Addresses::V6 { src, .. } => SocketAddr::V6(src),
        }
    }

    pub fn dst_addr(&self) -> SocketAddr {
        match self.addresses {
            Addresses::V4 { dst, .. } => SocketAddr::V4(dst),
            Addresses::V6 { dst, .. } => SocketAddr::V6(dst),
        }
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.family().addr_len() as usize
    }

    /// Generate the header bytes.
    ///
    /// The result must be written to the remote side before any payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the header bytes to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push((VERSION << 4) | self.command.nibble());
        let family = self.family();
        buf.push(family.nibble() | self.transport.nibble());
        buf.extend_from_slice(&family.addr_len().to_be_bytes());

        let (src_port, dst_port) = match self.addresses {
            Addresses::V4 { src, dst } => {
                buf.extend_from_slice(&src.ip().octets());
                buf.extend_from_slice(&dst.ip().octets());
                (src.port(), dst.port())
            }
            Addresses::V6 { src, dst } => {
                buf.extend_from_slice(&src.ip().octets());
                buf.extend_from_slice(&dst.ip().octets());
                (src.port(), dst.port())
            }
        };

        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
    }
}

/// Parse a PROXY v2 header from the start of `data`.
///
/// Returns the header and the number of bytes it occupies (including any
/// TLVs, which are skipped).
pub fn decode(data: &[u8]) -> Result<(ProxyHeader, usize), DecodeError> {
    if data.len() < FIXED_HEADER_LEN {
        // Reject garbage as early as the bytes allow.
        let n = data.len().min(PROXY_V2_SIGNATURE.len());
        if data[..n] != PROXY_V2_SIGNATURE[..n] {
            return Err(DecodeError::BadSignature);
        }
        return Err(DecodeError::Incomplete {
            needed: FIXED_HEADER_LEN,
            available: data.len(),
        });
    }

    if data[..12] != PROXY_V2_SIGNATURE {
        return Err(DecodeError::BadSignature);
    }

    let version = data[12] >> 4;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let command = data[12] & 0x0F;
    if command != Command::Proxy.nibble() {
        return Err(DecodeError::UnsupportedCommand(command));
    }

    let family_transport = data[13];
    let family = match family_transport & 0xF0 {
        AF_INET => AddressFamily::Inet,
        AF_INET6 => AddressFamily::Inet6,
        _ => return Err(DecodeError::UnsupportedFamily(family_transport)),
    };
    let transport = match family_transport & 0x0F {
        TRANSPORT_STREAM => Transport::Stream,
        TRANSPORT_DGRAM => Transport::Datagram,
        _ => return Err(DecodeError::UnsupportedFamily(family_transport)),
    };

    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let total = FIXED_HEADER_LEN + addr_len;
    if data.len() < total {
        return Err(DecodeError::Incomplete {
            needed: total,
            available: data.len(),
        });
    }
    if addr_len < family.addr_len() as usize {
        return Err(DecodeError::ShortAddressBlock {
            len: addr_len,
            family,
        });
    }

    let block = &data[FIXED_HEADER_LEN..total];
    let addresses = match family {
        AddressFamily::Inet => {
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            Addresses::V4 {
                src: SocketAddrV4::new(src_ip, src_port),
                dst: SocketAddrV4::new(dst_ip, dst_port),
            }
        }
        AddressFamily::Inet6 => {
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&block[0..16]);
            dst_octets.copy_from_slice(&block[16..32]);
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            Addresses::V6 {
                src: SocketAddrV6::new(Ipv6Addr::from(src_octets), src_port, 0, 0),
                dst: SocketAddrV6::new(Ipv6Addr::from(dst_octets), dst_port, 0, 0),
            }
        }
    };

    Ok((
        ProxyHeader {
            command: Command::Proxy,
            transport,
            addresses,
        },
        total,
    ))
}

/// IPv4 view of an address, if it is IPv4 or IPv4-mapped/compatible IPv6.
fn as_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => extract_v4_from_v6(v6),
    }
}

fn to_v4(addr: SocketAddr, policy: FamilyPolicy) -> Result<SocketAddrV4, EncodeError> {
    as_v4(addr.ip())
        .map(|v4| SocketAddrV4::new(v4, addr.port()))
        .ok_or(EncodeError::FamilyMismatch { addr, policy })
}

fn to_v6(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        // Flow info and scope id are not representable on the wire.
        SocketAddr::V6(v6) => SocketAddrV6::new(*v6.ip(), v6.port(), 0, 0),
    }
}

/// Extract IPv4 from an IPv6 address if it's a mapped or compatible address.
fn extract_v4_from_v6(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = addr.octets();

    // IPv4-mapped: ::ffff:a.b.c.d
    if octets[..10].iter().all(|&b| b == 0) && octets[10] == 0xff && octets[11] == 0xff {
        return Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ));
    }

    // IPv4-compatible: ::a.b.c.d (deprecated, but ::, ::1 are not v4)
    if octets[..12].iter().all(|&b| b == 0) && !addr.is_unspecified() && !addr.is_loopback() {
        return Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ipv4() {
        let header = ProxyHeader::stream(
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        )
        .unwrap();

        let encoded = header.encode();

        // 12 signature + 4 header + 12 addresses
        assert_eq!(encoded.len(), 28);
        assert_eq!(encoded.len(), header.encoded_len());
        assert_eq!(&encoded[..12], &PROXY_V2_SIGNATURE);
        assert_eq!(encoded[12], 0x21);
        assert_eq!(encoded[13], 0x11);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 12);
        assert_eq!(&encoded[16..20], &[192, 168, 1, 1]);
        assert_eq!(&encoded[20..24], &[10, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([encoded[24], encoded[25]]), 12345);
        assert_eq!(u16::from_be_bytes([encoded[26], encoded[27]]), 443);

        let (parsed, consumed) = decode(&encoded).unwrap();
        assert_eq!(consumed, 28);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_encode_ipv6() {
        let header = ProxyHeader::stream(
            "[2001:db8::1]:12345".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        )
        .unwrap();

        let encoded = header.encode();

        // 12 signature + 4 header + 36 addresses
        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], 0x21);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 36);

        let (parsed, consumed) = decode(&encoded).unwrap();
        assert_eq!(consumed, 52);
        assert_eq!(parsed.src_addr(), header.src_addr());
        assert_eq!(parsed.dst_addr(), header.dst_addr());
    }

    #[test]
    fn test_datagram_transport_nibble() {
        let header = ProxyHeader::new(
            "192.0.2.10:5353".parse().unwrap(),
            "192.0.2.1:53".parse().unwrap(),
            Transport::Datagram,
            FamilyPolicy::Auto,
        )
        .unwrap();

        let encoded = header.encode();
        assert_eq!(encoded[13], AF_INET | TRANSPORT_DGRAM);
        assert_eq!(decode(&encoded).unwrap().0.transport(), Transport::Datagram);
    }

    #[test]
    fn test_auto_policy_collapses_mapped_addresses() {
        // Dual-stack listener sees IPv4 clients as ::ffff:a.b.c.d
        let header = ProxyHeader::stream(
            "[::ffff:198.51.100.7]:40000".parse().unwrap(),
            "[::ffff:198.51.100.1]:9443".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(header.family(), AddressFamily::Inet);
        assert_eq!(header.src_addr(), "198.51.100.7:40000".parse().unwrap());
    }

    #[test]
    fn test_auto_policy_mixed_promotes_to_ipv6() {
        let header = ProxyHeader::stream(
            "198.51.100.7:40000".parse().unwrap(),
            "[2001:db8::1]:9443".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(header.family(), AddressFamily::Inet6);
        assert_eq!(
            header.src_addr(),
            "[::ffff:198.51.100.7]:40000".parse().unwrap()
        );
    }

    #[test]
    fn test_ipv4_policy_rejects_native_ipv6() {
        let err = ProxyHeader::new(
            "[2001:db8::1]:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
            Transport::Stream,
            FamilyPolicy::Ipv4,
        )
        .unwrap_err();

        assert!(matches!(err, EncodeError::FamilyMismatch { .. }));
    }

    #[test]
    fn test_ipv6_policy_maps_ipv4() {
        let header = ProxyHeader::new(
            "10.0.0.2:1000".parse().unwrap(),
            "10.0.0.1:2000".parse().unwrap(),
            Transport::Stream,
            FamilyPolicy::Ipv6,
        )
        .unwrap();

        assert_eq!(header.family(), AddressFamily::Inet6);
        assert_eq!(header.encode().len(), 52);
    }

    #[test]
    fn test_extract_v4_from_v6() {
        let mapped: Ipv6Addr = "::ffff:192.168.1.1".parse().unwrap();
        assert_eq!(
            extract_v4_from_v6(mapped),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );

        let regular: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(extract_v4_from_v6(regular), None);

        assert_eq!(extract_v4_from_v6(Ipv6Addr::LOCALHOST), None);
    }

    #[test]
    fn test_decode_skips_tlvs() {
        let header = ProxyHeader::stream(
            "192.168.1.1:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
        )
        .unwrap();
        let mut encoded = header.encode();
        // Bump the length to cover a 4-byte TLV and append it plus payload.
        encoded[14..16].copy_from_slice(&16u16.to_be_bytes());
        encoded.extend_from_slice(&[0x04, 0x00, 0x01, 0xAA]);
        encoded.extend_from_slice(b"payload");

        let (_, consumed) = decode(&encoded).unwrap();
        assert_eq!(consumed, 32);
        assert_eq!(&encoded[consumed..], b"payload");
    }

    #[test]
    fn test_decode_invalid() {
        assert_eq!(decode(&[0; 10]), Err(DecodeError::BadSignature));

        assert!(matches!(
            decode(&PROXY_V2_SIGNATURE[..8]),
            Err(DecodeError::Incomplete { needed: 16, .. })
        ));

        let mut wrong_version = ProxyHeader::stream(
            "192.168.1.1:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
        )
        .unwrap()
        .encode();
        wrong_version[12] = 0x11;
        assert_eq!(
            decode(&wrong_version),
            Err(DecodeError::UnsupportedVersion(1))
        );

        let mut local = wrong_version.clone();
        local[12] = 0x20;
        assert_eq!(decode(&local), Err(DecodeError::UnsupportedCommand(0)));

        let mut truncated = local.clone();
        truncated[12] = 0x21;
        truncated.truncate(20);
        assert!(matches!(
            decode(&truncated),
            Err(DecodeError::Incomplete { needed: 28, available: 20 })
        ));
    }

    #[test]
    fn test_family_policy_from_str() {
        assert_eq!("auto".parse::<FamilyPolicy>().unwrap(), FamilyPolicy::Auto);
        assert_eq!("IPv4".parse::<FamilyPolicy>().unwrap(), FamilyPolicy::Ipv4);
        assert_eq!("inet6".parse::<FamilyPolicy>().unwrap(), FamilyPolicy::Ipv6);
        assert!("unix".parse::<FamilyPolicy>().is_err());
    }
}
