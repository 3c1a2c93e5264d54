//! PROXY protocol header decoding and encoding.
//!
//! Inbound, a load balancer in front of the gateway may prefix each
//! connection with a header naming the original client. Both wire forms are
//! accepted:
//! - v1: `PROXY <TCP4|TCP6|UNKNOWN> <src> <dst> <srcport> <dstport>\r\n`
//! - v2: 12-byte signature, version/command, family/transport, u16 length,
//!   address block, optional TLVs
//!
//! Outbound, the gateway emits the v1 text form ahead of the replayed
//! handshake when a destination asks for it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GatewayError, Result};

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// v1 header prefix.
const PROXY_V1_PREFIX: &[u8] = b"PROXY ";

/// Longest legal v1 line, CRLF included.
pub const MAX_V1_HEADER_LEN: usize = 107;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks from the balancer itself).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Address family: AF_UNSPEC.
const AF_UNSPEC: u8 = 0x00;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: usize = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: usize = 36;

/// Original connection endpoints carried by a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyIdentity {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination address as observed by the balancer.
    pub dst_addr: SocketAddr,
}

impl ProxyIdentity {
    /// Create a new identity for the given connection.
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Encode as a v1 text header.
    ///
    /// The family token follows the source address. IPv4-mapped IPv6
    /// addresses are folded to IPv4 first; a family mismatch that survives
    /// folding cannot be expressed in v1.
    pub fn encode_v1(&self) -> Result<Vec<u8>> {
        let src_ip = self.src_addr.ip().to_canonical();
        let dst_ip = self.dst_addr.ip().to_canonical();

        let family = match (src_ip, dst_ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) => "TCP4",
            (IpAddr::V6(_), IpAddr::V6(_)) => "TCP6",
            _ => {
                return Err(GatewayError::UnsupportedAddressFamily {
                    src: self.src_addr.to_string(),
                    dst: self.dst_addr.to_string(),
                })
            }
        };

        Ok(format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            src_ip,
            dst_ip,
            self.src_addr.port(),
            self.dst_addr.port()
        )
        .into_bytes())
    }
}

/// Read one PROXY header, v1 or v2.
///
/// Returns `None` when the header is well formed but carries no client
/// address (`UNKNOWN`, `LOCAL`, `AF_UNSPEC`); the caller keeps the socket
/// peer in that case.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<ProxyIdentity>> {
    let first = reader.read_u8().await.map_err(header_read_error)?;
    match first {
        b'P' => read_v1(reader).await,
        0x0D => read_v2(reader).await,
        other => Err(GatewayError::MalformedHeader(format!(
            "unexpected leading byte 0x{:02x}",
            other
        ))),
    }
}

fn header_read_error(err: std::io::Error) -> GatewayError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        GatewayError::MalformedHeader("connection closed inside header".to_string())
    } else {
        GatewayError::Io(err)
    }
}

/// Read the rest of a v1 line (the leading `P` is already consumed).
async fn read_v1<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<ProxyIdentity>> {
    let mut line = Vec::with_capacity(MAX_V1_HEADER_LEN);
    line.push(b'P');

    loop {
        if line.len() >= MAX_V1_HEADER_LEN {
            return Err(GatewayError::MalformedHeader(
                "v1 line not terminated within 107 bytes".to_string(),
            ));
        }
        let byte = reader.read_u8().await.map_err(header_read_error)?;
        line.push(byte);
        if byte == b'\n' {
            break;
        }
    }

    parse_v1(&line)
}

/// Parse a complete v1 line, CRLF included.
pub fn parse_v1(line: &[u8]) -> Result<Option<ProxyIdentity>> {
    let malformed = |reason: &str| GatewayError::MalformedHeader(reason.to_string());

    let Some(body) = line.strip_suffix(b"\r\n") else {
        return Err(malformed("v1 line must end with CRLF"));
    };
    let Some(body) = body.strip_prefix(PROXY_V1_PREFIX) else {
        return Err(malformed("missing PROXY prefix"));
    };
    let body = std::str::from_utf8(body).map_err(|_| malformed("v1 line is not ASCII"))?;

    let mut fields = body.split(' ');
    let family = fields.next().unwrap_or_default();
    match family {
        "UNKNOWN" => return Ok(None),
        "TCP4" | "TCP6" => {}
        other => {
            return Err(GatewayError::MalformedHeader(format!(
                "unsupported protocol token {:?}",
                other
            )))
        }
    }

    let fields: Vec<&str> = fields.collect();
    let [src_ip, dst_ip, src_port, dst_port] = fields.as_slice() else {
        return Err(malformed("v1 line must carry four address fields"));
    };

    let src_ip: IpAddr = src_ip.parse().map_err(|_| malformed("invalid source address"))?;
    let dst_ip: IpAddr = dst_ip
        .parse()
        .map_err(|_| malformed("invalid destination address"))?;
    let family_matches = match family {
        "TCP4" => src_ip.is_ipv4() && dst_ip.is_ipv4(),
        _ => src_ip.is_ipv6() && dst_ip.is_ipv6(),
    };
    if !family_matches {
        return Err(malformed("address does not match protocol token"));
    }

    let src_port: u16 = src_port.parse().map_err(|_| malformed("invalid source port"))?;
    let dst_port: u16 = dst_port
        .parse()
        .map_err(|_| malformed("invalid destination port"))?;

    Ok(Some(ProxyIdentity::new(
        SocketAddr::new(src_ip, src_port),
        SocketAddr::new(dst_ip, dst_port),
    )))
}

/// Read the rest of a v2 header (the leading 0x0D is already consumed).
async fn read_v2<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<ProxyIdentity>> {
    let mut fixed = [0u8; 16];
    fixed[0] = PROXY_V2_SIGNATURE[0];
    reader
        .read_exact(&mut fixed[1..])
        .await
        .map_err(header_read_error)?;

    if fixed[..12] != PROXY_V2_SIGNATURE {
        return Err(GatewayError::MalformedHeader(
            "invalid v2 signature".to_string(),
        ));
    }

    let addr_len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;
    let mut header = Vec::with_capacity(16 + addr_len);
    header.extend_from_slice(&fixed);
    header.resize(16 + addr_len, 0);
    reader
        .read_exact(&mut header[16..])
        .await
        .map_err(header_read_error)?;

    parse_v2(&header)
}

/// Parse a complete v2 header.
pub fn parse_v2(data: &[u8]) -> Result<Option<ProxyIdentity>> {
    let malformed = |reason: &str| GatewayError::MalformedHeader(reason.to_string());

    // Minimum header size: 16 bytes (signature + version/command + family + length)
    if data.len() < 16 || data[..12] != PROXY_V2_SIGNATURE {
        return Err(malformed("invalid v2 signature"));
    }

    let version_command = data[12];
    let family_protocol = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;

    if data.len() < 16 + addr_len {
        return Err(malformed("v2 address block truncated"));
    }
    let block = &data[16..16 + addr_len];

    match version_command {
        VERSION_COMMAND_LOCAL => return Ok(None),
        VERSION_COMMAND_PROXY => {}
        other if other >> 4 != 2 => {
            return Err(GatewayError::MalformedHeader(format!(
                "unsupported version {}",
                other >> 4
            )))
        }
        other => {
            return Err(GatewayError::MalformedHeader(format!(
                "unsupported command 0x{:x}",
                other & 0x0F
            )))
        }
    }

    match family_protocol {
        x if x >> 4 == AF_UNSPEC >> 4 => Ok(None),
        x if x == (AF_INET | TRANSPORT_STREAM) => {
            if block.len() < IPV4_ADDR_LEN {
                return Err(malformed("v2 IPv4 address block too short"));
            }
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            Ok(Some(ProxyIdentity::new(
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            )))
        }
        x if x == (AF_INET6 | TRANSPORT_STREAM) => {
            if block.len() < IPV6_ADDR_LEN {
                return Err(malformed("v2 IPv6 address block too short"));
            }
            let src_octets: [u8; 16] = block[0..16]
                .try_into()
                .map_err(|_| malformed("v2 IPv6 source"))?;
            let dst_octets: [u8; 16] = block[16..32]
                .try_into()
                .map_err(|_| malformed("v2 IPv6 destination"))?;
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            Ok(Some(ProxyIdentity::new(
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            )))
        }
        other => Err(GatewayError::MalformedHeader(format!(
            "unsupported family/transport 0x{:02x}",
            other
        ))),
    }
}
