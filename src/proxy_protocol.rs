//! HAProxy PROXY protocol support.
//!
//! The listener can ingest v1 (text) and v2 (binary) headers to recover the
//! original client address behind a load balancer, and the gateway can emit
//! v2 headers toward backends that expect one.
//!
//! Wire format (v2): 12 byte signature, 1 byte version/command, 1 byte
//! address family and transport, 2 byte address block length, then the
//! addresses and ports.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// PROXY protocol v2 signature.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION_COMMAND_PROXY: u8 = 0x21;
const VERSION_COMMAND_LOCAL: u8 = 0x20;

const AF_INET_STREAM: u8 = 0x11;
const AF_INET6_STREAM: u8 = 0x21;

/// v1 lines are at most 107 bytes including the CRLF.
const V1_MAX_LINE: usize = 107;

const V1_PREFIX: &[u8; 6] = b"PROXY ";

#[derive(Debug, thiserror::Error)]
pub enum ProxyProtocolError {
    #[error("stream does not start with a PROXY protocol header")]
    InvalidSignature,
    #[error("unsupported PROXY protocol version/command {0:#04x}")]
    UnsupportedVersionCommand(u8),
    #[error("malformed PROXY protocol header: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Consumes one PROXY v1 or v2 header from the stream and returns the
/// source address it carries. `None` means the header was valid but
/// carried no address (v1 `UNKNOWN`, v2 `LOCAL` or unspecified family).
pub async fn read_header<R>(reader: &mut R) -> Result<Option<SocketAddr>, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut lead = [0u8; 6];
    reader.read_exact(&mut lead).await?;

    if lead == *V1_PREFIX {
        read_v1(reader).await
    } else if lead == V2_SIGNATURE[..6] {
        read_v2(reader).await
    } else {
        Err(ProxyProtocolError::InvalidSignature)
    }
}

async fn read_v1<R>(reader: &mut R) -> Result<Option<SocketAddr>, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > V1_MAX_LINE {
            return Err(ProxyProtocolError::Malformed("v1 line too long"));
        }
    }
    if line.pop() != Some(b'\r') {
        return Err(ProxyProtocolError::Malformed("v1 line not CRLF terminated"));
    }

    let line =
        std::str::from_utf8(&line).map_err(|_| ProxyProtocolError::Malformed("v1 not ascii"))?;
    let mut fields = line.split(' ');

    match fields.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(None),
        _ => return Err(ProxyProtocolError::Malformed("unknown v1 family")),
    }

    let src_ip: IpAddr = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ProxyProtocolError::Malformed("bad v1 source address"))?;
    let _dst_ip: IpAddr = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ProxyProtocolError::Malformed("bad v1 destination address"))?;
    let src_port: u16 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ProxyProtocolError::Malformed("bad v1 source port"))?;
    let _dst_port: u16 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ProxyProtocolError::Malformed("bad v1 destination port"))?;

    Ok(Some(SocketAddr::new(src_ip, src_port)))
}

async fn read_v2<R>(reader: &mut R) -> Result<Option<SocketAddr>, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut rest = [0u8; 6];
    reader.read_exact(&mut rest).await?;
    if rest != V2_SIGNATURE[6..] {
        return Err(ProxyProtocolError::InvalidSignature);
    }

    let version_command = reader.read_u8().await?;
    let family_transport = reader.read_u8().await?;
    let block_len = reader.read_u16().await? as usize;

    let mut block = vec![0u8; block_len];
    reader.read_exact(&mut block).await?;

    match version_command {
        VERSION_COMMAND_PROXY => {}
        VERSION_COMMAND_LOCAL => return Ok(None),
        other => return Err(ProxyProtocolError::UnsupportedVersionCommand(other)),
    }

    match family_transport {
        AF_INET_STREAM => {
            if block_len < 12 {
                return Err(ProxyProtocolError::Malformed("short v2 IPv4 block"));
            }
            let src_ip = IpAddr::from(<[u8; 4]>::try_from(&block[0..4]).unwrap());
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            Ok(Some(SocketAddr::new(src_ip, src_port)))
        }
        AF_INET6_STREAM => {
            if block_len < 36 {
                return Err(ProxyProtocolError::Malformed("short v2 IPv6 block"));
            }
            let src_ip = IpAddr::from(<[u8; 16]>::try_from(&block[0..16]).unwrap());
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            Ok(Some(SocketAddr::new(src_ip, src_port)))
        }
        // AF_UNSPEC or a transport we do not speak: addresses are opaque.
        _ => Ok(None),
    }
}

/// Encodes a PROXY v2 header describing a connection from `src` to `dst`.
/// Mixed address families are normalized to IPv6.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(16 + 36);
    header.extend_from_slice(&V2_SIGNATURE);
    header.push(VERSION_COMMAND_PROXY);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            header.push(AF_INET_STREAM);
            header.extend_from_slice(&12u16.to_be_bytes());
            header.extend_from_slice(&src_ip.octets());
            header.extend_from_slice(&dst_ip.octets());
        }
        (src_ip, dst_ip) => {
            header.push(AF_INET6_STREAM);
            header.extend_from_slice(&36u16.to_be_bytes());
            header.extend_from_slice(&to_v6(src_ip).octets());
            header.extend_from_slice(&to_v6(dst_ip).octets());
        }
    }
    header.extend_from_slice(&src.port().to_be_bytes());
    header.extend_from_slice(&dst.port().to_be_bytes());
    header
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
