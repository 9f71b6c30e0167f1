//! The Handshake packet, the first packet every Java Edition client sends.
//!
//! The proxy routes on the `server_address` field. Forwarding setups smuggle
//! the original client address through that field as a null-separated suffix
//! (`host\0ip:port\0uuid\0signature`), which is recovered here as well.

use super::{DecodeError, Decoder, Encoder, Packet};
use std::net::SocketAddr;

pub const HANDSHAKE_ID: i32 = 0x00;

const MAX_SERVER_ADDRESS_CHARS: usize = 255;

/// The state the client intends to continue in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextState {
    Status,
    Login,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// The client address recovered from a forwarding suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedAddress {
    pub remote_addr: SocketAddr,
    pub uuid: Option<String>,
    pub signature: Option<String>,
}

impl Handshake {
    /// Decodes a handshake, ignoring any trailing bytes for forward
    /// compatibility.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        Self::decode_inner(packet, false)
    }

    /// Decodes a handshake, rejecting trailing bytes.
    pub fn decode_strict(packet: &Packet) -> Result<Self, DecodeError> {
        Self::decode_inner(packet, true)
    }

    fn decode_inner(packet: &Packet, strict: bool) -> Result<Self, DecodeError> {
        if packet.id != HANDSHAKE_ID {
            return Err(DecodeError::UnexpectedPacketId {
                expected: HANDSHAKE_ID,
                actual: packet.id,
            });
        }

        let mut decoder = Decoder::new(&packet.data);
        let protocol_version = decoder.read_var_int()?;
        let server_address = decoder.read_string(MAX_SERVER_ADDRESS_CHARS)?.to_owned();
        let server_port = decoder.read_u16()?;
        let next_state = match decoder.read_var_int()? {
            1 => NextState::Status,
            2 => NextState::Login,
            other => return Err(DecodeError::InvalidNextState(other)),
        };

        if strict && !decoder.is_finished() {
            return Err(DecodeError::TrailingBytes(decoder.remaining()));
        }

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    pub fn encode(&self) -> Packet {
        let mut data = Vec::new();
        let mut encoder = Encoder::new(&mut data);
        encoder.write_var_int(self.protocol_version);
        encoder.write_string(&self.server_address);
        encoder.write_u16(self.server_port);
        encoder.write_var_int(match self.next_state {
            NextState::Status => 1,
            NextState::Login => 2,
        });
        Packet::new(HANDSHAKE_ID, data)
    }

    pub fn is_login(&self) -> bool {
        self.next_state == NextState::Login
    }

    /// The host the client asked for, normalized for routing: the address
    /// up to the first null separator, any trailing `:port` stripped, one
    /// trailing dot trimmed, ASCII-lowercased.
    pub fn routing_host(&self) -> String {
        let host = self
            .server_address
            .split('\0')
            .next()
            .unwrap_or_default();
        let host = match host.rfind(':') {
            Some(idx) => &host[..idx],
            None => host,
        };
        let host = host.strip_suffix('.').unwrap_or(host);
        host.to_ascii_lowercase()
    }

    /// Parses the forwarding suffix, when one is present.
    pub fn forwarded_address(&self) -> Result<ForwardedAddress, DecodeError> {
        let mut segments = self.server_address.split('\0');
        let _host = segments.next();
        let addr = segments.next().ok_or(DecodeError::NoForwardedAddress)?;
        let remote_addr: SocketAddr = addr
            .parse()
            .map_err(|_| DecodeError::InvalidForwardedAddress)?;

        Ok(ForwardedAddress {
            remote_addr,
            uuid: segments.next().filter(|s| !s.is_empty()).map(str::to_owned),
            signature: segments.next().filter(|s| !s.is_empty()).map(str::to_owned),
        })
    }

    /// Replaces any forwarding suffix with `host\0addr`, the form backends
    /// with Real-IP support expect.
    pub fn rewrite_forwarded_address(&mut self, addr: SocketAddr) {
        let host = self
            .server_address
            .split('\0')
            .next()
            .unwrap_or_default()
            .to_owned();
        self.server_address = format!("{host}\0{addr}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // proto=762, addr="localhost", port=25565, next=1
    const STATUS_HANDSHAKE: &[u8] = &[
        0xfa, 0x05, 0x09, b'l', b'o', b'c', b'a', b'l', b'h', b'o', b's', b't', 0x63, 0xdd, 0x01,
    ];

    fn handshake(address: &str) -> Handshake {
        Handshake {
            protocol_version: 762,
            server_address: address.to_owned(),
            server_port: 25565,
            next_state: NextState::Login,
        }
    }

    #[test]
    fn decodes_status_handshake() {
        let packet = Packet::new(HANDSHAKE_ID, STATUS_HANDSHAKE.to_vec());
        let hs = Handshake::decode(&packet).unwrap();
        assert_eq!(hs.protocol_version, 762);
        assert_eq!(hs.server_address, "localhost");
        assert_eq!(hs.server_port, 25565);
        assert_eq!(hs.next_state, NextState::Status);
    }

    #[test]
    fn round_trips_through_encode() {
        let packet = Packet::new(HANDSHAKE_ID, STATUS_HANDSHAKE.to_vec());
        let hs = Handshake::decode(&packet).unwrap();
        assert_eq!(hs.encode(), packet);
    }

    #[test]
    fn rejects_wrong_id() {
        let packet = Packet::new(0x01, STATUS_HANDSHAKE.to_vec());
        assert!(matches!(
            Handshake::decode(&packet),
            Err(DecodeError::UnexpectedPacketId { .. })
        ));
    }

    #[test]
    fn rejects_bad_next_state() {
        let mut data = STATUS_HANDSHAKE.to_vec();
        *data.last_mut().unwrap() = 0x03;
        let packet = Packet::new(HANDSHAKE_ID, data);
        assert!(matches!(
            Handshake::decode(&packet),
            Err(DecodeError::InvalidNextState(3))
        ));
    }

    #[test]
    fn lenient_about_trailing_bytes_unless_strict() {
        let mut data = STATUS_HANDSHAKE.to_vec();
        data.push(0x00);
        let packet = Packet::new(HANDSHAKE_ID, data);
        assert!(Handshake::decode(&packet).is_ok());
        assert!(matches!(
            Handshake::decode_strict(&packet),
            Err(DecodeError::TrailingBytes(1))
        ));
    }

    #[test]
    fn routing_host_normalizes() {
        assert_eq!(handshake("Play.Example.COM").routing_host(), "play.example.com");
        assert_eq!(handshake("example.com.").routing_host(), "example.com");
        assert_eq!(handshake("example.com:25565").routing_host(), "example.com");
        assert_eq!(handshake("").routing_host(), "");
    }

    #[test]
    fn routing_host_cuts_forwarding_suffix() {
        let hs = handshake("Host:25565\00.0.0.0:1\0uuid\0sig");
        assert_eq!(hs.routing_host(), "host");
    }

    #[test]
    fn forwarded_address_parses_full_suffix() {
        let hs = handshake("host\0203.0.113.9:54321\0069a79f4-44e9-4726-a5be-fca90e38aaf5\0cafe");
        let fwd = hs.forwarded_address().unwrap();
        assert_eq!(fwd.remote_addr, "203.0.113.9:54321".parse().unwrap());
        assert_eq!(
            fwd.uuid.as_deref(),
            Some("069a79f4-44e9-4726-a5be-fca90e38aaf5")
        );
        assert_eq!(fwd.signature.as_deref(), Some("cafe"));
    }

    #[test]
    fn forwarded_address_without_suffix_is_an_error() {
        assert!(matches!(
            handshake("host").forwarded_address(),
            Err(DecodeError::NoForwardedAddress)
        ));
        assert!(matches!(
            handshake("host\0not-an-address").forwarded_address(),
            Err(DecodeError::InvalidForwardedAddress)
        ));
    }

    #[test]
    fn rewrite_replaces_existing_suffix() {
        let mut hs = handshake("host\01.2.3.4:5\0uuid");
        hs.rewrite_forwarded_address("203.0.113.9:54321".parse().unwrap());
        assert_eq!(hs.server_address, "host\0203.0.113.9:54321");
    }
}
