//! Implements the routed subset of the Minecraft protocol.
//!
//! Only the packets the proxy has to inspect are decoded: the Handshake,
//! Login Start, the status exchange and the login Disconnect. Everything
//! after routing is an opaque byte stream.

pub mod decoder;
pub mod encoder;
pub mod handshake;
pub mod login;
pub mod packet;
pub mod status;

pub use decoder::{DecodeError, Decoder};
pub use encoder::Encoder;
pub use packet::{read_packet, read_varint, write_packet, Packet, ReadError};

/// Limit on a single frame to avoid out-of-memory DOS.
pub const MAX_PACKET_SIZE: usize = (1 << 21) - 1;
