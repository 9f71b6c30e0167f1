//! Login-state packets: the client's Login Start and the Disconnect the
//! proxy uses to turn players away.

use super::{DecodeError, Decoder, Encoder, Packet};

pub const LOGIN_START_ID: i32 = 0x00;
pub const DISCONNECT_ID: i32 = 0x00;

const MAX_USERNAME_CHARS: usize = 16;

/// The leading field of Login Start. Fields after the name vary by
/// protocol version and are not needed for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
}

impl LoginStart {
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        if packet.id != LOGIN_START_ID {
            return Err(DecodeError::UnexpectedPacketId {
                expected: LOGIN_START_ID,
                actual: packet.id,
            });
        }

        let mut decoder = Decoder::new(&packet.data);
        let name = decoder.read_string(MAX_USERNAME_CHARS)?.to_owned();
        Ok(Self { name })
    }
}

/// Builds a login Disconnect packet carrying `reason` as a chat object.
pub fn disconnect(reason: &str) -> Packet {
    let chat = serde_json::json!({ "text": reason }).to_string();
    let mut data = Vec::new();
    Encoder::new(&mut data).write_string(&chat);
    Packet::new(DISCONNECT_ID, data)
}
