//! Status-state packets and the server-list JSON payload.

use super::{DecodeError, Decoder, Encoder, Packet};
use serde::{Deserialize, Serialize};

pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const PONG_ID: i32 = 0x01;

const MAX_RESPONSE_CHARS: usize = i16::MAX as usize;

/// The JSON document inside a Status Response packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseJson {
    pub version: VersionJson,
    pub players: PlayersJson,
    pub description: DescriptionJson,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub favicon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionJson {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayersJson {
    pub max: i32,
    pub online: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<PlayerSampleJson>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerSampleJson {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptionJson {
    pub text: String,
}

impl ResponseJson {
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        if packet.id != STATUS_RESPONSE_ID {
            return Err(DecodeError::UnexpectedPacketId {
                expected: STATUS_RESPONSE_ID,
                actual: packet.id,
            });
        }

        let mut decoder = Decoder::new(&packet.data);
        let json = decoder.read_string(MAX_RESPONSE_CHARS)?;
        serde_json::from_str(json).map_err(|err| DecodeError::Other(err.into()))
    }

    pub fn encode(&self) -> Packet {
        let json = serde_json::to_string(self).expect("status response serializes infallibly");
        let mut data = Vec::new();
        Encoder::new(&mut data).write_string(&json);
        Packet::new(STATUS_RESPONSE_ID, data)
    }
}

/// The Pong answering a Ping: same id, identical 8-byte payload.
pub fn pong(ping: &Packet) -> Packet {
    Packet::new(PONG_ID, ping.data.clone())
}
