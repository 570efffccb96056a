use serde::{Deserialize, Serialize};

use crate::game::entity::EntityKind;
use crate::game::id_alloc::EntityId;
use crate::net::bitstream::BitError;
use crate::util::vec2::Vec2;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Request to join the arena
    Join { name: String },
    /// Player input for the next tick
    Input(PlayerInput),
    /// Viewport zoom changed (window resize, zoom keys)
    Camera { zoom: f32 },
    /// Request to leave the arena
    Leave,
}

/// Player input state, applied at the next tick boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Input sequence number
    pub sequence: u32,
    /// Desired movement direction (normalized, zero = idle)
    pub movement: Vec2,
    /// Attack button held (petals extend)
    pub attacking: bool,
    /// Defend button held (petals retract)
    pub defending: bool,
}

impl PlayerInput {
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError::Message(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

/// Failure to decode one inbound message or update packet. Always fatal to
/// that single message only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated or malformed stream: {0}")]
    Bits(#[from] BitError),
    #[error("unknown entity kind tag {0}")]
    UnknownEntityKind(u8),
    #[error("partial update for unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("record kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch { expected: EntityKind, found: EntityKind },
    #[error("unknown section bits {0:#06x}")]
    UnknownSection(u16),
    #[error("Decode error: {0}")]
    Message(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_join() {
        let msg = ClientMessage::Join {
            name: "TestPlayer".to_string(),
        };

        let encoded = encode(&msg).unwrap();
        let decoded: ClientMessage = decode(&encoded).unwrap();

        match decoded {
            ClientMessage::Join { name } => assert_eq!(name, "TestPlayer"),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_client_message_input() {
        let input = PlayerInput {
            sequence: 42,
            movement: Vec2::new(0.6, -0.8),
            attacking: true,
            defending: false,
        };
        let msg = ClientMessage::Input(input.clone());

        let encoded = encode(&msg).unwrap();
        let decoded: ClientMessage = decode(&encoded).unwrap();
        assert_eq!(decoded, ClientMessage::Input(input));
    }

    #[test]
    fn test_legacy_config_is_fixed_width() {
        // variant index (u32) + f32
        let encoded = encode(&ClientMessage::Camera { zoom: 1.5 }).unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded[..4], &2u32.to_le_bytes());
    }

    #[test]
    fn test_player_input_default() {
        let input = PlayerInput::new(7);
        assert_eq!(input.sequence, 7);
        assert_eq!(input.movement, Vec2::ZERO);
        assert!(!input.attacking);
    }

    #[test]
    fn test_invalid_decode() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        let result: Result<ClientMessage, _> = decode(&garbage);
        assert!(matches!(result, Err(DecodeError::Message(_))));
    }
}
