//! Tagged JSON messages exchanged over the game and admin channels.
//!
//! Every message is an object whose `type` field selects the variant, e.g.
//! `{"type":"update","position":{"x":5,"y":7}}`. Decoding is strict: an
//! unknown `type`, a missing field or an out-of-range number is rejected by
//! serde, and [`ClientMessage::validate`] / [`ControlRequest::validate`]
//! enforce the length limits serde cannot express.

use crate::{
    ConnectionId, PlayerState, Position, ProtocolError, TileMap, MAX_NAME_LEN, MAX_TEXT_LEN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages a game client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Full replacement of the sender's player state.
    Update {
        position: Position,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Ask for the current tile map.
    RequestWorld,
    /// Graceful disconnect.
    Leave,
}

impl ClientMessage {
    pub fn update(x: i32, y: i32) -> Self {
        ClientMessage::Update {
            position: Position { x, y },
            name: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::Update {
                name: Some(name), ..
            } => check_len(name, MAX_NAME_LEN, ProtocolError::NameTooLong),
            _ => Ok(()),
        }
    }

    /// The player state an `update` carries, if this is one.
    pub fn into_state(self) -> Option<PlayerState> {
        match self {
            ClientMessage::Update { position, name } => Some(PlayerState::new(position, name)),
            _ => None,
        }
    }
}

/// Messages the server sends to game clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Welcome { id: ConnectionId, world: TileMap },
    /// Aggregate state of every connected player.
    Snapshot {
        players: BTreeMap<ConnectionId, PlayerState>,
    },
    World { grid: TileMap },
    Message { text: String },
}

/// Requests accepted on the admin channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    ListPlayers,
    Kick { id: ConnectionId },
    BroadcastMessage { text: String },
    ReplaceMap { grid: TileMap },
}

impl ControlRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ControlRequest::BroadcastMessage { text } => {
                check_len(text, MAX_TEXT_LEN, ProtocolError::TextTooLong)
            }
            _ => Ok(()),
        }
    }
}

/// Replies sent on the admin channel, one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Players { players: Vec<PlayerEntry> },
    Ok,
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub id: ConnectionId,
    pub state: PlayerState,
}

fn check_len(
    text: &str,
    limit: usize,
    err: fn(usize) -> ProtocolError,
) -> Result<(), ProtocolError> {
    let len = text.chars().count();
    if len > limit {
        Err(err(len))
    } else {
        Ok(())
    }
}
