//! Types shared between the overworld server and its clients.
//!
//! Everything that crosses the wire lives here: connection identities,
//! per-player state, the tile map, the tagged JSON messages and the
//! length-prefixed codec that frames them.

pub mod codec;
pub mod protocol;

pub use codec::{encode_payload, frame_codec, CodecError, MessageCodec};
pub use protocol::{ClientMessage, ControlReply, ControlRequest, PlayerEntry, ServerMessage};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_SPAWN: Position = Position { x: 1, y: 1 };
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_TEXT_LEN: usize = 512;
pub const MAX_MAP_DIM: usize = 256;
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Schema violations in otherwise well-formed payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("tile map has no tiles")]
    EmptyMap,
    #[error("tile map row {row} has {found} tiles, expected {expected}")]
    RaggedMap {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("tile map is {width}x{height}, limit is 256x256")]
    MapTooLarge { width: usize, height: usize },
    #[error("player name is {0} characters, limit is 32")]
    NameTooLong(usize),
    #[error("message text is {0} characters, limit is 512")]
    TextTooLong(usize),
}

/// Identity of one client connection: the peer's socket address.
///
/// On the wire it is the address string, so it can key a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionId(SocketAddr);

impl ConnectionId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for ConnectionId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for ConnectionId {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = AddrParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.0.to_string()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A tile coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// Last known state of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub x: i32,
    pub y: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PlayerState {
    pub fn new(position: Position, name: Option<String>) -> Self {
        Self {
            x: position.x,
            y: position.y,
            name,
        }
    }

    pub fn position(&self) -> Position {
        Position {
            x: self.x,
            y: self.y,
        }
    }
}

impl Default for PlayerState {
    fn default() -> Self {
        Self::new(DEFAULT_SPAWN, None)
    }
}

/// Rectangular grid of tile kinds, indexed `[row][column]`.
///
/// Construction validates the shape, so every `TileMap` in the program
/// (including ones decoded off the wire) is non-empty, rectangular and
/// within [`MAX_MAP_DIM`] on both axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u8>>", into = "Vec<Vec<u8>>")]
pub struct TileMap {
    rows: Vec<Vec<u8>>,
}

impl TileMap {
    pub fn new(rows: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if width == 0 {
            return Err(ProtocolError::EmptyMap);
        }
        if width > MAX_MAP_DIM || rows.len() > MAX_MAP_DIM {
            return Err(ProtocolError::MapTooLarge {
                width,
                height: rows.len(),
            });
        }
        if let Some((row, found)) = rows
            .iter()
            .map(Vec::len)
            .enumerate()
            .find(|(_, len)| *len != width)
        {
            return Err(ProtocolError::RaggedMap {
                row,
                expected: width,
                found,
            });
        }
        Ok(Self { rows })
    }

    pub fn width(&self) -> usize {
        self.rows[0].len()
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn tile(&self, x: usize, y: usize) -> Option<u8> {
        self.rows.get(y).and_then(|row| row.get(x)).copied()
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }
}

impl Default for TileMap {
    fn default() -> Self {
        Self {
            rows: vec![
                vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 1],
                vec![0, 0, 0, 0, 2, 2, 2, 0, 0, 0],
                vec![0, 3, 3, 0, 0, 0, 0, 0, 0, 0],
                vec![0, 0, 0, 0, 0, 2, 2, 2, 0, 0],
                vec![0, 0, 0, 4, 0, 0, 0, 0, 0, 0],
            ],
        }
    }
}

impl TryFrom<Vec<Vec<u8>>> for TileMap {
    type Error = ProtocolError;

    fn try_from(rows: Vec<Vec<u8>>) -> Result<Self, Self::Error> {
        Self::new(rows)
    }
}

impl From<TileMap> for Vec<Vec<u8>> {
    fn from(map: TileMap) -> Self {
        map.rows
    }
}
