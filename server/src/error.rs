//! Error types, one per server operation.
//!
//! Sessions translate these into protocol messages for the client; none of
//! them is fatal to the server.

use crate::config::ConfigError;
use netplay_shared::ConnectionType;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("ping {ping} ms exceeds the server limit of {max} ms")]
    Ping { ping: u32, max: u32 },
    #[error("address {0} is not acceptable")]
    Address(IpAddr),
    #[error("connection type {0:?} is not allowed on this server")]
    ConnectionType(ConnectionType),
    #[error("invalid user name: {0}")]
    UserName(String),
    #[error("login failed: {0}")]
    Login(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("chat flood: wait before sending again")]
    Flood,
    #[error("you are muted")]
    Muted,
    #[error("message is {len} characters, the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("empty message")]
    Empty,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CreateGameError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("create game flood: wait before creating another game")]
    Flood,
    #[error("the server already hosts the maximum of {0} games")]
    MaxGames(usize),
    #[error("already in a game")]
    AlreadyInGame,
    #[error("invalid rom name")]
    InvalidRomName,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinGameError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no such game")]
    NoSuchGame,
    #[error("game is full")]
    GameFull,
    #[error("game is already in progress")]
    GameInProgress,
    #[error("already in a game")]
    AlreadyInGame,
    #[error("ping {ping} ms exceeds the game limit of {max} ms")]
    PingTooHigh { ping: u32, max: u32 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartGameError {
    #[error("not in a game")]
    NotInGame,
    #[error("only the owner can start the game")]
    NotOwner,
    #[error("game is not waiting")]
    NotWaiting,
    #[error("not enough players to start")]
    NotEnoughPlayers,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadyError {
    #[error("not in a game")]
    NotInGame,
    #[error("game is not synchronizing")]
    NotSynchronizing,
    #[error("player number {0} does not belong to you")]
    WrongPlayerNumber(u8),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GameChatError {
    #[error("not in a game")]
    NotInGame,
    #[error("you are muted")]
    Muted,
    #[error("message is {len} characters, the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("empty message")]
    Empty,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KickError {
    #[error("not in a game")]
    NotInGame,
    #[error("only the owner or an admin can kick")]
    NotOwner,
    #[error("no such player in this game")]
    NoSuchPlayer,
    #[error("you cannot kick yourself")]
    CannotKickSelf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameDataErrorKind {
    NotInGame,
    NotPlaying,
    SlotNotPlaying,
    InvalidLength,
    BufferOverrun,
}

/// Rejected game data. `response` is a zero-filled combined block with the
/// caller's own bytes at its offset, so the client's action array stays the
/// expected shape; empty when no shape is known yet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("game data rejected: {kind:?}")]
pub struct GameDataError {
    pub kind: GameDataErrorKind,
    pub response: Vec<u8>,
}

impl GameDataError {
    pub fn new(kind: GameDataErrorKind) -> Self {
        Self {
            kind,
            response: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DropGameError {
    #[error("not in a game")]
    NotInGame,
    #[error("game is not playing")]
    NotPlaying,
    #[error("already dropped")]
    AlreadyDropped,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuitGameError {
    #[error("not in a game")]
    NotInGame,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseGameError {
    #[error("not in a game")]
    NotInGame,
    #[error("no such game")]
    NoSuchGame,
    #[error("only the owner or an admin can close the game")]
    NotOwner,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NewConnectionError {
    #[error("server is full")]
    ServerFull,
    #[error("manager is shutting down")]
    Stopped,
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("could not bind a session port: {0}")]
    Bind(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
