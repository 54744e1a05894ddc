//! Logical messages of the v086 session protocol.
//!
//! These travel inside [`crate::bundle::Bundle`]s once a client has been
//! handed off to its session port.

use serde::{Deserialize, Serialize};

pub type UserId = u16;
pub type GameId = u32;

/// Link quality a client declares at login. The numeric value is also the
/// number of actions the client packs into one game data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionType {
    Disabled = 0,
    Lan = 1,
    Excellent = 2,
    Good = 3,
    Average = 4,
    Low = 5,
    Bad = 6,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 7] = [
        ConnectionType::Disabled,
        ConnectionType::Lan,
        ConnectionType::Excellent,
        ConnectionType::Good,
        ConnectionType::Average,
        ConnectionType::Low,
        ConnectionType::Bad,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Actions carried per game data message; never zero.
    pub fn actions_per_message(self) -> usize {
        (self as usize).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Connecting,
    Idle,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameStatus {
    Waiting,
    Synchronizing,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
    pub ping: u32,
    pub status: UserStatus,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSummary {
    pub game_id: GameId,
    pub rom_name: String,
    pub owner: String,
    pub status: GameStatus,
    pub num_players: u8,
    pub max_users: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub user_id: UserId,
    pub username: String,
    pub ping: u32,
    pub connection_type: ConnectionType,
    pub player_number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // Login
    UserInformation {
        username: String,
        client_type: String,
        connection_type: ConnectionType,
    },
    ServerAck,
    ClientAck,
    LoginSuccess {
        user_id: UserId,
        users: Vec<UserSummary>,
        games: Vec<GameSummary>,
    },
    ConnectionRejected {
        username: String,
        reason: String,
    },
    KeepAlive,
    Quit {
        message: String,
    },

    // Lobby
    UserJoined(UserSummary),
    UserQuit {
        user_id: UserId,
        username: String,
        message: String,
    },
    Chat {
        message: String,
    },
    ChatNotification {
        username: String,
        message: String,
    },
    InformationMessage {
        source: String,
        message: String,
    },
    CreateGame {
        rom_name: String,
    },
    GameCreated(GameSummary),
    GameStatus(GameSummary),
    GameClosed {
        game_id: GameId,
    },
    JoinGame {
        game_id: GameId,
    },
    CloseGame,

    // In game
    PlayerJoined {
        game_id: GameId,
        player: PlayerSummary,
    },
    PlayerInformation {
        players: Vec<PlayerSummary>,
    },
    QuitGame,
    PlayerQuit {
        user_id: UserId,
        username: String,
    },
    StartGame,
    StartGameNotification {
        player_number: u8,
        num_players: u8,
        frame_delay: u8,
    },
    AllReady {
        player_number: u8,
    },
    AllReadyNotification,
    GameData {
        data: Vec<u8>,
    },
    GameChat {
        message: String,
    },
    GameChatNotification {
        username: String,
        message: String,
    },
    GameKick {
        user_id: UserId,
    },
    PlayerDrop,
    PlayerDropped {
        username: String,
        player_number: u8,
    },
    DroppedPacket,
}

impl Message {
    /// Messages that only prove the peer is alive and do not count as
    /// user activity for idle tracking.
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Message::KeepAlive | Message::ClientAck)
    }
}
