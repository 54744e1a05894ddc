//! Presence and game lifecycle notifications for observers outside the
//! core (consoles, list reporters, tests).

use netplay_shared::{GameId, UserId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServerEvent {
    UserLoggedIn {
        user_id: UserId,
        username: String,
    },
    UserQuit {
        user_id: UserId,
        username: String,
        message: String,
    },
    /// A new game is looking for players.
    GameCreated {
        game_id: GameId,
        rom_name: String,
        owner: String,
    },
    GameStarted {
        game_id: GameId,
        players: Vec<String>,
    },
    GameClosed {
        game_id: GameId,
    },
}
