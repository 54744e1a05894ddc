use netplay_shared::{GameId, GameSummary, Message, PlayerSummary, UserId, UserSummary};
use std::collections::BTreeMap;

/// What the client knows about the lobby and its own game, rebuilt from
/// server notifications.
#[derive(Debug, Clone, Default)]
pub struct ClientGameState {
    pub user_id: Option<UserId>,
    pub username: String,
    pub users: BTreeMap<UserId, UserSummary>,
    pub games: BTreeMap<GameId, GameSummary>,
    pub game: Option<GameId>,
    pub players: Vec<PlayerSummary>,
    pub player_number: Option<u8>,
    pub num_players: u8,
    pub frame_delay: u8,
    pub playing: bool,
    /// Player numbers that dropped out of the running game.
    pub dropped: Vec<u8>,
}

impl ClientGameState {
    pub fn new() -> Self {
        Self::default()
    }

    fn leave_game(&mut self) {
        self.game = None;
        self.players.clear();
        self.player_number = None;
        self.num_players = 0;
        self.frame_delay = 0;
        self.playing = false;
        self.dropped.clear();
    }

    pub fn apply(&mut self, message: &Message) {
        match message {
            Message::LoginSuccess {
                user_id,
                users,
                games,
            } => {
                self.user_id = Some(*user_id);
                self.users = users.iter().map(|u| (u.user_id, u.clone())).collect();
                self.games = games.iter().map(|g| (g.game_id, g.clone())).collect();
            }
            Message::UserJoined(user) => {
                self.users.insert(user.user_id, user.clone());
            }
            Message::UserQuit { user_id, .. } => {
                self.users.remove(user_id);
            }
            Message::GameCreated(game) | Message::GameStatus(game) => {
                self.games.insert(game.game_id, game.clone());
            }
            Message::GameClosed { game_id } => {
                self.games.remove(game_id);
                if self.game == Some(*game_id) {
                    self.leave_game();
                }
            }
            Message::PlayerInformation { players } => {
                self.players = players.clone();
            }
            Message::PlayerJoined { game_id, player } => {
                if Some(player.user_id) == self.user_id {
                    self.game = Some(*game_id);
                    self.player_number = Some(player.player_number);
                }
                self.players.retain(|p| p.user_id != player.user_id);
                self.players.push(player.clone());
            }
            Message::PlayerQuit { user_id, .. } => {
                if Some(*user_id) == self.user_id {
                    self.leave_game();
                } else {
                    self.players.retain(|p| p.user_id != *user_id);
                }
            }
            Message::StartGameNotification {
                player_number,
                num_players,
                frame_delay,
            } => {
                self.player_number = Some(*player_number);
                self.num_players = *num_players;
                self.frame_delay = *frame_delay;
                self.playing = false;
                self.dropped.clear();
            }
            Message::AllReadyNotification => self.playing = true,
            Message::PlayerDropped { player_number, .. } => {
                if Some(*player_number) == self.player_number {
                    self.playing = false;
                }
                self.dropped.push(*player_number);
            }
            _ => {}
        }
    }
}

/// Splits one combined block into each player's bytes for every action.
/// Player `p` occupies `[(p-1)·B, p·B)` of each `num_players·B` action.
pub fn split_actions(block: &[u8], num_players: usize, bytes_per_action: usize) -> Vec<Vec<u8>> {
    let mut columns = vec![Vec::new(); num_players];
    if num_players == 0 || bytes_per_action == 0 {
        return columns;
    }
    for action in block.chunks(num_players * bytes_per_action) {
        for (player, column) in columns.iter_mut().enumerate() {
            let start = player * bytes_per_action;
            if let Some(bytes) = action.get(start..start + bytes_per_action) {
                column.extend_from_slice(bytes);
            }
        }
    }
    columns
}
