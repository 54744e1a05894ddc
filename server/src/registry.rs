//! Global table of logged-in users and active games.
//!
//! Locking: the user/game tables live behind one `RwLock`, each game behind
//! its own `Mutex`. The registry lock is always taken first and game code
//! never calls back into the registry, so the two can be nested safely.
//! Structural changes (login, quit, joining, leaving, starting) take the
//! write lock; the high-rate paths (activity stamps, game data, game chat)
//! only read.

use crate::access::{AccessLevel, AccessPolicy};
use crate::config::ServerConfig;
use crate::error::{
    ChatError, CloseGameError, CreateGameError, DropGameError, GameChatError, GameDataError,
    GameDataErrorKind, JoinGameError, KickError, LoginError, QuitGameError, ReadyError,
    StartGameError,
};
use crate::events::ServerEvent;
use crate::game::{Game, GameSettings, PlayerInfo, QuitOutcome, SlotState, SERVER_NAME};
use crate::timer::DelayedTasks;
use crate::user::{Activity, Outbox, User};
use log::{debug, info, warn};
use netplay_shared::{
    ConnectionType, GameId, GameStatus, GameSummary, Message, UserId, UserStatus, UserSummary,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 256;

/// Everything a session knows about a client when it asks to log in.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub client_type: String,
    pub connection_type: ConnectionType,
    pub ping: u32,
    /// Source of the login traffic.
    pub address: SocketAddr,
    /// The address the session was allocated for during the handshake.
    pub allocated_ip: IpAddr,
    pub outbox: Outbox,
}

struct Tables {
    users: HashMap<UserId, User>,
    games: HashMap<GameId, Arc<Mutex<Game>>>,
    next_user_id: UserId,
    next_game_id: GameId,
}

impl Tables {
    fn allocate_user_id(&mut self) -> Option<UserId> {
        for _ in 0..=u16::MAX {
            let id = self.next_user_id;
            self.next_user_id = self.next_user_id.wrapping_add(1).max(1);
            if !self.users.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn allocate_game_id(&mut self) -> GameId {
        loop {
            let id = self.next_game_id;
            self.next_game_id = self.next_game_id.wrapping_add(1).max(1);
            if !self.games.contains_key(&id) {
                return id;
            }
        }
    }

    /// Users that want lobby traffic; p2p users only hear about their game.
    fn lobby(&self) -> impl Iterator<Item = &User> {
        self.users
            .values()
            .filter(|user| !(user.p2p && user.game.is_some()))
    }

    fn broadcast_lobby(&self, message: Message) {
        for user in self.lobby() {
            user.send(message.clone());
        }
    }

    fn game(&self, game_id: GameId) -> Option<Arc<Mutex<Game>>> {
        self.games.get(&game_id).cloned()
    }

    fn game_of(&self, user_id: UserId) -> Option<(GameId, Arc<Mutex<Game>>)> {
        let game_id = self.users.get(&user_id)?.game?;
        Some((game_id, self.game(game_id)?))
    }

    /// Mirrors a game's state onto its members' user status.
    fn sync_statuses(&mut self, game: &Game) {
        for user_id in game.member_ids() {
            let playing = game.status() == GameStatus::Playing
                && game
                    .player_number(user_id)
                    .and_then(|n| game.slot_state(n))
                    == Some(SlotState::Playing);
            if let Some(user) = self.users.get_mut(&user_id) {
                user.status = if playing {
                    UserStatus::Playing
                } else {
                    UserStatus::Idle
                };
            }
        }
    }

    fn leave_game(&mut self, user_id: UserId) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.game = None;
            user.status = UserStatus::Idle;
        }
    }
}

pub struct ServerRegistry {
    config: Arc<ServerConfig>,
    access: Arc<dyn AccessPolicy>,
    tables: RwLock<Tables>,
    start_timers: DelayedTasks<GameId>,
    events: broadcast::Sender<ServerEvent>,
}

fn validate_user_name(name: &str, max_len: usize) -> Result<(), LoginError> {
    let len = name.chars().count();
    if name.trim().is_empty() {
        return Err(LoginError::UserName("user name is empty".to_string()));
    }
    if len > max_len {
        return Err(LoginError::UserName(format!(
            "user name is {len} characters, the limit is {max_len}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(LoginError::UserName(
            "user name contains control characters".to_string(),
        ));
    }
    Ok(())
}

impl ServerRegistry {
    /// Creates an empty registry.
    ///
    /// `access` decides the privilege of every login address; the registry
    /// never bans or allows anyone itself.
    pub fn new(config: Arc<ServerConfig>, access: Arc<dyn AccessPolicy>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            access,
            tables: RwLock::new(Tables {
                users: HashMap::new(),
                games: HashMap::new(),
                next_user_id: 1,
                next_game_id: 1,
            }),
            start_timers: DelayedTasks::new(),
            events,
        }
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Subscribes to logins, quits and game lifecycle events.
    ///
    /// Slow subscribers lag rather than block the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ServerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn game_settings(&self) -> GameSettings {
        GameSettings::from_config(&self.config)
    }

    /// Admits a user whose ping has been measured.
    ///
    /// Checks ping, address, connection type, name, access and capacity in
    /// that order. On success the new user gets `LoginSuccess` with the
    /// current user and game lists, and the lobby gets `UserJoined`.
    pub async fn login(&self, request: LoginRequest) -> Result<UserId, LoginError> {
        let config = &self.config;
        if request.ping > config.max_ping {
            return Err(LoginError::Ping {
                ping: request.ping,
                max: config.max_ping,
            });
        }
        let ip = request.address.ip();
        if ip.is_unspecified() || ip.is_multicast() || ip != request.allocated_ip {
            return Err(LoginError::Address(ip));
        }
        if !config.is_connection_type_allowed(request.connection_type) {
            return Err(LoginError::ConnectionType(request.connection_type));
        }
        validate_user_name(&request.username, config.max_user_name_length)?;
        let access = self.access.access_level(ip);
        if access == AccessLevel::Banned {
            return Err(LoginError::Login("access denied".to_string()));
        }

        let mut tables = self.tables.write().await;
        if tables.users.len() >= config.max_users {
            return Err(LoginError::Login("server is full".to_string()));
        }
        let user_id = tables
            .allocate_user_id()
            .ok_or_else(|| LoginError::Login("no free user ids".to_string()))?;

        let now = Instant::now();
        let user = User {
            id: user_id,
            name: request.username,
            client_type: request.client_type,
            status: UserStatus::Idle,
            connection_type: request.connection_type,
            ping: request.ping,
            address: request.address,
            access,
            game: None,
            activity: Activity::new(now),
            last_chat: None,
            last_create_game: None,
            muted: false,
            ignoring_broadcasts: false,
            p2p: false,
            outbox: request.outbox,
        };
        let summary = user.summary();
        tables.users.insert(user_id, user);

        let mut users: Vec<UserSummary> = tables.users.values().map(User::summary).collect();
        users.sort_by_key(|u| u.user_id);
        let games = Self::game_summaries(&tables).await;
        if let Some(user) = tables.users.get(&user_id) {
            user.send(Message::LoginSuccess {
                user_id,
                users,
                games,
            });
        }
        tables.broadcast_lobby(Message::UserJoined(summary.clone()));
        drop(tables);

        info!(
            "User {} logged in as {:?} from {} (ping {} ms, {:?})",
            user_id, summary.username, request.address, summary.ping, summary.connection_type
        );
        self.emit(ServerEvent::UserLoggedIn {
            user_id,
            username: summary.username,
        });
        Ok(user_id)
    }

    async fn game_summaries(tables: &Tables) -> Vec<GameSummary> {
        let mut games = Vec::with_capacity(tables.games.len());
        for game in tables.games.values() {
            games.push(game.lock().await.summary());
        }
        games.sort_by_key(|g| g.game_id);
        games
    }

    /// Records traffic from a user; keep-alives do not count as activity.
    ///
    /// Called for every inbound message, so it only takes the read lock.
    pub async fn touch(&self, user_id: UserId, keep_alive_only: bool, now: Instant) {
        let tables = self.tables.read().await;
        if let Some(user) = tables.users.get(&user_id) {
            user.activity.record(keep_alive_only, now);
        }
    }

    /// Lobby chat line, subject to mute, flood time and length limits.
    pub async fn chat(&self, user_id: UserId, message: String, now: Instant) -> Result<(), ChatError> {
        let mut tables = self.tables.write().await;
        let flood_time = self.config.chat_flood_time();
        let max_len = self.config.max_chat_length;
        let user = tables.users.get_mut(&user_id).ok_or(ChatError::NotLoggedIn)?;
        if user.muted {
            return Err(ChatError::Muted);
        }
        if user
            .last_chat
            .is_some_and(|last| now.saturating_duration_since(last) < flood_time)
        {
            return Err(ChatError::Flood);
        }
        if message.trim().is_empty() {
            return Err(ChatError::Empty);
        }
        let len = message.chars().count();
        if len > max_len {
            return Err(ChatError::TooLong { len, max: max_len });
        }
        user.last_chat = Some(now);
        let username = user.name.clone();
        debug!("Chat from {}: {}", username, message);
        tables.broadcast_lobby(Message::ChatNotification { username, message });
        Ok(())
    }

    /// Opens a game owned by `user_id` and seats them as player 1.
    ///
    /// Refused while the user already sits in a game or inside the create
    /// flood time, for a blank or oversized ROM name and once `max_games`
    /// games exist.
    pub async fn create_game(
        &self,
        user_id: UserId,
        rom_name: String,
        now: Instant,
    ) -> Result<GameId, CreateGameError> {
        let mut tables = self.tables.write().await;
        let game_count = tables.games.len();
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(CreateGameError::NotLoggedIn)?;
        if user.game.is_some() {
            return Err(CreateGameError::AlreadyInGame);
        }
        if user.last_create_game.is_some_and(|last| {
            now.saturating_duration_since(last) < self.config.create_game_flood_time()
        }) {
            return Err(CreateGameError::Flood);
        }
        if rom_name.trim().is_empty()
            || rom_name.chars().count() > self.config.max_game_name_length
            || rom_name.chars().any(char::is_control)
        {
            return Err(CreateGameError::InvalidRomName);
        }
        let max_games = self.config.max_games;
        if max_games != 0 && game_count >= max_games {
            return Err(CreateGameError::MaxGames(max_games));
        }
        user.last_create_game = Some(now);
        let owner = PlayerInfo {
            user_id,
            name: user.name.clone(),
            ping: user.ping,
            connection_type: user.connection_type,
            outbox: user.outbox.clone(),
        };

        let game_id = tables.allocate_game_id();
        let game = Game::new(game_id, rom_name, owner, self.game_settings());
        let summary = game.summary();
        tables.games.insert(game_id, Arc::new(Mutex::new(game)));
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.game = Some(game_id);
        }
        tables.broadcast_lobby(Message::GameCreated(summary.clone()));
        drop(tables);

        self.emit(ServerEvent::GameCreated {
            game_id,
            rom_name: summary.rom_name,
            owner: summary.owner,
        });
        Ok(game_id)
    }

    /// Seats the user in a waiting game; returns their player number.
    pub async fn join_game(&self, user_id: UserId, game_id: GameId) -> Result<u8, JoinGameError> {
        let mut tables = self.tables.write().await;
        let user = tables.users.get(&user_id).ok_or(JoinGameError::NotLoggedIn)?;
        if user.game.is_some() {
            return Err(JoinGameError::AlreadyInGame);
        }
        let player = PlayerInfo {
            user_id,
            name: user.name.clone(),
            ping: user.ping,
            connection_type: user.connection_type,
            outbox: user.outbox.clone(),
        };
        let game = tables.game(game_id).ok_or(JoinGameError::NoSuchGame)?;
        let mut game = game.lock().await;
        let player_number = game.join(player)?;
        let summary = game.summary();
        drop(game);

        if let Some(user) = tables.users.get_mut(&user_id) {
            user.game = Some(game_id);
        }
        tables.broadcast_lobby(Message::GameStatus(summary));
        Ok(player_number)
    }

    /// Starts the caller's game and arms the start timeout, after which a
    /// game whose players never all reported ready returns to waiting.
    pub async fn start_game(self: &Arc<Self>, user_id: UserId) -> Result<(), StartGameError> {
        let tables = self.tables.read().await;
        let (game_id, game) = tables.game_of(user_id).ok_or(StartGameError::NotInGame)?;
        let mut game = game.lock().await;
        game.start(user_id)?;
        tables.broadcast_lobby(Message::GameStatus(game.summary()));
        drop(game);
        drop(tables);

        let registry = Arc::downgrade(self);
        self.start_timers
            .schedule(game_id, self.config.start_timeout(), async move {
                if let Some(registry) = registry.upgrade() {
                    registry.start_timed_out(game_id).await;
                }
            });
        Ok(())
    }

    async fn start_timed_out(&self, game_id: GameId) {
        let tables = self.tables.read().await;
        let Some(game) = tables.game(game_id) else {
            return;
        };
        let mut game = game.lock().await;
        if game.abort_start("not every player was ready in time") {
            warn!("Game {} did not synchronize before the start timeout", game_id);
            tables.broadcast_lobby(Message::GameStatus(game.summary()));
        }
    }

    /// Marks a player ready. The last one flips the game to playing.
    pub async fn ready(&self, user_id: UserId, player_number: u8) -> Result<(), ReadyError> {
        let mut tables = self.tables.write().await;
        let (game_id, game) = tables.game_of(user_id).ok_or(ReadyError::NotInGame)?;
        let mut game = game.lock().await;
        if !game.ready(user_id, player_number)? {
            return Ok(());
        }
        self.start_timers.cancel(&game_id);
        tables.sync_statuses(&game);
        tables.broadcast_lobby(Message::GameStatus(game.summary()));
        let players = game.players().into_iter().map(|p| p.username).collect();
        drop(game);
        drop(tables);

        self.emit(ServerEvent::GameStarted { game_id, players });
        Ok(())
    }

    /// Feeds one frame of inputs into the caller's game.
    ///
    /// Only the game's own lock is held while the frame is combined and fanned
    /// out.
    pub async fn game_data(
        &self,
        user_id: UserId,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<(), GameDataError> {
        let tables = self.tables.read().await;
        let (_, game) = tables
            .game_of(user_id)
            .ok_or(GameDataError::new(GameDataErrorKind::NotInGame))?;
        drop(tables);
        let mut game = game.lock().await;
        game.add_data(user_id, data, now)
    }

    /// Replays the last combined block to the caller.
    pub async fn dropped_packet(&self, user_id: UserId) -> Result<(), DropGameError> {
        let tables = self.tables.read().await;
        let (_, game) = tables.game_of(user_id).ok_or(DropGameError::NotInGame)?;
        drop(tables);
        let mut game = game.lock().await;
        game.dropped_packet(user_id).map(|_| ())
    }

    /// Takes the caller out of the running game while the others play on.
    ///
    /// Their input column reads as zeroes from here on. The game goes back
    /// to waiting once nobody is left playing.
    pub async fn drop_game(&self, user_id: UserId) -> Result<(), DropGameError> {
        let mut tables = self.tables.write().await;
        let (_, game) = tables.game_of(user_id).ok_or(DropGameError::NotInGame)?;
        let mut game = game.lock().await;
        let returned_to_waiting = game.drop_player(user_id)?;
        tables.sync_statuses(&game);
        if returned_to_waiting {
            tables.broadcast_lobby(Message::GameStatus(game.summary()));
        }
        Ok(())
    }

    /// Chat line to every member of the caller's game.
    pub async fn game_chat(&self, user_id: UserId, message: String) -> Result<(), GameChatError> {
        let tables = self.tables.read().await;
        let user = tables.users.get(&user_id).ok_or(GameChatError::NotInGame)?;
        if user.muted {
            return Err(GameChatError::Muted);
        }
        let (_, game) = tables.game_of(user_id).ok_or(GameChatError::NotInGame)?;
        drop(tables);
        let game = game.lock().await;
        game.chat(user_id, message)
    }

    /// Removes `target` from the requester's game. Owners and admins only.
    pub async fn kick(&self, requester: UserId, target: UserId) -> Result<(), KickError> {
        let mut tables = self.tables.write().await;
        let is_admin = tables
            .users
            .get(&requester)
            .map(User::is_admin)
            .unwrap_or(false);
        let (game_id, game) = tables.game_of(requester).ok_or(KickError::NotInGame)?;
        let mut guard = game.lock().await;
        let outcome = guard.kick(requester, is_admin, target)?;
        tables.leave_game(target);
        self.apply_quit_outcome(&mut tables, game_id, &guard, outcome);
        Ok(())
    }

    /// Leaves the current game. An owner leaving hands the game to the next
    /// member; the last member leaving closes it.
    pub async fn quit_game(&self, user_id: UserId) -> Result<(), QuitGameError> {
        let mut tables = self.tables.write().await;
        let (game_id, game) = tables.game_of(user_id).ok_or(QuitGameError::NotInGame)?;
        let mut guard = game.lock().await;
        let outcome = guard.quit(user_id)?;
        tables.leave_game(user_id);
        self.apply_quit_outcome(&mut tables, game_id, &guard, outcome);
        Ok(())
    }

    /// Lobby bookkeeping after a member left a game.
    fn apply_quit_outcome(
        &self,
        tables: &mut Tables,
        game_id: GameId,
        game: &Game,
        outcome: QuitOutcome,
    ) {
        if outcome.closed {
            tables.games.remove(&game_id);
            self.start_timers.cancel(&game_id);
            tables.broadcast_lobby(Message::GameClosed { game_id });
            info!("Game {} closed", game_id);
            self.emit(ServerEvent::GameClosed { game_id });
            return;
        }
        if outcome.returned_to_waiting {
            self.start_timers.cancel(&game_id);
        }
        tables.sync_statuses(game);
        tables.broadcast_lobby(Message::GameStatus(game.summary()));
    }

    /// Closes the caller's game and sends every member back to the lobby.
    pub async fn close_game(&self, user_id: UserId) -> Result<(), CloseGameError> {
        let mut tables = self.tables.write().await;
        let user = tables.users.get(&user_id).ok_or(CloseGameError::NotInGame)?;
        let is_admin = user.is_admin();
        let game_id = user.game.ok_or(CloseGameError::NotInGame)?;
        let game = tables.game(game_id).ok_or(CloseGameError::NoSuchGame)?;
        let members = game.lock().await.close(user_id, is_admin)?;

        tables.games.remove(&game_id);
        self.start_timers.cancel(&game_id);
        // members rejoin the lobby first so p2p users hear about the close
        for member in &members {
            tables.leave_game(*member);
        }
        tables.broadcast_lobby(Message::GameClosed { game_id });
        drop(tables);

        self.emit(ServerEvent::GameClosed { game_id });
        Ok(())
    }

    /// Server message to every user (or only `target`), optionally also
    /// into every game's chat.
    pub async fn announce(&self, message: &str, include_games: bool, target: Option<UserId>) {
        let tables = self.tables.read().await;
        let info = Message::InformationMessage {
            source: SERVER_NAME.to_string(),
            message: message.to_string(),
        };
        match target {
            Some(user_id) => {
                if let Some(user) = tables.users.get(&user_id) {
                    user.send(info);
                }
            }
            None => {
                for user in tables.users.values().filter(|u| !u.ignoring_broadcasts) {
                    user.send(info.clone());
                }
            }
        }
        if include_games {
            for game in tables.games.values() {
                game.lock().await.announce(message);
            }
        }
    }

    /// Removes a user, leaving its game first. Returns false if the user
    /// was already gone.
    pub async fn quit(&self, user_id: UserId, message: &str) -> bool {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&user_id) {
            return false;
        }
        if let Some((game_id, game)) = tables.game_of(user_id) {
            let mut guard = game.lock().await;
            if let Ok(outcome) = guard.quit(user_id) {
                tables.leave_game(user_id);
                self.apply_quit_outcome(&mut tables, game_id, &guard, outcome);
            }
        }
        let Some(user) = tables.users.remove(&user_id) else {
            return false;
        };
        tables.broadcast_lobby(Message::UserQuit {
            user_id,
            username: user.name.clone(),
            message: message.to_string(),
        });
        drop(tables);

        info!("User {} ({}) quit: {}", user_id, user.name, message);
        self.emit(ServerEvent::UserQuit {
            user_id,
            username: user.name,
            message: message.to_string(),
        });
        true
    }

    /// Periodic housekeeping: idle and keep-alive timeouts, stalled games.
    /// Returns the users removed.
    pub async fn sweep(&self, now: Instant) -> Vec<UserId> {
        let idle_timeout = self.config.idle_timeout();
        let keep_alive_timeout = self.config.keep_alive_timeout();

        let expired: Vec<(UserId, Outbox, &'static str)> = {
            let tables = self.tables.read().await;
            tables
                .users
                .values()
                .filter_map(|user| {
                    if now.saturating_duration_since(user.activity.last_keep_alive())
                        > keep_alive_timeout
                    {
                        Some((user.id, user.outbox.clone(), "keep-alive timeout"))
                    } else if !user.is_admin()
                        && now.saturating_duration_since(user.activity.last_activity()) > idle_timeout
                    {
                        Some((user.id, user.outbox.clone(), "idle timeout"))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut removed = Vec::new();
        for (user_id, outbox, reason) in expired {
            info!("User {} timed out: {}", user_id, reason);
            outbox.close(reason);
            if self.quit(user_id, reason).await {
                removed.push(user_id);
            }
        }

        let mut tables = self.tables.write().await;
        let games: Vec<_> = tables.games.values().cloned().collect();
        for game in games {
            let mut game = game.lock().await;
            let before = game.status();
            let dropped = game.check_timeouts(now);
            if !dropped.is_empty() {
                tables.sync_statuses(&game);
                if game.status() != before {
                    tables.broadcast_lobby(Message::GameStatus(game.summary()));
                }
            }
        }
        removed
    }

    /// Cancels pending start timeouts.
    pub fn shutdown(&self) {
        self.start_timers.cancel_all();
    }

    /// Admin switches. Each returns false when the user is not logged in.
    pub async fn set_muted(&self, user_id: UserId, muted: bool) -> bool {
        let mut tables = self.tables.write().await;
        tables
            .users
            .get_mut(&user_id)
            .map(|user| user.muted = muted)
            .is_some()
    }

    pub async fn set_ignoring_broadcasts(&self, user_id: UserId, ignoring: bool) -> bool {
        let mut tables = self.tables.write().await;
        tables
            .users
            .get_mut(&user_id)
            .map(|user| user.ignoring_broadcasts = ignoring)
            .is_some()
    }

    pub async fn set_p2p(&self, user_id: UserId, p2p: bool) -> bool {
        let mut tables = self.tables.write().await;
        tables
            .users
            .get_mut(&user_id)
            .map(|user| user.p2p = p2p)
            .is_some()
    }

    /// Snapshot of one user.
    pub async fn user(&self, user_id: UserId) -> Option<UserSummary> {
        self.tables.read().await.users.get(&user_id).map(User::summary)
    }

    /// Game the user sits in, if any.
    pub async fn user_game(&self, user_id: UserId) -> Option<GameId> {
        self.tables.read().await.users.get(&user_id)?.game
    }

    pub async fn users(&self) -> Vec<UserSummary> {
        let tables = self.tables.read().await;
        let mut users: Vec<_> = tables.users.values().map(User::summary).collect();
        users.sort_by_key(|u| u.user_id);
        users
    }

    pub async fn games(&self) -> Vec<GameSummary> {
        let tables = self.tables.read().await;
        Self::game_summaries(&tables).await
    }

    pub async fn game(&self, game_id: GameId) -> Option<GameSummary> {
        let game = self.tables.read().await.game(game_id)?;
        let summary = game.lock().await.summary();
        Some(summary)
    }

    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }

    pub async fn game_count(&self) -> usize {
        self.tables.read().await.games.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessManager;
    use crate::config::AccessConfig;
    use crate::user::Outbound;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, last)), 40000)
    }

    fn registry_with(config: ServerConfig) -> Arc<ServerRegistry> {
        let access = Arc::new(AccessManager::new(&config.access));
        Arc::new(ServerRegistry::new(Arc::new(config), access))
    }

    fn registry() -> Arc<ServerRegistry> {
        registry_with(ServerConfig::default())
    }

    fn request(name: &str, last: u8) -> (LoginRequest, UnboundedReceiver<Outbound>) {
        let (outbox, rx) = Outbox::channel();
        (
            LoginRequest {
                username: name.to_string(),
                client_type: "test".to_string(),
                connection_type: ConnectionType::Lan,
                ping: 20,
                address: addr(last),
                allocated_ip: addr(last).ip(),
                outbox,
            },
            rx,
        )
    }

    async fn login(
        registry: &ServerRegistry,
        name: &str,
        last: u8,
    ) -> (UserId, UnboundedReceiver<Outbound>) {
        let (request, rx) = request(name, last);
        (registry.login(request).await.unwrap(), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn messages(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Message> {
        drain(rx)
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Message(m) => Some(m),
                Outbound::Close(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_login_success() {
        let registry = registry();
        let mut events = registry.subscribe();
        let (first, _rx1) = login(&registry, "alice", 1).await;
        let (second, mut rx2) = login(&registry, "bob", 2).await;
        assert_ne!(first, second);
        assert_eq!(registry.user_count().await, 2);

        let received = messages(&mut rx2);
        match &received[0] {
            Message::LoginSuccess { user_id, users, .. } => {
                assert_eq!(*user_id, second);
                assert_eq!(users.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::UserLoggedIn { .. }
        ));
    }

    #[tokio::test]
    async fn test_login_checks_in_order() {
        let registry = registry();

        let (mut req, _rx) = request("", 1);
        req.ping = 5000;
        req.connection_type = ConnectionType::Disabled;
        assert_eq!(
            registry.login(req).await,
            Err(LoginError::Ping {
                ping: 5000,
                max: 1000
            })
        );

        let (mut req, _rx) = request("", 1);
        req.allocated_ip = addr(9).ip();
        req.connection_type = ConnectionType::Disabled;
        assert_eq!(
            registry.login(req).await,
            Err(LoginError::Address(addr(1).ip()))
        );

        let (mut req, _rx) = request("", 1);
        req.connection_type = ConnectionType::Disabled;
        assert_eq!(
            registry.login(req).await,
            Err(LoginError::ConnectionType(ConnectionType::Disabled))
        );

        let (req, _rx) = request("", 1);
        assert!(matches!(
            registry.login(req).await,
            Err(LoginError::UserName(_))
        ));
        let (req, _rx) = request(&"x".repeat(32), 1);
        assert!(matches!(
            registry.login(req).await,
            Err(LoginError::UserName(_))
        ));
        let (req, _rx) = request("bad\u{7}name", 1);
        assert!(matches!(
            registry.login(req).await,
            Err(LoginError::UserName(_))
        ));
        assert_eq!(registry.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_login_capacity_and_bans() {
        let config = ServerConfig {
            max_users: 1,
            access: AccessConfig {
                admins: Vec::new(),
                denied: vec![addr(3).ip()],
            },
            ..ServerConfig::default()
        };
        let registry = registry_with(config);

        let (req, _rx) = request("denied", 3);
        assert!(matches!(registry.login(req).await, Err(LoginError::Login(_))));

        let (_id, _rx1) = login(&registry, "first", 1).await;
        let (req, _rx) = request("second", 2);
        assert_eq!(
            registry.login(req).await,
            Err(LoginError::Login("server is full".to_string()))
        );
    }

    #[tokio::test]
    async fn test_chat_flood() {
        let registry = registry();
        let (alice, _rx1) = login(&registry, "alice", 1).await;
        let (_bob, mut rx2) = login(&registry, "bob", 2).await;
        drain(&mut rx2);

        let start = Instant::now();
        registry.chat(alice, "hello".to_string(), start).await.unwrap();
        assert_eq!(
            registry
                .chat(alice, "again".to_string(), start + Duration::from_millis(500))
                .await,
            Err(ChatError::Flood)
        );
        registry
            .chat(alice, "later".to_string(), start + Duration::from_secs(2))
            .await
            .unwrap();

        let chats: Vec<String> = messages(&mut rx2)
            .into_iter()
            .filter_map(|m| match m {
                Message::ChatNotification { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(chats, vec!["hello".to_string(), "later".to_string()]);
    }

    #[tokio::test]
    async fn test_chat_errors() {
        let registry = registry();
        let (alice, _rx) = login(&registry, "alice", 1).await;
        let now = Instant::now();
        assert_eq!(
            registry.chat(99, "hi".to_string(), now).await,
            Err(ChatError::NotLoggedIn)
        );
        assert_eq!(
            registry.chat(alice, " ".to_string(), now).await,
            Err(ChatError::Empty)
        );
        assert!(matches!(
            registry.chat(alice, "y".repeat(151), now).await,
            Err(ChatError::TooLong { len: 151, max: 150 })
        ));
        registry.set_muted(alice, true).await;
        assert_eq!(
            registry.chat(alice, "hi".to_string(), now).await,
            Err(ChatError::Muted)
        );
    }

    #[tokio::test]
    async fn test_create_game_limits() {
        let config = ServerConfig {
            max_games: 1,
            ..ServerConfig::default()
        };
        let registry = registry_with(config);
        let (alice, _rx1) = login(&registry, "alice", 1).await;
        let (bob, _rx2) = login(&registry, "bob", 2).await;
        let now = Instant::now();

        assert_eq!(
            registry.create_game(alice, "".to_string(), now).await,
            Err(CreateGameError::InvalidRomName)
        );
        let game_id = registry
            .create_game(alice, "Street Fighter".to_string(), now)
            .await
            .unwrap();
        assert_eq!(registry.user_game(alice).await, Some(game_id));
        assert_eq!(
            registry.create_game(alice, "Other".to_string(), now).await,
            Err(CreateGameError::AlreadyInGame)
        );
        assert_eq!(
            registry.create_game(bob, "Other".to_string(), now).await,
            Err(CreateGameError::MaxGames(1))
        );
        assert_eq!(
            registry.create_game(77, "Other".to_string(), now).await,
            Err(CreateGameError::NotLoggedIn)
        );
    }

    #[tokio::test]
    async fn test_create_game_flood() {
        let registry = registry();
        let (alice, _rx) = login(&registry, "alice", 1).await;
        let start = Instant::now();
        registry
            .create_game(alice, "one".to_string(), start)
            .await
            .unwrap();
        registry.quit_game(alice).await.unwrap();
        assert_eq!(
            registry
                .create_game(alice, "two".to_string(), start + Duration::from_secs(1))
                .await,
            Err(CreateGameError::Flood)
        );
        registry
            .create_game(alice, "two".to_string(), start + Duration::from_secs(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_and_play() {
        let registry = registry();
        let mut events = registry.subscribe();
        let (alice, mut rx1) = login(&registry, "alice", 1).await;
        let (bob, mut rx2) = login(&registry, "bob", 2).await;
        let game_id = registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();

        assert_eq!(
            registry.join_game(bob, 999).await,
            Err(JoinGameError::NoSuchGame)
        );
        assert_eq!(registry.join_game(bob, game_id).await, Ok(2));
        assert_eq!(
            registry.join_game(bob, game_id).await,
            Err(JoinGameError::AlreadyInGame)
        );

        assert_eq!(registry.start_game(bob).await, Err(StartGameError::NotOwner));
        registry.start_game(alice).await.unwrap();
        registry.ready(alice, 1).await.unwrap();
        registry.ready(bob, 2).await.unwrap();
        assert_eq!(
            registry.game(game_id).await.unwrap().status,
            GameStatus::Playing
        );
        assert_eq!(
            registry.user(alice).await.unwrap().status,
            UserStatus::Playing
        );
        drain(&mut rx1);
        drain(&mut rx2);

        let now = Instant::now();
        registry.game_data(alice, vec![1, 2], now).await.unwrap();
        registry.game_data(bob, vec![3, 4], now).await.unwrap();
        assert!(messages(&mut rx1).contains(&Message::GameData {
            data: vec![1, 2, 3, 4]
        }));

        let mut saw_started = false;
        while let Ok(event) = events.try_recv() {
            saw_started |= matches!(event, ServerEvent::GameStarted { game_id: id, .. } if id == game_id);
        }
        assert!(saw_started);
    }

    #[tokio::test]
    async fn test_drop_game_leaves_other_player_running() {
        let registry = registry();
        let (alice, mut rx1) = login(&registry, "alice", 1).await;
        let (bob, _rx2) = login(&registry, "bob", 2).await;
        let game_id = registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();
        registry.join_game(bob, game_id).await.unwrap();
        assert_eq!(registry.drop_game(bob).await, Err(DropGameError::NotPlaying));

        registry.start_game(alice).await.unwrap();
        registry.ready(alice, 1).await.unwrap();
        registry.ready(bob, 2).await.unwrap();
        drain(&mut rx1);

        registry.drop_game(bob).await.unwrap();
        assert_eq!(
            registry.drop_game(bob).await,
            Err(DropGameError::AlreadyDropped)
        );
        assert_eq!(registry.user(bob).await.unwrap().status, UserStatus::Idle);
        assert_eq!(
            registry.game(game_id).await.unwrap().status,
            GameStatus::Playing
        );
        assert!(messages(&mut rx1)
            .iter()
            .any(|m| matches!(m, Message::PlayerDropped { player_number: 2, .. })));

        registry
            .game_data(alice, vec![5, 6], Instant::now())
            .await
            .unwrap();
        assert!(messages(&mut rx1).contains(&Message::GameData {
            data: vec![5, 6, 0, 0]
        }));
    }

    #[tokio::test]
    async fn test_touch_only_needs_read_access() {
        let registry = registry();
        let (alice, _rx) = login(&registry, "alice", 1).await;

        // a concurrent reader must not hold up activity stamps
        let tables = registry.tables.read().await;
        let touched = tokio::time::timeout(
            Duration::from_secs(1),
            registry.touch(alice, false, Instant::now()),
        )
        .await;
        assert!(touched.is_ok());
        drop(tables);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_returns_to_waiting() {
        let registry = registry();
        let (alice, _rx1) = login(&registry, "alice", 1).await;
        let (bob, _rx2) = login(&registry, "bob", 2).await;
        let game_id = registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();
        registry.join_game(bob, game_id).await.unwrap();
        registry.start_game(alice).await.unwrap();
        registry.ready(alice, 1).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            registry.game(game_id).await.unwrap().status,
            GameStatus::Synchronizing
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            registry.game(game_id).await.unwrap().status,
            GameStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_quit_closes_empty_game_and_is_idempotent() {
        let registry = registry();
        let mut events = registry.subscribe();
        let (alice, _rx1) = login(&registry, "alice", 1).await;
        let (_bob, mut rx2) = login(&registry, "bob", 2).await;
        let game_id = registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();
        drain(&mut rx2);

        assert!(registry.quit(alice, "bye").await);
        assert!(!registry.quit(alice, "bye").await);
        assert_eq!(registry.game_count().await, 0);

        let received = messages(&mut rx2);
        assert!(received.contains(&Message::GameClosed { game_id }));
        assert!(received
            .iter()
            .any(|m| matches!(m, Message::UserQuit { user_id, .. } if *user_id == alice)));

        let mut closed = false;
        while let Ok(event) = events.try_recv() {
            closed |= event == ServerEvent::GameClosed { game_id };
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn test_kick_and_close() {
        let registry = registry();
        let (alice, _rx1) = login(&registry, "alice", 1).await;
        let (bob, _rx2) = login(&registry, "bob", 2).await;
        let game_id = registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();
        registry.join_game(bob, game_id).await.unwrap();

        assert_eq!(registry.kick(bob, alice).await, Err(KickError::NotOwner));
        registry.kick(alice, bob).await.unwrap();
        assert_eq!(registry.user_game(bob).await, None);

        registry.join_game(bob, game_id).await.unwrap();
        assert_eq!(registry.close_game(bob).await, Err(CloseGameError::NotOwner));
        registry.close_game(alice).await.unwrap();
        assert_eq!(registry.user_game(alice).await, None);
        assert_eq!(registry.user_game(bob).await, None);
        assert_eq!(registry.game_count().await, 0);
    }

    #[tokio::test]
    async fn test_p2p_users_skip_lobby_traffic_in_game() {
        let registry = registry();
        let (alice, mut rx1) = login(&registry, "alice", 1).await;
        let (bob, _rx2) = login(&registry, "bob", 2).await;
        registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();
        registry.set_p2p(alice, true).await;
        drain(&mut rx1);

        registry
            .chat(bob, "anyone?".to_string(), Instant::now())
            .await
            .unwrap();
        assert!(messages(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_announce() {
        let registry = registry();
        let (alice, mut rx1) = login(&registry, "alice", 1).await;
        let (bob, mut rx2) = login(&registry, "bob", 2).await;
        registry
            .create_game(alice, "rom".to_string(), Instant::now())
            .await
            .unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        registry.announce("only bob", false, Some(bob)).await;
        assert!(messages(&mut rx1).is_empty());
        assert_eq!(messages(&mut rx2).len(), 1);

        registry.set_ignoring_broadcasts(bob, true).await;
        registry.announce("restart soon", true, None).await;
        let to_alice = messages(&mut rx1);
        assert!(to_alice
            .iter()
            .any(|m| matches!(m, Message::InformationMessage { .. })));
        assert!(to_alice
            .iter()
            .any(|m| matches!(m, Message::GameChatNotification { .. })));
        assert!(messages(&mut rx2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_silent_users() {
        let registry = registry();
        let (alice, mut rx1) = login(&registry, "alice", 1).await;
        let (bob, _rx2) = login(&registry, "bob", 2).await;

        tokio::time::advance(Duration::from_secs(100)).await;
        registry.touch(bob, true, Instant::now()).await;
        assert!(registry.sweep(Instant::now()).await.is_empty());

        tokio::time::advance(Duration::from_secs(100)).await;
        registry.touch(bob, true, Instant::now()).await;
        assert_eq!(registry.sweep(Instant::now()).await, vec![alice]);
        assert!(drain(&mut rx1)
            .iter()
            .any(|o| matches!(o, Outbound::Close(_))));
        assert_eq!(registry.user_count().await, 1);
    }
}
