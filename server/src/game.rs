//! One netplay game: roster, start negotiation and action fan-out.
//!
//! The roster is an arena of slots. A player's number is its slot position
//! plus one and never changes; players who leave keep their slot in the
//! `Left` state so later joiners never reuse a number. Once started, every
//! member slot owns a [`PlayerActionQueue`] and the combined response block
//! is `num_slots * bytes_per_action` wide per action, with columns of
//! non-playing slots filled with zeros.
//!
//! A game never calls back into the registry; it talks to its members only
//! through their [`Outbox`]es and reports everything else in return values.

use crate::action_queue::{PlayerActionQueue, QueueStats};
use crate::config::ServerConfig;
use crate::error::{
    CloseGameError, DropGameError, GameChatError, GameDataError, GameDataErrorKind,
    JoinGameError, KickError, QuitGameError, ReadyError, StartGameError,
};
use crate::user::Outbox;
use log::{debug, info, warn};
use netplay_shared::{
    ConnectionType, GameId, GameStatus, GameSummary, Message, PlayerSummary, UserId,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const SERVER_NAME: &str = "server";

const MAX_SLOTS: usize = u8::MAX as usize;

#[derive(Debug, Clone)]
pub struct GameSettings {
    pub max_users: u8,
    pub max_ping: u32,
    pub same_delay: bool,
    pub allow_single_player: bool,
    pub buffer_size: usize,
    pub desync_timeouts: usize,
    pub max_stall_timeouts: u32,
    pub game_timeout: Duration,
    pub small_lag_threshold: Duration,
    pub large_lag_threshold: Duration,
    pub max_chat_length: usize,
}

impl GameSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_users: config.game_max_users,
            max_ping: config.max_ping,
            same_delay: config.same_delay,
            allow_single_player: config.allow_single_player,
            buffer_size: config.game_buffer_size,
            desync_timeouts: config.desync_timeouts,
            max_stall_timeouts: config.max_stall_timeouts,
            game_timeout: config.game_timeout(),
            small_lag_threshold: config.small_lag_threshold(),
            large_lag_threshold: config.large_lag_threshold(),
            max_chat_length: config.max_chat_length,
        }
    }
}

/// Snapshot of the user data a game needs about one player.
#[derive(Debug, Clone)]
pub struct PlayerInfo {
    pub user_id: UserId,
    pub name: String,
    pub ping: u32,
    pub connection_type: ConnectionType,
    pub outbox: Outbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Waiting,
    Synchronizing,
    Ready,
    Playing,
    /// Still a member but out of the action exchange.
    Dropped,
    /// Quit or kicked; the slot only reserves its player number.
    Left,
}

impl SlotState {
    pub fn is_member(self) -> bool {
        self != SlotState::Left
    }
}

#[derive(Debug)]
struct Slot {
    player_number: u8,
    player: PlayerInfo,
    state: SlotState,
    frame_delay: u8,
    /// Arrival time of every message still waiting for its response.
    owed: VecDeque<Instant>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuitOutcome {
    pub closed: bool,
    pub new_owner: Option<UserId>,
    pub returned_to_waiting: bool,
}

/// Frames of input delay for a player with the given ping and link quality.
pub fn frame_delay(ping: u32, connection_type: ConnectionType) -> u8 {
    let delay = u64::from(ping) * 60 / 1000 / connection_type.actions_per_message() as u64 + 1;
    delay.min(u64::from(u8::MAX)) as u8
}

#[derive(Debug)]
pub struct Game {
    id: GameId,
    rom_name: String,
    owner: UserId,
    status: GameStatus,
    slots: Vec<Slot>,
    queues: Vec<Option<PlayerActionQueue>>,
    bytes_per_action: Option<usize>,
    settings: GameSettings,
}

impl Game {
    /// Creates a waiting game with `owner` as player 1.
    pub fn new(id: GameId, rom_name: String, owner: PlayerInfo, settings: GameSettings) -> Self {
        let owner_id = owner.user_id;
        let mut game = Self {
            id,
            rom_name,
            owner: owner_id,
            status: GameStatus::Waiting,
            slots: Vec::new(),
            queues: Vec::new(),
            bytes_per_action: None,
            settings,
        };
        game.admit(owner);
        info!("Game {} created by user {}: {}", id, owner_id, game.rom_name);
        game
    }

    pub fn id(&self) -> GameId {
        self.id
    }

    pub fn rom_name(&self) -> &str {
        &self.rom_name
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    fn slot_index(&self, user_id: UserId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.state.is_member() && slot.player.user_id == user_id)
    }

    fn members(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|slot| slot.state.is_member())
    }

    pub fn member_count(&self) -> usize {
        self.members().count()
    }

    pub fn member_ids(&self) -> Vec<UserId> {
        self.members().map(|slot| slot.player.user_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.slot_index(user_id).is_some()
    }

    pub fn player_number(&self, user_id: UserId) -> Option<u8> {
        self.slot_index(user_id)
            .map(|index| self.slots[index].player_number)
    }

    pub fn slot_state(&self, player_number: u8) -> Option<SlotState> {
        let index = usize::from(player_number).checked_sub(1)?;
        self.slots.get(index).map(|slot| slot.state)
    }

    pub fn frame_delay_of(&self, user_id: UserId) -> Option<u8> {
        self.slot_index(user_id)
            .map(|index| self.slots[index].frame_delay)
    }

    /// Lobby view of the game.
    pub fn summary(&self) -> GameSummary {
        let owner = self
            .slot_index(self.owner)
            .map(|index| self.slots[index].player.name.clone())
            .unwrap_or_default();
        GameSummary {
            game_id: self.id,
            rom_name: self.rom_name.clone(),
            owner,
            status: self.status,
            num_players: self.member_count() as u8,
            max_users: self.settings.max_users,
        }
    }

    fn player_summary(slot: &Slot) -> PlayerSummary {
        PlayerSummary {
            user_id: slot.player.user_id,
            username: slot.player.name.clone(),
            ping: slot.player.ping,
            connection_type: slot.player.connection_type,
            player_number: slot.player_number,
        }
    }

    pub fn players(&self) -> Vec<PlayerSummary> {
        self.members().map(Self::player_summary).collect()
    }

    /// Per-player queue positions, for the admin view and stall diagnosis.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queues.iter().flatten().map(|q| q.stats()).collect()
    }

    fn broadcast(&self, message: Message) {
        for slot in self.members() {
            slot.player.outbox.send(message.clone());
        }
    }

    fn info(&self, message: String) {
        self.broadcast(Message::InformationMessage {
            source: SERVER_NAME.to_string(),
            message,
        });
    }

    fn admit(&mut self, player: PlayerInfo) -> u8 {
        let player_number = self.slots.len() as u8 + 1;
        player.outbox.send(Message::PlayerInformation {
            players: self.players(),
        });
        self.slots.push(Slot {
            player_number,
            player,
            state: SlotState::Waiting,
            frame_delay: 1,
            owed: VecDeque::new(),
        });
        let joined = Self::player_summary(&self.slots[self.slots.len() - 1]);
        self.broadcast(Message::PlayerJoined {
            game_id: self.id,
            player: joined,
        });
        player_number
    }

    /// Seats `player` in the first free slot of a waiting game.
    ///
    /// The newcomer gets `PlayerInformation` listing who is already there,
    /// then every member gets `PlayerJoined`.
    pub fn join(&mut self, player: PlayerInfo) -> Result<u8, JoinGameError> {
        if self.contains(player.user_id) {
            return Err(JoinGameError::AlreadyInGame);
        }
        if self.status != GameStatus::Waiting {
            return Err(JoinGameError::GameInProgress);
        }
        if self.member_count() >= usize::from(self.settings.max_users)
            || self.slots.len() >= MAX_SLOTS
        {
            return Err(JoinGameError::GameFull);
        }
        if player.ping > self.settings.max_ping {
            return Err(JoinGameError::PingTooHigh {
                ping: player.ping,
                max: self.settings.max_ping,
            });
        }
        let user_id = player.user_id;
        let player_number = self.admit(player);
        info!(
            "Game {}: user {} joined as player {}",
            self.id, user_id, player_number
        );
        Ok(player_number)
    }

    /// Owner-only. Moves a waiting game to synchronizing, works out every
    /// player's frame delay and sends each one a `StartGameNotification`.
    pub fn start(&mut self, user_id: UserId) -> Result<(), StartGameError> {
        self.slot_index(user_id).ok_or(StartGameError::NotInGame)?;
        if self.owner != user_id {
            return Err(StartGameError::NotOwner);
        }
        if self.status != GameStatus::Waiting {
            return Err(StartGameError::NotWaiting);
        }
        if self.member_count() < 2 && !self.settings.allow_single_player {
            return Err(StartGameError::NotEnoughPlayers);
        }

        for slot in self.slots.iter_mut().filter(|s| s.state.is_member()) {
            slot.frame_delay = frame_delay(slot.player.ping, slot.player.connection_type);
        }
        if self.settings.same_delay {
            let max = self.members().map(|s| s.frame_delay).max().unwrap_or(1);
            for slot in self.slots.iter_mut() {
                slot.frame_delay = max;
            }
        }

        let width = self.slots.len();
        let mut queues = Vec::with_capacity(width);
        for slot in &self.slots {
            if !slot.state.is_member() {
                queues.push(None);
                continue;
            }
            let mut queue = PlayerActionQueue::new(
                slot.player_number,
                width,
                self.settings.buffer_size,
                self.settings.small_lag_threshold,
                self.settings.large_lag_threshold,
            );
            for other in self.slots.iter().filter(|s| !s.state.is_member()) {
                queue.remove_consumer(other.player_number);
            }
            queues.push(Some(queue));
        }
        self.queues = queues;
        self.bytes_per_action = None;
        self.status = GameStatus::Synchronizing;

        for slot in self.slots.iter_mut().filter(|s| s.state.is_member()) {
            slot.state = SlotState::Synchronizing;
            slot.owed.clear();
            slot.player.outbox.send(Message::StartGameNotification {
                player_number: slot.player_number,
                num_players: width as u8,
                frame_delay: slot.frame_delay,
            });
        }
        info!(
            "Game {} synchronizing with {} players",
            self.id,
            self.member_count()
        );
        Ok(())
    }

    /// Marks a player ready; returns true when this made the game start.
    pub fn ready(&mut self, user_id: UserId, player_number: u8) -> Result<bool, ReadyError> {
        let index = self.slot_index(user_id).ok_or(ReadyError::NotInGame)?;
        if self.status != GameStatus::Synchronizing {
            return Err(ReadyError::NotSynchronizing);
        }
        if self.slots[index].player_number != player_number {
            return Err(ReadyError::WrongPlayerNumber(player_number));
        }
        self.slots[index].state = SlotState::Ready;

        if !self.members().all(|slot| slot.state == SlotState::Ready) {
            return Ok(false);
        }
        for slot in self.slots.iter_mut().filter(|s| s.state.is_member()) {
            slot.state = SlotState::Playing;
        }
        self.status = GameStatus::Playing;
        self.broadcast(Message::AllReadyNotification);
        info!("Game {} is playing", self.id);
        Ok(true)
    }

    /// Reverts a synchronizing game to waiting. No-op in any other state.
    pub fn abort_start(&mut self, reason: &str) -> bool {
        if self.status != GameStatus::Synchronizing {
            return false;
        }
        self.reset_to_waiting();
        self.info(format!("Game start cancelled: {reason}"));
        info!("Game {} start cancelled: {}", self.id, reason);
        true
    }

    fn reset_to_waiting(&mut self) {
        self.status = GameStatus::Waiting;
        self.queues.clear();
        self.bytes_per_action = None;
        for slot in self.slots.iter_mut().filter(|s| s.state.is_member()) {
            slot.state = SlotState::Waiting;
            slot.owed.clear();
        }
    }

    /// Buffers one frame of `user_id`'s inputs and sends every combined
    /// block that became complete.
    ///
    /// A frame from a dropped slot or of the wrong length comes back as an
    /// error carrying a zero-filled reply so the client can keep stepping.
    pub fn add_data(
        &mut self,
        user_id: UserId,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<(), GameDataError> {
        let index = self
            .slot_index(user_id)
            .ok_or(GameDataError::new(GameDataErrorKind::NotInGame))?;
        if self.status != GameStatus::Playing {
            return Err(GameDataError::new(GameDataErrorKind::NotPlaying));
        }
        if self.slots[index].state != SlotState::Playing {
            return Err(self.data_error(index, GameDataErrorKind::SlotNotPlaying, &data));
        }

        let actions = self.slots[index].player.connection_type.actions_per_message();
        if data.is_empty() || data.len() % actions != 0 {
            return Err(self.data_error(index, GameDataErrorKind::InvalidLength, &data));
        }
        let per_action = data.len() / actions;
        match self.bytes_per_action {
            None => self.bytes_per_action = Some(per_action),
            Some(expected) if expected != per_action => {
                return Err(self.data_error(index, GameDataErrorKind::InvalidLength, &data));
            }
            Some(_) => {}
        }

        let written = match self.queues.get_mut(index).and_then(Option::as_mut) {
            Some(queue) => queue.add_actions(&data, now),
            None => return Err(GameDataError::new(GameDataErrorKind::SlotNotPlaying)),
        };
        if let Err(e) = written {
            debug!("Game {}: player {} {}", self.id, index + 1, e);
            return Err(self.data_error(index, GameDataErrorKind::BufferOverrun, &data));
        }

        self.slots[index].owed.push_back(now);
        self.flush_responses();
        self.drop_desynced_consumers();
        Ok(())
    }

    /// Zero-filled response shaped for the caller, with its own bytes at its
    /// column of every action.
    fn data_error(&self, index: usize, kind: GameDataErrorKind, data: &[u8]) -> GameDataError {
        let Some(per_action) = self.bytes_per_action else {
            return GameDataError::new(kind);
        };
        let width = self.slots.len();
        let actions = self.slots[index].player.connection_type.actions_per_message();
        let offset = index * per_action;

        let mut response = vec![0u8; actions * width * per_action];
        for action in 0..actions {
            let start = action * per_action;
            if start >= data.len() {
                break;
            }
            let own = &data[start..(start + per_action).min(data.len())];
            let at = action * width * per_action + offset;
            response[at..at + own.len()].copy_from_slice(own);
        }
        GameDataError { kind, response }
    }

    fn sources_ready(&self, consumer: u8, need: usize) -> bool {
        self.slots
            .iter()
            .zip(&self.queues)
            .filter(|(slot, _)| slot.state == SlotState::Playing)
            .all(|(_, queue)| queue.as_ref().map_or(true, |q| q.available(consumer) >= need))
    }

    /// Sends every response that can be composed right now.
    fn flush_responses(&mut self) {
        let Some(per_action) = self.bytes_per_action else {
            return;
        };
        let width = self.slots.len();

        for consumer in 0..width {
            if self.slots[consumer].state != SlotState::Playing {
                continue;
            }
            let number = self.slots[consumer].player_number;
            let actions = self.slots[consumer]
                .player
                .connection_type
                .actions_per_message();
            let need = actions * per_action;

            while !self.slots[consumer].owed.is_empty() && self.sources_ready(number, need) {
                let mut columns = Vec::with_capacity(width);
                for source in 0..width {
                    let column = if self.slots[source].state == SlotState::Playing {
                        self.queues
                            .get_mut(source)
                            .and_then(Option::as_mut)
                            .and_then(|q| q.read(number, need))
                    } else {
                        None
                    };
                    columns.push(column);
                }

                let mut block = Vec::with_capacity(need * width);
                for action in 0..actions {
                    let range = action * per_action..(action + 1) * per_action;
                    for column in &columns {
                        match column {
                            Some(bytes) => block.extend_from_slice(&bytes[range.clone()]),
                            None => block.resize(block.len() + per_action, 0),
                        }
                    }
                }
                self.slots[consumer].owed.pop_front();
                self.slots[consumer]
                    .player
                    .outbox
                    .send(Message::GameData { data: block });
            }
        }
    }

    /// Drops consumers that stopped asking for data while sources kept
    /// writing past `desync_timeouts` actions.
    fn drop_desynced_consumers(&mut self) -> Vec<u8> {
        let Some(per_action) = self.bytes_per_action else {
            return Vec::new();
        };
        let max_unread = self.settings.desync_timeouts * per_action;

        let mut lagging: Vec<u8> = self
            .slots
            .iter()
            .zip(&self.queues)
            .filter(|(slot, _)| slot.state == SlotState::Playing)
            .filter_map(|(_, queue)| queue.as_ref())
            .flat_map(|queue| queue.lagging_consumers(max_unread))
            .filter(|number| {
                self.slot_state(*number) == Some(SlotState::Playing)
                    && self.slots[usize::from(*number) - 1].owed.is_empty()
            })
            .collect();
        lagging.sort_unstable();
        lagging.dedup();

        for number in &lagging {
            warn!("Game {}: player {} desynchronized", self.id, number);
            self.drop_slot(usize::from(*number) - 1, "desynchronized");
        }
        lagging
    }

    /// Takes a playing slot out of the exchange. Returns true if nobody is
    /// left playing and the game went back to waiting.
    fn drop_slot(&mut self, index: usize, reason: &str) -> bool {
        if self.slots[index].state != SlotState::Playing {
            return false;
        }
        let slot = &mut self.slots[index];
        slot.state = SlotState::Dropped;
        slot.owed.clear();
        let number = slot.player_number;
        let username = slot.player.name.clone();

        for queue in self.queues.iter_mut().flatten() {
            queue.remove_consumer(number);
        }
        info!(
            "Game {}: player {} ({}) dropped: {}",
            self.id, number, username, reason
        );
        self.broadcast(Message::PlayerDropped {
            username,
            player_number: number,
        });

        if !self.slots.iter().any(|s| s.state == SlotState::Playing) {
            self.reset_to_waiting();
            info!("Game {}: no players left, back to waiting", self.id);
            return true;
        }
        self.flush_responses();
        false
    }

    /// Resends the caller's last combined block; returns its length.
    pub fn dropped_packet(&mut self, user_id: UserId) -> Result<u32, DropGameError> {
        let index = self.slot_index(user_id).ok_or(DropGameError::NotInGame)?;
        if self.status != GameStatus::Playing {
            return Err(DropGameError::NotPlaying);
        }
        let count = self
            .queues
            .get_mut(index)
            .and_then(Option::as_mut)
            .map(|q| q.record_drop())
            .ok_or(DropGameError::NotPlaying)?;
        debug!(
            "Game {}: player {} reported dropped packet #{}",
            self.id,
            index + 1,
            count
        );
        Ok(count)
    }

    /// Leaves the action exchange; returns true if the game went back to
    /// waiting.
    pub fn drop_player(&mut self, user_id: UserId) -> Result<bool, DropGameError> {
        let index = self.slot_index(user_id).ok_or(DropGameError::NotInGame)?;
        if self.status != GameStatus::Playing {
            return Err(DropGameError::NotPlaying);
        }
        if self.slots[index].state != SlotState::Playing {
            return Err(DropGameError::AlreadyDropped);
        }
        Ok(self.drop_slot(index, "dropped"))
    }

    fn remove_member(&mut self, index: usize) -> QuitOutcome {
        let mut outcome = QuitOutcome::default();
        match self.status {
            GameStatus::Playing => {
                outcome.returned_to_waiting = self.drop_slot(index, "left the game");
            }
            GameStatus::Synchronizing => {
                outcome.returned_to_waiting = self.abort_start("a player left");
            }
            GameStatus::Waiting => {}
        }

        let user_id = self.slots[index].player.user_id;
        self.broadcast(Message::PlayerQuit {
            user_id,
            username: self.slots[index].player.name.clone(),
        });

        let number = self.slots[index].player_number;
        self.slots[index].state = SlotState::Left;
        self.slots[index].owed.clear();
        for queue in self.queues.iter_mut().flatten() {
            queue.remove_consumer(number);
        }

        if self.is_empty() {
            outcome.closed = true;
            info!("Game {}: last player left", self.id);
            return outcome;
        }
        if self.owner == user_id {
            let next = self
                .members()
                .next()
                .map(|slot| (slot.player.user_id, slot.player.name.clone()));
            if let Some((next_id, next_name)) = next {
                self.owner = next_id;
                outcome.new_owner = Some(next_id);
                self.info(format!("{next_name} now owns the game"));
                info!("Game {}: ownership passed to user {}", self.id, next_id);
            }
        }
        outcome
    }

    /// Removes a member, handing ownership on if the owner left.
    pub fn quit(&mut self, user_id: UserId) -> Result<QuitOutcome, QuitGameError> {
        let index = self.slot_index(user_id).ok_or(QuitGameError::NotInGame)?;
        info!("Game {}: user {} quit", self.id, user_id);
        Ok(self.remove_member(index))
    }

    /// Removes `target` on behalf of the owner or an admin member.
    pub fn kick(
        &mut self,
        requester: UserId,
        requester_is_admin: bool,
        target: UserId,
    ) -> Result<QuitOutcome, KickError> {
        self.slot_index(requester).ok_or(KickError::NotInGame)?;
        if requester != self.owner && !requester_is_admin {
            return Err(KickError::NotOwner);
        }
        if requester == target {
            return Err(KickError::CannotKickSelf);
        }
        let index = self.slot_index(target).ok_or(KickError::NoSuchPlayer)?;
        self.slots[index]
            .player
            .outbox
            .send(Message::InformationMessage {
                source: SERVER_NAME.to_string(),
                message: "You have been kicked from the game".to_string(),
            });
        info!("Game {}: user {} kicked user {}", self.id, requester, target);
        Ok(self.remove_member(index))
    }

    /// Empties the game; returns the users that were still members.
    pub fn close(
        &mut self,
        requester: UserId,
        requester_is_admin: bool,
    ) -> Result<Vec<UserId>, CloseGameError> {
        if requester != self.owner && !requester_is_admin {
            return Err(CloseGameError::NotOwner);
        }
        let members = self.member_ids();
        for slot in self.slots.iter_mut() {
            slot.state = SlotState::Left;
            slot.owed.clear();
        }
        self.queues.clear();
        info!("Game {} closed by user {}", self.id, requester);
        Ok(members)
    }

    /// Relays a chat line to every member.
    pub fn chat(&self, user_id: UserId, message: String) -> Result<(), GameChatError> {
        let index = self.slot_index(user_id).ok_or(GameChatError::NotInGame)?;
        if message.trim().is_empty() {
            return Err(GameChatError::Empty);
        }
        let len = message.chars().count();
        if len > self.settings.max_chat_length {
            return Err(GameChatError::TooLong {
                len,
                max: self.settings.max_chat_length,
            });
        }
        self.broadcast(Message::GameChatNotification {
            username: self.slots[index].player.name.clone(),
            message,
        });
        Ok(())
    }

    /// Server line in the game chat.
    pub fn announce(&self, message: &str) {
        self.broadcast(Message::GameChatNotification {
            username: SERVER_NAME.to_string(),
            message: message.to_string(),
        });
    }

    /// Counts a stall against every source that has kept a consumer waiting
    /// longer than `game_timeout`, dropping sources that stalled too often.
    /// Returns the player numbers dropped.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<u8> {
        if self.status != GameStatus::Playing {
            return Vec::new();
        }
        let Some(per_action) = self.bytes_per_action else {
            return Vec::new();
        };

        let mut stalled = Vec::new();
        for consumer in 0..self.slots.len() {
            let slot = &self.slots[consumer];
            if slot.state != SlotState::Playing {
                continue;
            }
            let Some(since) = slot.owed.front().copied() else {
                continue;
            };
            if now.saturating_duration_since(since) < self.settings.game_timeout {
                continue;
            }
            let number = slot.player_number;
            let need = slot.player.connection_type.actions_per_message() * per_action;
            for (source, (source_slot, queue)) in self.slots.iter().zip(&self.queues).enumerate()
            {
                let blocking = source_slot.state == SlotState::Playing
                    && queue.as_ref().is_some_and(|q| q.available(number) < need);
                if blocking {
                    stalled.push(source);
                }
            }
            if let Some(front) = self.slots[consumer].owed.front_mut() {
                *front = now;
            }
        }
        stalled.sort_unstable();
        stalled.dedup();

        let mut dropped = Vec::new();
        for source in stalled {
            let count = match self.queues.get_mut(source).and_then(Option::as_mut) {
                Some(queue) => queue.record_timeout(),
                None => continue,
            };
            warn!(
                "Game {}: player {} stalled ({} of {})",
                self.id,
                source + 1,
                count,
                self.settings.max_stall_timeouts
            );
            if count >= self.settings.max_stall_timeouts
                && self.slots[source].state == SlotState::Playing
            {
                dropped.push(self.slots[source].player_number);
                self.drop_slot(source, "timed out");
            }
        }
        dropped
    }
}
