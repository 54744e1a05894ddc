//! Logged-in users and the channel into their session.

use crate::access::AccessLevel;
use netplay_shared::{ConnectionType, GameId, Message, UserId, UserStatus, UserSummary};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Work handed from the registry or a game to a client session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Message),
    /// Ask the session to say goodbye and terminate.
    Close(String),
}

/// Sending half of a session's outbound queue. Sends never block and are
/// silently dropped once the session is gone.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: Message) {
        let _ = self.tx.send(Outbound::Message(message));
    }

    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close(reason.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy)]
struct ActivityTimes {
    keep_alive: Instant,
    activity: Instant,
}

/// When a user was last heard from.
///
/// Every inbound datagram updates these, so they sit behind their own lock
/// and can be written while the registry tables are only read-locked.
#[derive(Debug)]
pub struct Activity {
    times: Mutex<ActivityTimes>,
}

impl Activity {
    pub fn new(now: Instant) -> Self {
        Self {
            times: Mutex::new(ActivityTimes {
                keep_alive: now,
                activity: now,
            }),
        }
    }

    fn times(&self) -> MutexGuard<'_, ActivityTimes> {
        self.times.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Any traffic proves the client alive; only non keep-alive traffic
    /// counts as activity for the idle timeout.
    pub fn record(&self, keep_alive_only: bool, now: Instant) {
        let mut times = self.times();
        times.keep_alive = now;
        if !keep_alive_only {
            times.activity = now;
        }
    }

    pub fn last_keep_alive(&self) -> Instant {
        self.times().keep_alive
    }

    pub fn last_activity(&self) -> Instant {
        self.times().activity
    }
}

impl Clone for Activity {
    fn clone(&self) -> Self {
        Self {
            times: Mutex::new(*self.times()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub client_type: String,
    pub status: UserStatus,
    pub connection_type: ConnectionType,
    pub ping: u32,
    pub address: SocketAddr,
    pub access: AccessLevel,
    pub game: Option<GameId>,
    pub activity: Activity,
    pub last_chat: Option<Instant>,
    pub last_create_game: Option<Instant>,
    pub muted: bool,
    pub ignoring_broadcasts: bool,
    /// Peer-to-peer mode: the user only wants traffic about its own game.
    pub p2p: bool,
    pub outbox: Outbox,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.access == AccessLevel::Admin
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.id,
            username: self.name.clone(),
            ping: self.ping,
            status: self.status,
            connection_type: self.connection_type,
        }
    }

    pub fn send(&self, message: Message) {
        self.outbox.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_delivers_in_order() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.send(Message::KeepAlive);
        outbox.close("bye");

        assert_eq!(rx.recv().await, Some(Outbound::Message(Message::KeepAlive)));
        assert_eq!(rx.recv().await, Some(Outbound::Close("bye".to_string())));
    }

    #[test]
    fn test_keep_alive_is_not_activity() {
        let start = Instant::now();
        let activity = Activity::new(start);
        let later = start + std::time::Duration::from_secs(5);

        activity.record(true, later);
        assert_eq!(activity.last_keep_alive(), later);
        assert_eq!(activity.last_activity(), start);

        activity.record(false, later);
        assert_eq!(activity.last_activity(), later);
    }

    #[test]
    fn test_outbox_ignores_closed_session() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        assert!(outbox.is_closed());
        outbox.send(Message::KeepAlive);
    }
}
