//! One logged-in (or logging-in) client on its own UDP port.
//!
//! A session task owns its socket and both sequencing windows. Inbound
//! bundles are acknowledged, reordered and dispatched to the registry;
//! anything the registry or a game wants to tell this client arrives through
//! the session's [`Outbox`] and is bundled on the next flush. Errors from
//! registry and game operations are turned into protocol replies here and
//! never end the session.

use crate::client_manager::ManagerStats;
use crate::game::SERVER_NAME;
use crate::registry::{LoginRequest, ServerRegistry};
use crate::user::{Outbound, Outbox};
use log::{debug, info, warn};
use netplay_shared::{
    chunk_messages, Bundle, ConnectionType, Message, ReceiveWindow, Received, SendWindow, UserId,
    MAX_DATAGRAM_SIZE,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// Reason a session ended, reported to the registry as the quit message.
type Disconnect = String;

struct PingCheck {
    username: String,
    client_type: String,
    connection_type: ConnectionType,
    sent_at: Instant,
    samples: Vec<Duration>,
}

enum SessionState {
    AwaitingLogin,
    /// Measuring round trips with ServerAck/ClientAck before logging in.
    MeasuringPing(PingCheck),
    LoggedIn(UserId),
}

pub(crate) struct ClientSession {
    port: u16,
    socket: UdpSocket,
    allocated_ip: IpAddr,
    peer: Option<SocketAddr>,
    registry: Arc<ServerRegistry>,
    stats: Arc<ManagerStats>,
    send_window: SendWindow,
    receive_window: ReceiveWindow,
    state: SessionState,
    outbox: Outbox,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: watch::Receiver<bool>,
    pending: Vec<Message>,
    ack_owed: bool,
    last_heard: Instant,
}

/// Mean of the ping round trips in whole milliseconds.
fn mean_ping(samples: &[Duration]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let total: Duration = samples.iter().sum();
    let mean = total / samples.len() as u32;
    u32::try_from(mean.as_millis()).unwrap_or(u32::MAX)
}

impl ClientSession {
    pub(crate) fn new(
        socket: UdpSocket,
        allocated_ip: IpAddr,
        registry: Arc<ServerRegistry>,
        stats: Arc<ManagerStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
        let config = registry.config();
        let send_window = SendWindow::new(config.session_buffer_size, config.resend_interval());
        let receive_window = ReceiveWindow::new(config.session_buffer_size);
        let (outbox, outbound) = Outbox::channel();
        Self {
            port,
            socket,
            allocated_ip,
            peer: None,
            registry,
            stats,
            send_window,
            receive_window,
            state: SessionState::AwaitingLogin,
            outbox,
            outbound,
            shutdown,
            pending: Vec::new(),
            ack_owed: false,
            last_heard: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut ticker = tokio::time::interval(self.registry.config().resend_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Session on port {} waiting for {}", self.port, self.allocated_ip);

        let reason = loop {
            let result = tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                    Err(e) => {
                        warn!("Session on port {}: receive error: {}", self.port, e);
                        Ok(())
                    }
                },
                Some(outbound) = self.outbound.recv() => self.queue_outbound(outbound),
                _ = ticker.tick() => self.tick(),
                _ = self.shutdown.changed() => {
                    self.info("Server is shutting down");
                    Err("server shutdown".to_string())
                }
            };
            if let Err(reason) = result {
                break reason;
            }
            if let Err(reason) = self.flush().await {
                break reason;
            }
        };
        self.close(reason).await;
    }

    async fn close(mut self, reason: Disconnect) {
        if let SessionState::LoggedIn(user_id) = self.state {
            self.registry.quit(user_id, &reason).await;
        }
        // drain whatever the quit produced for us
        while let Ok(Outbound::Message(message)) = self.outbound.try_recv() {
            self.pending.push(message);
        }
        if let Err(e) = self.flush().await {
            debug!("Session on port {}: final flush failed: {}", self.port, e);
        }
        info!("Session on port {} closed: {}", self.port, reason);
    }

    /// Queues `first` and everything else already waiting, so a burst goes
    /// out in as few bundles as possible.
    fn queue_outbound(&mut self, first: Outbound) -> Result<(), Disconnect> {
        let mut next = Some(first);
        while let Some(outbound) = next {
            match outbound {
                Outbound::Message(message) => self.pending.push(message),
                Outbound::Close(reason) => {
                    self.info(&reason);
                    return Err(reason);
                }
            }
            next = self.outbound.try_recv().ok();
        }
        Ok(())
    }

    fn info(&mut self, message: impl Into<String>) {
        self.pending.push(Message::InformationMessage {
            source: SERVER_NAME.to_string(),
            message: message.into(),
        });
    }

    /// Resends overdue bundles and expires sessions that never logged in.
    fn tick(&mut self) -> Result<(), Disconnect> {
        let now = Instant::now();
        if !matches!(self.state, SessionState::LoggedIn(_))
            && now.saturating_duration_since(self.last_heard)
                > self.registry.config().keep_alive_timeout()
        {
            return Err("login timeout".to_string());
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Result<(), Disconnect> {
        if from.ip() != self.allocated_ip {
            self.stats.foreign_packets.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Session on port {}: dropped datagram from foreign address {}",
                self.port, from
            );
            return Ok(());
        }
        let bundle = match Bundle::decode(bytes) {
            Ok(bundle) => bundle,
            Err(e) => {
                self.stats.frame_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Session on port {}: bad bundle from {}: {}", self.port, from, e);
                return Ok(());
            }
        };
        self.peer = Some(from);
        let now = Instant::now();
        self.last_heard = now;

        self.send_window
            .acknowledge(bundle.ack)
            .map_err(|e| format!("protocol error: {e}"))?;

        match self.receive_window.accept(bundle) {
            Received::Delivered(messages) => {
                self.ack_owed = true;
                for message in messages {
                    self.dispatch(message, now).await?;
                }
            }
            Received::Duplicate | Received::Buffered => self.ack_owed = true,
            Received::OutOfWindow => {
                self.stats.frame_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Session on port {}: bundle outside the receive window", self.port);
            }
            Received::AckOnly => {}
        }
        Ok(())
    }

    async fn dispatch(&mut self, message: Message, now: Instant) -> Result<(), Disconnect> {
        match &mut self.state {
            SessionState::AwaitingLogin => match message {
                Message::UserInformation {
                    username,
                    client_type,
                    connection_type,
                } => {
                    debug!(
                        "Session on port {}: login request from {:?} ({})",
                        self.port, username, client_type
                    );
                    self.state = SessionState::MeasuringPing(PingCheck {
                        username,
                        client_type,
                        connection_type,
                        sent_at: now,
                        samples: Vec::new(),
                    });
                    self.pending.push(Message::ServerAck);
                }
                Message::Quit { message } => return Err(message),
                other => debug!(
                    "Session on port {}: ignoring {:?} before login",
                    self.port, other
                ),
            },
            SessionState::MeasuringPing(check) => match message {
                Message::ClientAck => {
                    check.samples.push(now.saturating_duration_since(check.sent_at));
                    if check.samples.len() < self.registry.config().ping_rounds.max(1) {
                        check.sent_at = now;
                        self.pending.push(Message::ServerAck);
                    } else {
                        self.login().await?;
                    }
                }
                Message::Quit { message } => return Err(message),
                other => debug!(
                    "Session on port {}: ignoring {:?} while measuring ping",
                    self.port, other
                ),
            },
            SessionState::LoggedIn(user_id) => {
                let user_id = *user_id;
                self.registry
                    .touch(user_id, message.is_keep_alive(), now)
                    .await;
                self.handle_user_message(user_id, message, now).await?;
            }
        }
        Ok(())
    }

    async fn login(&mut self) -> Result<(), Disconnect> {
        let state = std::mem::replace(&mut self.state, SessionState::AwaitingLogin);
        let SessionState::MeasuringPing(check) = state else {
            self.state = state;
            return Ok(());
        };
        let Some(address) = self.peer else {
            return Err("login without a peer address".to_string());
        };
        let ping = mean_ping(&check.samples);
        let request = LoginRequest {
            username: check.username.clone(),
            client_type: check.client_type,
            connection_type: check.connection_type,
            ping,
            address,
            allocated_ip: self.allocated_ip,
            outbox: self.outbox.clone(),
        };
        match self.registry.login(request).await {
            Ok(user_id) => {
                self.state = SessionState::LoggedIn(user_id);
                Ok(())
            }
            Err(e) => {
                info!(
                    "Session on port {}: login of {:?} rejected: {}",
                    self.port, check.username, e
                );
                let reason = e.to_string();
                self.pending.push(Message::ConnectionRejected {
                    username: check.username,
                    reason: reason.clone(),
                });
                Err(reason)
            }
        }
    }

    async fn handle_user_message(
        &mut self,
        user_id: UserId,
        message: Message,
        now: Instant,
    ) -> Result<(), Disconnect> {
        let registry = Arc::clone(&self.registry);
        let outcome: Result<(), String> = match message {
            Message::KeepAlive | Message::ClientAck => Ok(()),
            Message::Quit { message } => return Err(message),
            Message::Chat { message } => registry
                .chat(user_id, message, now)
                .await
                .map_err(|e| e.to_string()),
            Message::CreateGame { rom_name } => registry
                .create_game(user_id, rom_name, now)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Message::JoinGame { game_id } => registry
                .join_game(user_id, game_id)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Message::QuitGame => registry
                .quit_game(user_id)
                .await
                .map_err(|e| e.to_string()),
            Message::CloseGame => registry
                .close_game(user_id)
                .await
                .map_err(|e| e.to_string()),
            Message::StartGame => registry
                .start_game(user_id)
                .await
                .map_err(|e| e.to_string()),
            Message::AllReady { player_number } => registry
                .ready(user_id, player_number)
                .await
                .map_err(|e| e.to_string()),
            Message::GameData { data } => match registry.game_data(user_id, data, now).await {
                Ok(()) => Ok(()),
                Err(e) if !e.response.is_empty() => {
                    debug!("Session on port {}: game data rejected: {}", self.port, e);
                    self.pending.push(Message::GameData { data: e.response });
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            },
            Message::GameChat { message } => registry
                .game_chat(user_id, message)
                .await
                .map_err(|e| e.to_string()),
            Message::GameKick { user_id: target } => registry
                .kick(user_id, target)
                .await
                .map_err(|e| e.to_string()),
            Message::PlayerDrop => registry
                .drop_game(user_id)
                .await
                .map_err(|e| e.to_string()),
            Message::DroppedPacket => registry
                .dropped_packet(user_id)
                .await
                .map_err(|e| e.to_string()),
            other => {
                debug!(
                    "Session on port {}: unexpected {:?} from user {}",
                    self.port, other, user_id
                );
                Ok(())
            }
        };
        if let Err(denial) = outcome {
            debug!("Session on port {}: user {}: {}", self.port, user_id, denial);
            self.info(denial);
        }
        Ok(())
    }

    /// Sends queued messages, overdue resends and owed acknowledgements.
    async fn flush(&mut self) -> Result<(), Disconnect> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let now = Instant::now().into_std();
        let ack = self.receive_window.ack();

        let resends = self.send_window.due_for_resend(ack, now);
        if !resends.is_empty() {
            self.stats
                .resends
                .fetch_add(resends.len() as u64, Ordering::Relaxed);
            debug!(
                "Session on port {}: resending {} bundles",
                self.port,
                resends.len()
            );
            for bundle in &resends {
                self.transmit(bundle, peer).await;
            }
        }

        if !self.pending.is_empty() {
            for chunk in chunk_messages(std::mem::take(&mut self.pending)) {
                let bundle = self
                    .send_window
                    .push(chunk, ack, now)
                    .map_err(|e| format!("unrecoverable session: {e}"))?;
                self.transmit(&bundle, peer).await;
            }
            self.ack_owed = false;
        } else if self.ack_owed {
            let bundle = self.send_window.ack_only(ack);
            self.transmit(&bundle, peer).await;
            self.ack_owed = false;
        }
        Ok(())
    }

    async fn transmit(&self, bundle: &Bundle, peer: SocketAddr) {
        let bytes = match bundle.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Session on port {}: dropping bundle {}: {}",
                    self.port, bundle.seq, e
                );
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, peer).await {
            warn!("Session on port {}: send to {} failed: {}", self.port, peer, e);
        }
    }
}
