//! Client side of the relay protocols.
//!
//! [`NetplayClient`] first talks to the rendezvous port with single
//! handshake frames (`PING`, `HELLO`). Once the server answers with a
//! session port, every request travels in sequenced bundles on that port:
//! the client keeps its own send and receive windows, acknowledges what it
//! got and resends what the server has not confirmed whenever it is waiting
//! for a reply. `ServerAck` pings sent during login are answered
//! automatically.
//!
//! Requests that the server answers only with a broadcast (create, join,
//! start) have a waiting variant that returns once the matching
//! notification arrives. Everything else is fire and forget.

use crate::game::ClientGameState;
use log::{debug, info, warn};
use netplay_shared::{
    Bundle, BundleError, ConnectionType, FrameError, GameId, HandshakeMessage, Message,
    ReceiveWindow, Received, SendWindow, UserId, WindowError, MAX_DATAGRAM_SIZE,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};

const WINDOW_SIZE: usize = 64;
const RESEND_INTERVAL: Duration = Duration::from_millis(100);
/// Client type announced in `UserInformation`.
pub const CLIENT_TYPE: &str = "netplay-client";

/// Errors surfaced by [`NetplayClient`].
///
/// Server-side refusals arrive as [`ClientError::Denied`] carrying the text
/// of the server's information message.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("server is full")]
    ServerFull,
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("server denied the request: {0}")]
    Denied(String),
    #[error("not connected to a session")]
    NotConnected,
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

/// Headless v086 client: rendezvous handshake, session bundling and the
/// lobby and game requests.
pub struct NetplayClient {
    socket: UdpSocket,
    server: SocketAddr,
    session: Option<SocketAddr>,
    send_window: SendWindow,
    receive_window: ReceiveWindow,
    inbox: VecDeque<Message>,
    fake_ping: Duration,
    state: ClientGameState,
}

impl NetplayClient {
    /// Binds a local socket for talking to the rendezvous port at `server`.
    ///
    /// Nothing is sent yet; call [`NetplayClient::hello`] or
    /// [`NetplayClient::join_server`] to get a session.
    pub async fn connect(server: SocketAddr) -> Result<Self, ClientError> {
        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            server,
            session: None,
            send_window: SendWindow::new(WINDOW_SIZE, RESEND_INTERVAL),
            receive_window: ReceiveWindow::new(WINDOW_SIZE),
            inbox: VecDeque::new(),
            fake_ping: Duration::ZERO,
            state: ClientGameState::new(),
        })
    }

    /// Delays every outgoing datagram by half of `fake_ping`.
    pub fn with_fake_ping(mut self, fake_ping: Duration) -> Self {
        self.fake_ping = fake_ping;
        self
    }

    /// Local address of the client socket.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Session address handed out by the last successful `HELLO`.
    pub fn session_addr(&self) -> Option<SocketAddr> {
        self.session
    }

    /// Lobby and game view built from the notifications seen so far.
    pub fn state(&self) -> &ClientGameState {
        &self.state
    }

    async fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> Result<(), ClientError> {
        if !self.fake_ping.is_zero() {
            sleep(self.fake_ping / 2).await;
        }
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }

    /// Sends one handshake frame and waits for the server's reply.
    pub async fn handshake(
        &self,
        message: &HandshakeMessage,
        timeout: Duration,
    ) -> Result<HandshakeMessage, ClientError> {
        self.send_raw(&message.encode(), self.server).await?;
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let deadline = Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buffer))
                .await
                .map_err(|_| ClientError::Timeout("handshake reply"))??;
            let (len, from) = received;
            if from != self.server {
                continue;
            }
            return Ok(HandshakeMessage::decode(&buffer[..len])?);
        }
    }

    /// Round trip of a PING on the rendezvous port.
    pub async fn ping_server(&self, timeout: Duration) -> Result<Duration, ClientError> {
        let started = Instant::now();
        match self.handshake(&HandshakeMessage::Ping, timeout).await? {
            HandshakeMessage::Pong => Ok(started.elapsed()),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Asks for a session and remembers its address.
    pub async fn hello(&mut self, protocol: &str, timeout: Duration) -> Result<u16, ClientError> {
        let request = HandshakeMessage::hello(protocol)?;
        match self.handshake(&request, timeout).await? {
            HandshakeMessage::HelloD00d { port } => {
                self.session = Some(SocketAddr::new(self.server.ip(), port));
                info!("Session port {}", port);
                Ok(port)
            }
            HandshakeMessage::TooManyUsers => Err(ClientError::ServerFull),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    async fn transmit(&self, bundle: &Bundle) -> Result<(), ClientError> {
        let session = self.session.ok_or(ClientError::NotConnected)?;
        self.send_raw(&bundle.encode()?, session).await
    }

    /// Sends `message` in a fresh bundle.
    pub async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        let ack = self.receive_window.ack();
        let bundle = self
            .send_window
            .push(vec![message], ack, Instant::now().into_std())?;
        self.transmit(&bundle).await
    }

    async fn resend_due(&mut self) -> Result<(), ClientError> {
        let ack = self.receive_window.ack();
        for bundle in self
            .send_window
            .due_for_resend(ack, Instant::now().into_std())
        {
            debug!("Resending bundle {}", bundle.seq);
            self.transmit(&bundle).await?;
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Result<(), ClientError> {
        if Some(from) != self.session {
            return Ok(());
        }
        let bundle = match Bundle::decode(bytes) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("Dropping malformed bundle: {}", e);
                return Ok(());
            }
        };
        self.send_window.acknowledge(bundle.ack)?;

        let delivered = match self.receive_window.accept(bundle) {
            Received::Delivered(messages) => messages,
            Received::Duplicate | Received::Buffered => Vec::new(),
            Received::OutOfWindow | Received::AckOnly => return Ok(()),
        };

        let mut replied = false;
        for message in delivered {
            self.state.apply(&message);
            if message == Message::ServerAck {
                self.send(Message::ClientAck).await?;
                replied = true;
            } else {
                self.inbox.push_back(message);
            }
        }
        if !replied {
            let bundle = self.send_window.ack_only(self.receive_window.ack());
            self.transmit(&bundle).await?;
        }
        Ok(())
    }

    /// Next message from the session, answering ServerAck pings on the way.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Message, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout("session message"));
            }
            let wait = (deadline - now).min(RESEND_INTERVAL);
            match tokio::time::timeout(wait, self.socket.recv_from(&mut buffer)).await {
                Ok(received) => {
                    let (len, from) = received?;
                    self.handle_datagram(&buffer[..len], from).await?;
                }
                Err(_) => self.resend_due().await?,
            }
        }
    }

    /// Skips messages until one matches `wanted`. A server information
    /// message arriving first is returned as [`ClientError::Denied`].
    pub async fn expect<F>(
        &mut self,
        timeout: Duration,
        what: &'static str,
        mut wanted: F,
    ) -> Result<Message, ClientError>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = self
                .recv(remaining)
                .await
                .map_err(|e| match e {
                    ClientError::Timeout(_) => ClientError::Timeout(what),
                    other => other,
                })?;
            if wanted(&message) {
                return Ok(message);
            }
            if let Message::InformationMessage { message, .. } = message {
                return Err(ClientError::Denied(message));
            }
            debug!("Skipping {:?} while waiting for {}", message, what);
        }
    }

    /// Logs in on the current session.
    ///
    /// The server measures our ping with `ServerAck` pings first; those are
    /// answered inside [`NetplayClient::recv`] while we wait for the reply.
    pub async fn login(
        &mut self,
        username: &str,
        connection_type: ConnectionType,
        timeout: Duration,
    ) -> Result<UserId, ClientError> {
        self.state.username = username.to_string();
        self.send(Message::UserInformation {
            username: username.to_string(),
            client_type: CLIENT_TYPE.to_string(),
            connection_type,
        })
        .await?;
        let reply = self
            .expect(timeout, "login reply", |m| {
                matches!(
                    m,
                    Message::LoginSuccess { .. } | Message::ConnectionRejected { .. }
                )
            })
            .await?;
        match reply {
            Message::LoginSuccess { user_id, .. } => {
                info!("Logged in as {} (user {})", username, user_id);
                Ok(user_id)
            }
            Message::ConnectionRejected { reason, .. } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Handshake plus login in one step.
    pub async fn join_server(
        &mut self,
        username: &str,
        connection_type: ConnectionType,
        timeout: Duration,
    ) -> Result<UserId, ClientError> {
        self.hello(netplay_shared::PROTOCOL_V086, timeout).await?;
        self.login(username, connection_type, timeout).await
    }

    /// Sends a lobby chat line.
    pub async fn chat(&mut self, message: &str) -> Result<(), ClientError> {
        self.send(Message::Chat {
            message: message.to_string(),
        })
        .await
    }

    /// Tells the server we are still here without counting as activity.
    pub async fn keep_alive(&mut self) -> Result<(), ClientError> {
        self.send(Message::KeepAlive).await
    }

    fn own_id(&self) -> Result<UserId, ClientError> {
        self.state.user_id.ok_or(ClientError::NotConnected)
    }

    /// Creates a game and waits until we are seated in it.
    pub async fn create_game(
        &mut self,
        rom_name: &str,
        timeout: Duration,
    ) -> Result<GameId, ClientError> {
        let me = self.own_id()?;
        self.send(Message::CreateGame {
            rom_name: rom_name.to_string(),
        })
        .await?;
        match self
            .expect(timeout, "game creation", |m| {
                matches!(m, Message::PlayerJoined { player, .. } if player.user_id == me)
            })
            .await?
        {
            Message::PlayerJoined { game_id, .. } => Ok(game_id),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Joins a game and returns our player number.
    pub async fn join_game(&mut self, game_id: GameId, timeout: Duration) -> Result<u8, ClientError> {
        let me = self.own_id()?;
        self.send(Message::JoinGame { game_id }).await?;
        match self
            .expect(timeout, "game join", |m| {
                matches!(m, Message::PlayerJoined { player, .. } if player.user_id == me)
            })
            .await?
        {
            Message::PlayerJoined { player, .. } => Ok(player.player_number),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Asks the server to start our game. Only the owner may do this.
    pub async fn start_game(&mut self) -> Result<(), ClientError> {
        self.send(Message::StartGame).await
    }

    /// Waits for the start notification and returns our player number.
    pub async fn wait_for_start(&mut self, timeout: Duration) -> Result<u8, ClientError> {
        match self
            .expect(timeout, "start notification", |m| {
                matches!(m, Message::StartGameNotification { .. })
            })
            .await?
        {
            Message::StartGameNotification { player_number, .. } => Ok(player_number),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Reports that the emulator is loaded and waiting for the first frame.
    pub async fn ready(&mut self, player_number: u8) -> Result<(), ClientError> {
        self.send(Message::AllReady { player_number }).await
    }

    /// Waits until every player in the game has reported ready.
    pub async fn wait_all_ready(&mut self, timeout: Duration) -> Result<(), ClientError> {
        self.expect(timeout, "all ready", |m| {
            matches!(m, Message::AllReadyNotification)
        })
        .await
        .map(|_| ())
    }

    /// Sends one frame of our inputs.
    pub async fn send_game_data(&mut self, data: Vec<u8>) -> Result<(), ClientError> {
        self.send(Message::GameData { data }).await
    }

    /// Next combined input block.
    pub async fn next_game_data(&mut self, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        match self
            .expect(timeout, "game data", |m| matches!(m, Message::GameData { .. }))
            .await?
        {
            Message::GameData { data } => Ok(data),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Sends a chat line to the players of our game.
    pub async fn game_chat(&mut self, message: &str) -> Result<(), ClientError> {
        self.send(Message::GameChat {
            message: message.to_string(),
        })
        .await
    }

    /// Removes `user_id` from our game. Only the owner may do this.
    pub async fn kick(&mut self, user_id: UserId) -> Result<(), ClientError> {
        self.send(Message::GameKick { user_id }).await
    }

    /// Drops out of the running game while the others keep playing.
    pub async fn drop_game(&mut self) -> Result<(), ClientError> {
        self.send(Message::PlayerDrop).await
    }

    /// Asks the server to resend the last combined input block.
    pub async fn dropped_packet(&mut self) -> Result<(), ClientError> {
        self.send(Message::DroppedPacket).await
    }

    pub async fn quit_game(&mut self) -> Result<(), ClientError> {
        self.send(Message::QuitGame).await
    }

    /// Closes our game for everyone. Only the owner may do this.
    pub async fn close_game(&mut self) -> Result<(), ClientError> {
        self.send(Message::CloseGame).await
    }

    /// Leaves the server. The session port is released shortly after.
    pub async fn quit(&mut self, message: &str) -> Result<(), ClientError> {
        self.send(Message::Quit {
            message: message.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let server: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut client = NetplayClient::connect(server).await.unwrap();
        assert!(matches!(
            client.send(Message::KeepAlive).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_handshake_against_fake_server() {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = fake.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buffer = [0u8; 64];
            let (len, from) = fake.recv_from(&mut buffer).await.unwrap();
            assert_eq!(
                HandshakeMessage::decode(&buffer[..len]).unwrap(),
                HandshakeMessage::Hello {
                    protocol: "v086".to_string()
                }
            );
            fake.send_to(&HandshakeMessage::HelloD00d { port: 4242 }.encode(), from)
                .await
                .unwrap();
        });

        let mut client = NetplayClient::connect(server).await.unwrap();
        let port = client.hello("v086", Duration::from_secs(2)).await.unwrap();
        assert_eq!(port, 4242);
        assert_eq!(
            client.session_addr(),
            Some(SocketAddr::new(server.ip(), 4242))
        );
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = NetplayClient::connect(silent.local_addr().unwrap())
            .await
            .unwrap();
        let result = client
            .ping_server(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_server_ack_is_answered_and_messages_are_queued() {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = fake.local_addr().unwrap();
        let mut client = NetplayClient::connect(session).await.unwrap();
        client.session = Some(session);
        let client_addr = SocketAddr::new(session.ip(), client.local_addr().unwrap().port());

        let bundle = Bundle {
            seq: 1,
            ack: 0,
            messages: vec![
                Message::ServerAck,
                Message::ChatNotification {
                    username: "server".to_string(),
                    message: "hi".to_string(),
                },
            ],
        };
        fake.send_to(&bundle.encode().unwrap(), client_addr)
            .await
            .unwrap();

        let message = client.recv(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(message, Message::ChatNotification { .. }));

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = fake.recv_from(&mut buffer).await.unwrap();
        let reply = Bundle::decode(&buffer[..len]).unwrap();
        assert_eq!(reply.ack, 1);
        assert_eq!(reply.messages, vec![Message::ClientAck]);
    }
}
