//! Rendezvous endpoint and server lifecycle.
//!
//! The listener answers `PING` and hands every `HELLO<protocol>` to the
//! protocol manager that claims it. Session traffic never reaches this port.

use crate::access::{AccessLevel, AccessManager, AccessPolicy};
use crate::client_manager::{ClientManager, ManagerStatsSnapshot, ProtocolManager};
use crate::config::ServerConfig;
use crate::error::{NewConnectionError, ServerError};
use crate::registry::ServerRegistry;
use log::{debug, error, info, warn};
use netplay_shared::{HandshakeMessage, MAX_DATAGRAM_SIZE};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Consecutive handshakes from one address that trigger a temporary ban.
pub const HAMMER_LIMIT: u32 = 4;
pub const HAMMER_BAN: Duration = Duration::from_secs(120);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Handshake counters, serializable for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub connects: u64,
    pub ping_count: u64,
    pub protocol_errors: u64,
    pub message_format_errors: u64,
    pub denied: u64,
    pub banned: u64,
    pub too_many: u64,
    pub failures: u64,
    pub sessions_created: u64,
}

#[derive(Debug, Default)]
struct ListenerState {
    last_address: Option<IpAddr>,
    last_address_count: u32,
    stats: ListenerStats,
}

impl ListenerState {
    /// Counts a handshake from `address`; true once it has hammered.
    fn hammered(&mut self, address: IpAddr) -> bool {
        if self.last_address == Some(address) {
            self.last_address_count += 1;
        } else {
            self.last_address = Some(address);
            self.last_address_count = 1;
        }
        if self.last_address_count >= HAMMER_LIMIT {
            self.last_address_count = 0;
            return true;
        }
        false
    }
}

pub struct RendezvousListener {
    access: Arc<dyn AccessPolicy>,
    managers: Vec<Arc<dyn ProtocolManager>>,
    state: Mutex<ListenerState>,
}

impl RendezvousListener {
    pub fn new(access: Arc<dyn AccessPolicy>, managers: Vec<Arc<dyn ProtocolManager>>) -> Self {
        Self {
            access,
            managers,
            state: Mutex::new(ListenerState::default()),
        }
    }

    fn manager_for(&self, protocol: &str) -> Option<&Arc<dyn ProtocolManager>> {
        self.managers
            .iter()
            .find(|manager| manager.protocols().contains(&protocol))
    }

    pub async fn stats(&self) -> ListenerStats {
        self.state.lock().await.stats
    }

    /// Processes one rendezvous datagram and returns the reply, if any.
    pub async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Option<HandshakeMessage> {
        let message = match HandshakeMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.state.lock().await.stats.message_format_errors += 1;
                debug!("Malformed handshake from {}: {}", from, e);
                return None;
            }
        };

        let protocol = match message {
            HandshakeMessage::Ping => {
                self.state.lock().await.stats.ping_count += 1;
                return Some(HandshakeMessage::Pong);
            }
            HandshakeMessage::Hello { protocol } => protocol,
            other => {
                self.state.lock().await.stats.message_format_errors += 1;
                debug!("Unexpected handshake {:?} from {}", other, from);
                return None;
            }
        };

        // hammer bookkeeping and allocation form one critical section
        let mut state = self.state.lock().await;
        state.stats.connects += 1;

        let Some(manager) = self.manager_for(&protocol) else {
            state.stats.protocol_errors += 1;
            debug!("Unsupported protocol {:?} from {}", protocol, from);
            return None;
        };

        let ip = from.ip();
        if !self.access.is_address_allowed(ip) {
            state.stats.denied += 1;
            debug!("Handshake from {} denied by access policy", ip);
            return None;
        }
        if self.access.access_level(ip) < AccessLevel::Admin && state.hammered(ip) {
            self.access.add_temp_ban(ip, HAMMER_BAN);
            state.stats.banned += 1;
            warn!("{} is hammering the server, banned for {:?}", ip, HAMMER_BAN);
            return None;
        }

        match manager.new_connection(from, &protocol).await {
            Ok(port) => {
                state.stats.sessions_created += 1;
                Some(HandshakeMessage::HelloD00d { port })
            }
            Err(NewConnectionError::ServerFull) => {
                state.stats.too_many += 1;
                info!("Turned away {}: server is full", from);
                Some(HandshakeMessage::TooManyUsers)
            }
            Err(e) => {
                state.stats.failures += 1;
                warn!("Could not open a session for {}: {}", from, e);
                None
            }
        }
    }
}

/// A bound but not yet running server
pub struct Server {
    socket: UdpSocket,
    registry: Arc<ServerRegistry>,
    listener: Arc<RendezvousListener>,
    managers: Vec<Arc<dyn ProtocolManager>>,
}

impl Server {
    /// Validates `config`, binds the rendezvous port and builds the core with
    /// the in-memory access policy.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let access = Arc::new(AccessManager::new(&config.access));
        Self::bind_with_access(config, access).await
    }

    pub async fn bind_with_access(
        config: ServerConfig,
        access: Arc<dyn AccessPolicy>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let address = config.bind_address();
        let socket = UdpSocket::bind(&address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;
        info!("Server listening on {}", socket.local_addr()?);

        let registry = Arc::new(ServerRegistry::new(Arc::new(config), Arc::clone(&access)));
        let v086: Arc<dyn ProtocolManager> = Arc::new(ClientManager::new(Arc::clone(&registry)));
        let managers = vec![v086];
        let listener = Arc::new(RendezvousListener::new(access, managers.clone()));
        Ok(Self {
            socket,
            registry,
            listener,
            managers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the listener and the periodic sweep.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let local_addr = self.socket.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener_task = spawn_listener(
            self.socket,
            Arc::clone(&self.listener),
            shutdown_rx.clone(),
        );
        let sweep_task = spawn_sweeper(Arc::clone(&self.registry), shutdown_rx);
        Ok(ServerHandle {
            local_addr,
            registry: self.registry,
            listener: self.listener,
            managers: self.managers,
            shutdown_tx,
            tasks: vec![listener_task, sweep_task],
        })
    }
}

/// Spawns the task that answers rendezvous datagrams
///
/// Datagrams are handled one at a time on this task. Everything past decoding
/// runs under the listener's state lock anyway.
fn spawn_listener(
    socket: UdpSocket,
    listener: Arc<RendezvousListener>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => {
                        if let Some(reply) = listener.handle_datagram(&buffer[..len], from).await {
                            if let Err(e) = socket.send_to(&reply.encode(), from).await {
                                error!("Failed to reply to {}: {}", from, e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error receiving handshake: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Rendezvous listener stopped");
    })
}

/// Spawns the task that expires idle users and stalled games
fn spawn_sweeper(
    registry: Arc<ServerRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = registry.sweep(Instant::now()).await;
                    if !removed.is_empty() {
                        debug!("Sweep removed {} users", removed.len());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Control surface of a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    listener: Arc<RendezvousListener>,
    managers: Vec<Arc<dyn ProtocolManager>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub async fn listener_stats(&self) -> ListenerStats {
        self.listener.stats().await
    }

    pub fn manager_stats(&self) -> Vec<ManagerStatsSnapshot> {
        self.managers.iter().map(|manager| manager.stats()).collect()
    }

    /// Stops accepting handshakes, then closes every session.
    pub async fn shutdown(self) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Server task failed: {}", e);
            }
        }
        for manager in &self.managers {
            manager.shutdown().await;
        }
        self.registry.shutdown();
        info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::ManagerFuture;
    use crate::config::AccessConfig;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubManager {
        result: Result<u16, NewConnectionError>,
        calls: AtomicUsize,
    }

    impl StubManager {
        fn new(result: Result<u16, NewConnectionError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ProtocolManager for StubManager {
        fn protocols(&self) -> &[&'static str] {
            &["v086"]
        }

        fn new_connection<'a>(
            &'a self,
            _address: SocketAddr,
            _protocol: &'a str,
        ) -> ManagerFuture<'a, Result<u16, NewConnectionError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.result.clone();
            Box::pin(async move { result })
        }

        fn shutdown(&self) -> ManagerFuture<'_, ()> {
            Box::pin(async {})
        }

        fn stats(&self) -> ManagerStatsSnapshot {
            ManagerStatsSnapshot::default()
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 5000)
    }

    fn listener_with(
        manager: Arc<StubManager>,
        config: AccessConfig,
    ) -> (RendezvousListener, Arc<AccessManager>) {
        let access = Arc::new(AccessManager::new(&config));
        let managers: Vec<Arc<dyn ProtocolManager>> = vec![manager];
        let listener = RendezvousListener::new(access.clone(), managers);
        (listener, access)
    }

    fn hello() -> Vec<u8> {
        HandshakeMessage::Hello {
            protocol: "v086".to_string(),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (listener, _) = listener_with(StubManager::new(Ok(1)), AccessConfig::default());
        let reply = listener
            .handle_datagram(&HandshakeMessage::Ping.encode(), addr(1))
            .await;
        assert_eq!(reply, Some(HandshakeMessage::Pong));
        assert_eq!(listener.stats().await.ping_count, 1);
    }

    #[tokio::test]
    async fn test_hello_allocates_session() {
        let manager = StubManager::new(Ok(31000));
        let (listener, _) = listener_with(manager.clone(), AccessConfig::default());

        let reply = listener.handle_datagram(&hello(), addr(1)).await;
        assert_eq!(reply, Some(HandshakeMessage::HelloD00d { port: 31000 }));
        let stats = listener.stats().await;
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(manager.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_dropped() {
        let manager = StubManager::new(Ok(31000));
        let (listener, _) = listener_with(manager.clone(), AccessConfig::default());
        let frame = HandshakeMessage::Hello {
            protocol: "foo".to_string(),
        }
        .encode();

        assert_eq!(listener.handle_datagram(&frame, addr(1)).await, None);
        assert_eq!(listener.stats().await.protocol_errors, 1);
        assert_eq!(manager.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_counted() {
        let (listener, _) = listener_with(StubManager::new(Ok(1)), AccessConfig::default());
        assert_eq!(listener.handle_datagram(b"PING", addr(1)).await, None);
        assert_eq!(listener.handle_datagram(&[0xff, 0x00], addr(1)).await, None);
        assert_eq!(
            listener
                .handle_datagram(&HandshakeMessage::Pong.encode(), addr(1))
                .await,
            None
        );
        assert_eq!(listener.stats().await.message_format_errors, 3);
    }

    #[tokio::test]
    async fn test_server_full_replies_too() {
        let (listener, _) = listener_with(
            StubManager::new(Err(NewConnectionError::ServerFull)),
            AccessConfig::default(),
        );
        assert_eq!(
            listener.handle_datagram(&hello(), addr(1)).await,
            Some(HandshakeMessage::TooManyUsers)
        );
        assert_eq!(listener.stats().await.too_many, 1);
    }

    #[tokio::test]
    async fn test_other_failures_are_silent() {
        let (listener, _) = listener_with(
            StubManager::new(Err(NewConnectionError::Bind("in use".to_string()))),
            AccessConfig::default(),
        );
        assert_eq!(listener.handle_datagram(&hello(), addr(1)).await, None);
        assert_eq!(listener.stats().await.failures, 1);
    }

    #[tokio::test]
    async fn test_denied_address() {
        let config = AccessConfig {
            admins: Vec::new(),
            denied: vec![addr(9).ip()],
        };
        let manager = StubManager::new(Ok(1));
        let (listener, _) = listener_with(manager.clone(), config);
        assert_eq!(listener.handle_datagram(&hello(), addr(9)).await, None);
        assert_eq!(listener.stats().await.denied, 1);
        assert_eq!(manager.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hammer_protection() {
        let manager = StubManager::new(Ok(31000));
        let (listener, access) = listener_with(manager.clone(), AccessConfig::default());

        for _ in 0..3 {
            assert!(listener.handle_datagram(&hello(), addr(1)).await.is_some());
        }
        assert_eq!(listener.handle_datagram(&hello(), addr(1)).await, None);
        assert_eq!(listener.stats().await.banned, 1);
        assert_eq!(access.temp_ban_count(), 1);

        // still banned a minute later
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(listener.handle_datagram(&hello(), addr(1)).await, None);
        assert_eq!(listener.stats().await.denied, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(listener.handle_datagram(&hello(), addr(1)).await.is_some());
        assert_eq!(manager.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_interleaved_hellos_count_exactly() {
        let manager = StubManager::new(Ok(31000));
        let (listener, _) = listener_with(manager.clone(), AccessConfig::default());
        let frame = hello();

        let replies = tokio::join!(
            listener.handle_datagram(&frame, addr(1)),
            listener.handle_datagram(&frame, addr(1)),
            listener.handle_datagram(&frame, addr(1)),
            listener.handle_datagram(&frame, addr(1)),
        );
        let replies = [replies.0, replies.1, replies.2, replies.3];

        assert_eq!(replies.iter().filter(|r| r.is_some()).count(), 3);
        let stats = listener.stats().await;
        assert_eq!(stats.connects, 4);
        assert_eq!(stats.banned, 1);
        assert_eq!(stats.sessions_created, 3);
        assert_eq!(manager.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_address_resets_hammer_count() {
        let (listener, _) = listener_with(StubManager::new(Ok(31000)), AccessConfig::default());
        for _ in 0..3 {
            assert!(listener.handle_datagram(&hello(), addr(1)).await.is_some());
        }
        assert!(listener.handle_datagram(&hello(), addr(2)).await.is_some());
        for _ in 0..3 {
            assert!(listener.handle_datagram(&hello(), addr(1)).await.is_some());
        }
        assert_eq!(listener.stats().await.banned, 0);
    }

    #[tokio::test]
    async fn test_admins_are_never_hammer_banned() {
        let config = AccessConfig {
            admins: vec![addr(1).ip()],
            denied: Vec::new(),
        };
        let (listener, _) = listener_with(StubManager::new(Ok(31000)), config);
        for _ in 0..10 {
            assert!(listener.handle_datagram(&hello(), addr(1)).await.is_some());
        }
        assert_eq!(listener.stats().await.banned, 0);
    }

    #[tokio::test]
    async fn test_server_bind_and_shutdown() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();
        let handle = server.start().unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.manager_stats().len(), 1);
        handle.shutdown().await;
    }
}
