//! Protocol session managers.
//!
//! The rendezvous listener does not know how any client protocol works. It
//! hands each accepted `HELLO` to the [`ProtocolManager`] that claims the
//! requested protocol name, and that manager allocates a dedicated session:
//! a fresh UDP port plus the task that serves it. The manager owns every
//! session it created and tears them all down on shutdown.
//!
//! [`ClientManager`] is the manager for the v086 message protocol.

use crate::error::NewConnectionError;
use crate::registry::ServerRegistry;
use crate::session::ClientSession;
use log::{debug, info, warn};
use netplay_shared::PROTOCOL_V086;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Boxed future returned by [`ProtocolManager`] operations.
pub type ManagerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Protocol names served by [`ClientManager`]. `0.83` is the name older
/// clients announce for the same message set.
pub const V086_PROTOCOLS: &[&str] = &[PROTOCOL_V086, "0.83"];

/// Random picks tried before giving up on a configured port range.
const PORT_ATTEMPTS: usize = 32;

/// How long shutdown waits for one session to say goodbye.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Allocates and owns client sessions for one family of protocols.
pub trait ProtocolManager: Send + Sync {
    /// Protocol names accepted in `HELLO<protocol>`.
    fn protocols(&self) -> &[&'static str];

    /// Opens a session for the client at `address` and returns its port.
    fn new_connection<'a>(
        &'a self,
        address: SocketAddr,
        protocol: &'a str,
    ) -> ManagerFuture<'a, Result<u16, NewConnectionError>>;

    /// Stops accepting and closes every session.
    fn shutdown(&self) -> ManagerFuture<'_, ()>;

    fn stats(&self) -> ManagerStatsSnapshot;
}

/// Live counters shared between a manager and its sessions.
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub(crate) sessions_opened: AtomicU64,
    pub(crate) sessions_closed: AtomicU64,
    pub(crate) active_sessions: AtomicUsize,
    /// Datagrams that failed to decode as a bundle.
    pub(crate) frame_errors: AtomicU64,
    /// Datagrams from an address other than the one the session was made for.
    pub(crate) foreign_packets: AtomicU64,
    pub(crate) resends: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStatsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub active_sessions: usize,
    pub frame_errors: u64,
    pub foreign_packets: u64,
    pub resends: u64,
}

impl ManagerStats {
    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            foreign_packets: self.foreign_packets.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
        }
    }
}

/// Bookkeeping for one running session
#[derive(Debug)]
struct SessionEntry {
    remote: IpAddr,
    /// Distinguishes this session from a later one that reuses the port.
    generation: u64,
    task: JoinHandle<()>,
}

/// Forgets the session on `port` only if it is still the one from
/// `generation`.
fn release_session(sessions: &mut HashMap<u16, SessionEntry>, port: u16, generation: u64) -> bool {
    match sessions.get(&port) {
        Some(entry) if entry.generation == generation => {
            sessions.remove(&port);
            true
        }
        _ => false,
    }
}

/// Manager for v086 sessions
///
/// Every accepted client gets its own socket so that session traffic never
/// passes through the rendezvous port. The number of live sessions is capped
/// at `max_users`; a session that has not logged in yet still counts.
pub struct ClientManager {
    registry: Arc<ServerRegistry>,
    /// Running sessions indexed by their port
    sessions: Arc<Mutex<HashMap<u16, SessionEntry>>>,
    accepting: AtomicBool,
    next_generation: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<ManagerStats>,
}

impl ClientManager {
    /// Creates a manager whose sessions log users into `registry`.
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            accepting: AtomicBool::new(true),
            next_generation: AtomicU64::new(1),
            shutdown_tx,
            stats: Arc::new(ManagerStats::default()),
        }
    }

    /// Number of sessions currently running
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Remote address a session port was allocated for
    pub async fn session_remote(&self, port: u16) -> Option<IpAddr> {
        self.sessions.lock().await.get(&port).map(|entry| entry.remote)
    }

    /// Binds a session socket on the configured host
    ///
    /// Without a configured range the OS picks the port. With a range, random
    /// ports inside it are tried until one binds.
    fn bind_session_socket(&self) -> Result<UdpSocket, NewConnectionError> {
        let config = self.registry.config();
        let host = config.host.as_str();
        let socket = match config.session_port_range {
            None => std::net::UdpSocket::bind((host, 0))
                .map_err(|e| NewConnectionError::Bind(e.to_string()))?,
            Some((start, end)) => {
                let mut rng = rand::thread_rng();
                let mut last_error = None;
                let mut bound = None;
                for _ in 0..PORT_ATTEMPTS {
                    let port = rng.gen_range(start..=end);
                    match std::net::UdpSocket::bind((host, port)) {
                        Ok(socket) => {
                            bound = Some(socket);
                            break;
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
                bound.ok_or_else(|| {
                    NewConnectionError::Bind(last_error.map_or_else(
                        || format!("no free port in [{start}, {end}]"),
                        |e| e.to_string(),
                    ))
                })?
            }
        };
        socket
            .set_nonblocking(true)
            .map_err(|e| NewConnectionError::Bind(e.to_string()))?;
        UdpSocket::from_std(socket).map_err(|e| NewConnectionError::Bind(e.to_string()))
    }

    async fn open_session(&self, address: SocketAddr) -> Result<u16, NewConnectionError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NewConnectionError::Stopped);
        }
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.registry.config().max_users {
            return Err(NewConnectionError::ServerFull);
        }

        let socket = self.bind_session_socket()?;
        let port = socket
            .local_addr()
            .map_err(|e| NewConnectionError::Bind(e.to_string()))?
            .port();
        let session = ClientSession::new(
            socket,
            address.ip(),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            self.shutdown_tx.subscribe(),
        );

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry_sessions = Arc::clone(&self.sessions);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(async move {
            session.run().await;
            if !release_session(&mut *registry_sessions.lock().await, port, generation) {
                debug!("Session on port {} was already replaced", port);
            }
            stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
            stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
        });
        sessions.insert(
            port,
            SessionEntry {
                remote: address.ip(),
                generation,
                task,
            },
        );
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.active_sessions.fetch_add(1, Ordering::Relaxed);
        info!("Opened session on port {} for {}", port, address);
        Ok(port)
    }

    async fn close_all(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<(u16, JoinHandle<()>)> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(port, entry)| (port, entry.task)).collect()
        };
        info!("Closing {} sessions", tasks.len());
        for (port, mut task) in tasks {
            match tokio::time::timeout(SESSION_DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!("Session on port {} finished", port),
                Ok(Err(e)) => warn!("Session on port {} failed: {}", port, e),
                Err(_) => {
                    warn!("Session on port {} did not stop in time", port);
                    task.abort();
                }
            }
        }
    }
}

impl ProtocolManager for ClientManager {
    fn protocols(&self) -> &[&'static str] {
        V086_PROTOCOLS
    }

    fn new_connection<'a>(
        &'a self,
        address: SocketAddr,
        protocol: &'a str,
    ) -> ManagerFuture<'a, Result<u16, NewConnectionError>> {
        Box::pin(async move {
            if !self.protocols().contains(&protocol) {
                return Err(NewConnectionError::UnsupportedProtocol(protocol.to_string()));
            }
            self.open_session(address).await
        })
    }

    fn shutdown(&self) -> ManagerFuture<'_, ()> {
        Box::pin(self.close_all())
    }

    fn stats(&self) -> ManagerStatsSnapshot {
        self.stats.snapshot()
    }
}
