//! # Netplay Relay Server
//!
//! A UDP relay for emulator netplay. Clients meet the server on a single
//! rendezvous port, are handed a dedicated session port, log in, and then
//! create or join games. While a game is running every player's input
//! frames pass through the server, which combines them into one block per
//! frame so that all players apply the same inputs in the same order.
//!
//! ## Connection Flow
//!
//! 1. `PING` / `PONG` on the rendezvous port lets clients measure the
//!    server before connecting.
//! 2. `HELLO<protocol>` asks the [`client_manager::ProtocolManager`] for
//!    that protocol to open a session. The reply is `HELLOD00D<port>`, or
//!    `TOO` when the server is full.
//! 3. The client talks to its session port from then on. After
//!    `UserInformation` the session measures the round trip with a few
//!    ServerAck/ClientAck exchanges and logs the user in.
//!
//! Addresses that open sessions in a tight loop are banned for two minutes
//! (hammer protection).
//!
//! ## Module Organization
//!
//! ### Network (`network`)
//! Rendezvous listener, server startup and shutdown, the periodic sweep.
//!
//! ### Client Manager (`client_manager`) and Session (`session`)
//! One task per client session with its own socket. Sessions bundle
//! messages, number them, acknowledge the peer and resend whatever the peer
//! has not acknowledged.
//!
//! ### Registry (`registry`)
//! Users and games. Login validation, chat and create-game flood limits,
//! capacity limits, idle and keep-alive timeouts.
//!
//! ### Game (`game`) and Action Queue (`action_queue`)
//! The WAITING → SYNCHRONIZING → PLAYING state machine, frame delay
//! negotiation, and the per-player input queues that fan each player's
//! input out to everyone.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netplay_server::config::ServerConfig;
//! use netplay_server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_file("relay.toml")?;
//!     let handle = Server::bind(config).await?.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod action_queue;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod events;
pub mod game;
pub mod network;
pub mod registry;
mod session;
pub mod timer;
pub mod user;
