//! # Netplay Client Library
//!
//! A headless client for the netplay relay. It speaks the rendezvous
//! handshake, runs the session side of the bundle protocol (sequence
//! numbers, acknowledgements, resends) and exposes the lobby and game
//! requests as async methods.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`NetplayClient`]: handshake, login with automatic `ServerAck` replies,
//! and one method per lobby or game request.
//!
//! ### Game Module (`game`)
//! [`ClientGameState`], the lobby and game view rebuilt from server
//! notifications, and [`split_actions`] for taking combined input blocks
//! apart per player.
//!
//! ### Latency Module (`latency`)
//! Round-trip history of input frames.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netplay_client::NetplayClient;
//! use netplay_shared::ConnectionType;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = NetplayClient::connect("127.0.0.1:27888".parse()?).await?;
//!     client
//!         .join_server("player", ConnectionType::Lan, Duration::from_secs(5))
//!         .await?;
//!     let game_id = client.create_game("Street Fighter", Duration::from_secs(5)).await?;
//!     println!("hosting game {game_id}");
//!     client.quit("bye").await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod latency;
pub mod network;

pub use game::{split_actions, ClientGameState};
pub use latency::LatencyHistory;
pub use network::{ClientError, NetplayClient};
