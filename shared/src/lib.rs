//! # Netplay Shared Library
//!
//! Wire types used by both the relay server and the headless client.
//!
//! ## Two protocols on two ports
//!
//! ### Rendezvous (`handshake`)
//! A client first talks to the server's well-known port using tiny ASCII
//! frames terminated by a single `0x00` byte. `PING` is answered with `PONG`
//! so clients can measure latency, and `HELLO<protocol>` is answered with
//! `HELLOD00D<port>`: the dedicated session port the client must reconnect
//! to. A full server answers `TOO`.
//!
//! ### Session (`bundle`, `message`, `window`)
//! On the session port every datagram is one bincode-encoded [`Bundle`]
//! carrying a sequence number, an acknowledgement and a batch of
//! [`Message`]s. [`SendWindow`] and [`ReceiveWindow`] implement the ordering
//! and resend rules both ends follow, so neither side needs to care about
//! UDP reordering or loss once a session is up.
//!
//! ## Game data layout
//!
//! Inside a game each player sends `GameData` holding `actions_per_message`
//! actions of a fixed byte length. The server answers every message with a
//! combined block in which player `p` occupies bytes
//! `[(p - 1) * len, p * len)` of every `num_players * len` action.

pub mod bundle;
pub mod handshake;
pub mod message;
pub mod window;

pub use bundle::{chunk_messages, Bundle, BundleError, MAX_DATAGRAM_SIZE};
pub use handshake::{FrameError, HandshakeMessage};
pub use message::{
    ConnectionType, GameId, GameStatus, GameSummary, Message, PlayerSummary, UserId, UserStatus,
    UserSummary,
};
pub use window::{ReceiveWindow, Received, SendWindow, WindowError};

/// Well-known rendezvous port.
pub const DEFAULT_PORT: u16 = 27888;

/// Protocol name announced in `HELLO` by current clients.
pub const PROTOCOL_V086: &str = "v086";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_uses_protocol_constant() {
        let hello = HandshakeMessage::Hello {
            protocol: PROTOCOL_V086.to_string(),
        };
        assert_eq!(hello.encode(), b"HELLOv086\0");
    }

    #[test]
    fn test_reexports_build_a_session_exchange() {
        let now = std::time::Instant::now();
        let mut send = SendWindow::new(4, std::time::Duration::from_millis(100));
        let mut recv = ReceiveWindow::new(4);

        let bundle = send.push(vec![Message::KeepAlive], recv.ack(), now).unwrap();
        let decoded = Bundle::decode(&bundle.encode().unwrap()).unwrap();
        assert_eq!(
            recv.accept(decoded),
            Received::Delivered(vec![Message::KeepAlive])
        );
        send.acknowledge(recv.ack()).unwrap();
        assert_eq!(send.outstanding(), 0);
    }
}
