//! Rendezvous handshake frames.
//!
//! Every frame is an ASCII identifier, an optional ASCII payload and one
//! trailing 0x00 byte:
//!
//! | Frame | Payload | Direction |
//! |---|---|---|
//! | `PING` | none | client → server |
//! | `PONG` | none | server → client |
//! | `HELLO` | protocol name | client → server |
//! | `HELLOD00D` | decimal session port | server → client |
//! | `TOO` | none (server full) | server → client |

use thiserror::Error;

/// Terminates every handshake frame.
pub const TERMINATOR: u8 = 0x00;

const PING: &str = "PING";
const PONG: &str = "PONG";
const HELLO: &str = "HELLO";
const HELLO_D00D: &str = "HELLOD00D";
const TOO: &str = "TOO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    Ping,
    Pong,
    /// Build with [`HandshakeMessage::hello`]; a protocol name starting
    /// with `D00D` would read back as [`HandshakeMessage::HelloD00d`].
    Hello { protocol: String },
    HelloD00d { port: u16 },
    TooManyUsers,
}

/// Reasons a datagram could not be decoded as a handshake frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not terminated by 0x00")]
    MissingTerminator,
    #[error("terminator found inside the frame at offset {0}")]
    EmbeddedTerminator(usize),
    #[error("byte 0x{0:02X} is outside the handshake charset")]
    InvalidCharacter(u8),
    #[error("unknown message identifier: {0:?}")]
    UnknownIdentifier(String),
    #[error("{0} does not take a payload")]
    UnexpectedPayload(&'static str),
    #[error("HELLO without a protocol name")]
    MissingProtocol,
    #[error("invalid port number: {0:?}")]
    InvalidPort(String),
    #[error("protocol name {0:?} collides with HELLOD00D")]
    ReservedProtocol(String),
}

/// Prefix a protocol name may not start with.
const RESERVED_PROTOCOL_PREFIX: &str = "D00D";

impl HandshakeMessage {
    /// A `HELLO` request for `protocol`, which must be non-empty and must
    /// not start with `D00D`.
    pub fn hello(protocol: impl Into<String>) -> Result<Self, FrameError> {
        let protocol = protocol.into();
        if protocol.is_empty() {
            return Err(FrameError::MissingProtocol);
        }
        if protocol.starts_with(RESERVED_PROTOCOL_PREFIX) {
            return Err(FrameError::ReservedProtocol(protocol));
        }
        Ok(HandshakeMessage::Hello { protocol })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = match self {
            HandshakeMessage::Ping => PING.as_bytes().to_vec(),
            HandshakeMessage::Pong => PONG.as_bytes().to_vec(),
            HandshakeMessage::Hello { protocol } => format!("{HELLO}{protocol}").into_bytes(),
            HandshakeMessage::HelloD00d { port } => format!("{HELLO_D00D}{port}").into_bytes(),
            HandshakeMessage::TooManyUsers => TOO.as_bytes().to_vec(),
        };
        frame.push(TERMINATOR);
        frame
    }

    /// Decodes one complete frame. The terminator must be the last byte and
    /// must not appear anywhere else.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (last, body) = bytes.split_last().ok_or(FrameError::Empty)?;
        if *last != TERMINATOR {
            return Err(FrameError::MissingTerminator);
        }
        if let Some(offset) = body.iter().position(|b| *b == TERMINATOR) {
            return Err(FrameError::EmbeddedTerminator(offset));
        }
        if let Some(byte) = body.iter().find(|b| !is_frame_byte(**b)) {
            return Err(FrameError::InvalidCharacter(*byte));
        }
        let text = std::str::from_utf8(body).map_err(|e| {
            FrameError::InvalidCharacter(body.get(e.valid_up_to()).copied().unwrap_or(0))
        })?;

        // HELLOD00D shares its prefix with HELLO and must be matched first.
        if let Some(port) = text.strip_prefix(HELLO_D00D) {
            return port
                .parse::<u16>()
                .map(|port| HandshakeMessage::HelloD00d { port })
                .map_err(|_| FrameError::InvalidPort(port.to_string()));
        }
        if let Some(protocol) = text.strip_prefix(HELLO) {
            return HandshakeMessage::hello(protocol);
        }

        let bare = |id: &'static str, message: HandshakeMessage| {
            if text.len() == id.len() {
                Ok(message)
            } else {
                Err(FrameError::UnexpectedPayload(id))
            }
        };
        if text.starts_with(PING) {
            bare(PING, HandshakeMessage::Ping)
        } else if text.starts_with(PONG) {
            bare(PONG, HandshakeMessage::Pong)
        } else if text.starts_with(TOO) {
            bare(TOO, HandshakeMessage::TooManyUsers)
        } else {
            Err(FrameError::UnknownIdentifier(text.to_string()))
        }
    }
}

fn is_frame_byte(byte: u8) -> bool {
    byte.is_ascii_graphic() || byte == b' '
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_frames() {
        let messages = vec![
            HandshakeMessage::Ping,
            HandshakeMessage::Pong,
            HandshakeMessage::Hello {
                protocol: "v086".to_string(),
            },
            HandshakeMessage::Hello {
                protocol: "0.83".to_string(),
            },
            HandshakeMessage::HelloD00d { port: 27889 },
            HandshakeMessage::HelloD00d { port: u16::MAX },
            HandshakeMessage::TooManyUsers,
        ];

        for message in messages {
            let encoded = message.encode();
            assert_eq!(*encoded.last().unwrap(), TERMINATOR);
            assert_eq!(HandshakeMessage::decode(&encoded).unwrap(), message);
        }

        // would encode as HELLOD00D1 and come back as a port reply
        assert_eq!(
            HandshakeMessage::hello("D00D1"),
            Err(FrameError::ReservedProtocol("D00D1".to_string()))
        );
        assert_eq!(HandshakeMessage::hello(""), Err(FrameError::MissingProtocol));
        assert_eq!(
            HandshakeMessage::hello("v086"),
            Ok(HandshakeMessage::Hello {
                protocol: "v086".to_string()
            })
        );
    }

    #[test]
    fn test_wire_bytes() {
        assert_eq!(HandshakeMessage::Ping.encode(), b"PING\0");
        assert_eq!(
            HandshakeMessage::HelloD00d { port: 1234 }.encode(),
            b"HELLOD00D1234\0"
        );
        assert_eq!(HandshakeMessage::TooManyUsers.encode(), b"TOO\0");
    }

    #[test]
    fn test_missing_terminator() {
        assert_eq!(
            HandshakeMessage::decode(b"PING"),
            Err(FrameError::MissingTerminator)
        );
        assert_eq!(HandshakeMessage::decode(b""), Err(FrameError::Empty));
    }

    #[test]
    fn test_truncated_frames() {
        assert_eq!(
            HandshakeMessage::decode(b"HEL\0"),
            Err(FrameError::UnknownIdentifier("HEL".to_string()))
        );
        assert_eq!(
            HandshakeMessage::decode(b"HELLO\0"),
            Err(FrameError::MissingProtocol)
        );
        assert_eq!(
            HandshakeMessage::decode(b"HELLOD00D\0"),
            Err(FrameError::InvalidPort(String::new()))
        );
    }

    #[test]
    fn test_embedded_terminator() {
        assert_eq!(
            HandshakeMessage::decode(b"PING\0\0"),
            Err(FrameError::EmbeddedTerminator(4))
        );
    }

    #[test]
    fn test_invalid_charset() {
        assert_eq!(
            HandshakeMessage::decode(b"HELLOv\xC3\xA9\0"),
            Err(FrameError::InvalidCharacter(0xC3))
        );
        assert_eq!(
            HandshakeMessage::decode(b"PI\nNG\0"),
            Err(FrameError::InvalidCharacter(b'\n'))
        );
    }

    #[test]
    fn test_unknown_identifier_and_payloads() {
        assert!(matches!(
            HandshakeMessage::decode(b"GET / HTTP/1.1\0"),
            Err(FrameError::UnknownIdentifier(_))
        ));
        assert_eq!(
            HandshakeMessage::decode(b"PINGPONG\0"),
            Err(FrameError::UnexpectedPayload("PING"))
        );
        assert_eq!(
            HandshakeMessage::decode(b"HELLOD00D99999\0"),
            Err(FrameError::InvalidPort("99999".to_string()))
        );
    }

    #[test]
    fn test_arbitrary_bytes_never_panic() {
        for len in 0..6usize {
            for seed in 0u8..=255 {
                let bytes: Vec<u8> = (0..len)
                    .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
                    .collect();
                let _ = HandshakeMessage::decode(&bytes);
            }
        }
    }
}
