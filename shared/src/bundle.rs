//! Session datagram framing.
//!
//! One datagram carries one [`Bundle`]: the sender's sequence number, the
//! highest sequence it has processed from its peer, and one or more logical
//! messages. A bundle with no messages is a pure acknowledgement and repeats
//! the last sequence number the sender used.

use crate::message::Message;
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest datagram either side will accept.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Soft target for outbound bundles; a single larger message still goes out
/// alone as long as it fits in [`MAX_DATAGRAM_SIZE`].
pub const TARGET_BUNDLE_SIZE: usize = 1200;

const BUNDLE_HEADER_SIZE: u64 = 4 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub seq: u32,
    pub ack: u32,
    pub messages: Vec<Message>,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("bundle of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
}

impl Bundle {
    pub fn ack_only(seq: u32, ack: u32) -> Self {
        Self {
            seq,
            ack,
            messages: Vec::new(),
        }
    }

    pub fn is_ack_only(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, BundleError> {
        let bytes = codec().serialize(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(BundleError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BundleError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(BundleError::TooLarge(bytes.len()));
        }
        Ok(codec().deserialize(bytes)?)
    }
}

/// Groups messages into bundle-sized batches, preserving order.
pub fn chunk_messages(messages: Vec<Message>) -> Vec<Vec<Message>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_size = BUNDLE_HEADER_SIZE;

    for message in messages {
        let size = codec().serialized_size(&message).unwrap_or(u64::MAX);
        if !current.is_empty() && current_size.saturating_add(size) > TARGET_BUNDLE_SIZE as u64 {
            chunks.push(std::mem::take(&mut current));
            current_size = BUNDLE_HEADER_SIZE;
        }
        current_size = current_size.saturating_add(size);
        current.push(message);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
