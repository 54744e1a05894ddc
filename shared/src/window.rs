//! Sequencing and resend state for one direction pair of a session.
//!
//! [`SendWindow`] numbers fresh bundles and keeps every bundle the peer has
//! not acknowledged yet. When the peer's ack lags behind our last sequence,
//! the missing range is retransmitted once it has been outstanding for at
//! least the resend interval. History is bounded: a peer that stops
//! acknowledging eventually exhausts it and the session must be closed
//! rather than silently dropping data.
//!
//! [`ReceiveWindow`] delivers inbound messages strictly in sequence order,
//! holding early bundles until the gap before them is filled.

use crate::bundle::Bundle;
use crate::message::Message;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("{0} bundles are awaiting acknowledgement")]
    Exhausted(usize),
    #[error("peer acknowledged sequence {ack} but only {last_sent} has been sent")]
    InvalidAck { ack: u32, last_sent: u32 },
}

#[derive(Debug)]
struct Outstanding {
    seq: u32,
    messages: Vec<Message>,
    last_sent: Instant,
}

#[derive(Debug)]
pub struct SendWindow {
    next_seq: u32,
    acked: u32,
    history: VecDeque<Outstanding>,
    capacity: usize,
    resend_interval: Duration,
}

impl SendWindow {
    pub fn new(capacity: usize, resend_interval: Duration) -> Self {
        Self {
            next_seq: 1,
            acked: 0,
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            resend_interval,
        }
    }

    /// Sequence number of the most recent fresh bundle, 0 before the first.
    pub fn last_sent(&self) -> u32 {
        self.next_seq - 1
    }

    pub fn acked(&self) -> u32 {
        self.acked
    }

    pub fn outstanding(&self) -> usize {
        self.history.len()
    }

    /// Wraps `messages` in a fresh bundle and remembers it for resend.
    pub fn push(
        &mut self,
        messages: Vec<Message>,
        ack: u32,
        now: Instant,
    ) -> Result<Bundle, WindowError> {
        if self.history.len() >= self.capacity {
            return Err(WindowError::Exhausted(self.history.len()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.history.push_back(Outstanding {
            seq,
            messages: messages.clone(),
            last_sent: now,
        });
        Ok(Bundle { seq, ack, messages })
    }

    /// Forgets every bundle up to and including `ack`. Stale acks are
    /// ignored; acks beyond what was sent are a protocol violation.
    pub fn acknowledge(&mut self, ack: u32) -> Result<(), WindowError> {
        if ack > self.last_sent() {
            return Err(WindowError::InvalidAck {
                ack,
                last_sent: self.last_sent(),
            });
        }
        if ack <= self.acked {
            return Ok(());
        }
        while self.history.front().is_some_and(|o| o.seq <= ack) {
            self.history.pop_front();
        }
        self.acked = ack;
        Ok(())
    }

    /// Bundles in the unacknowledged range that have waited at least the
    /// resend interval, restamped with the current `ack`.
    pub fn due_for_resend(&mut self, ack: u32, now: Instant) -> Vec<Bundle> {
        let interval = self.resend_interval;
        self.history
            .iter_mut()
            .filter(|o| now.saturating_duration_since(o.last_sent) >= interval)
            .map(|o| {
                o.last_sent = now;
                Bundle {
                    seq: o.seq,
                    ack,
                    messages: o.messages.clone(),
                }
            })
            .collect()
    }

    pub fn ack_only(&self, ack: u32) -> Bundle {
        Bundle::ack_only(self.last_sent(), ack)
    }
}

/// Outcome of handing an inbound bundle to the [`ReceiveWindow`].
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// Messages now deliverable in order (may span several bundles).
    Delivered(Vec<Message>),
    Duplicate,
    Buffered,
    OutOfWindow,
    AckOnly,
}

#[derive(Debug)]
pub struct ReceiveWindow {
    last_processed: u32,
    pending: BTreeMap<u32, Vec<Message>>,
    capacity: usize,
}

impl ReceiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            last_processed: 0,
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Highest sequence processed in order; this is what we acknowledge.
    pub fn ack(&self) -> u32 {
        self.last_processed
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn accept(&mut self, bundle: Bundle) -> Received {
        if bundle.is_ack_only() {
            return Received::AckOnly;
        }
        let expected = self.last_processed + 1;
        if bundle.seq < expected {
            return Received::Duplicate;
        }
        if bundle.seq > expected {
            if (bundle.seq - self.last_processed) as usize > self.capacity {
                return Received::OutOfWindow;
            }
            self.pending.entry(bundle.seq).or_insert(bundle.messages);
            return Received::Buffered;
        }

        let mut delivered = bundle.messages;
        self.last_processed = bundle.seq;
        while let Some(messages) = self.pending.remove(&(self.last_processed + 1)) {
            delivered.extend(messages);
            self.last_processed += 1;
        }
        Received::Delivered(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(text: &str) -> Message {
        Message::Chat {
            message: text.to_string(),
        }
    }

    fn bundle(seq: u32, text: &str) -> Bundle {
        Bundle {
            seq,
            ack: 0,
            messages: vec![chat(text)],
        }
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let now = Instant::now();
        let mut window = SendWindow::new(8, Duration::from_millis(100));
        assert_eq!(window.last_sent(), 0);

        let first = window.push(vec![chat("a")], 0, now).unwrap();
        let second = window.push(vec![chat("b")], 0, now).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(window.outstanding(), 2);
    }

    #[test]
    fn test_ack_releases_history() {
        let now = Instant::now();
        let mut window = SendWindow::new(8, Duration::from_millis(100));
        for text in ["a", "b", "c"] {
            window.push(vec![chat(text)], 0, now).unwrap();
        }

        window.acknowledge(2).unwrap();
        assert_eq!(window.outstanding(), 1);
        assert_eq!(window.acked(), 2);

        // stale ack changes nothing
        window.acknowledge(1).unwrap();
        assert_eq!(window.outstanding(), 1);

        assert_eq!(
            window.acknowledge(9),
            Err(WindowError::InvalidAck {
                ack: 9,
                last_sent: 3
            })
        );
    }

    #[test]
    fn test_gap_is_resent_after_interval() {
        let start = Instant::now();
        let mut window = SendWindow::new(8, Duration::from_millis(100));
        for text in ["a", "b", "c", "d"] {
            window.push(vec![chat(text)], 0, start).unwrap();
        }
        window.acknowledge(1).unwrap();

        assert!(window
            .due_for_resend(5, start + Duration::from_millis(50))
            .is_empty());

        let resent = window.due_for_resend(5, start + Duration::from_millis(150));
        let seqs: Vec<u32> = resent.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(resent.iter().all(|b| b.ack == 5));
        assert_eq!(resent[0].messages, vec![chat("b")]);

        // just resent, so not due again yet
        assert!(window
            .due_for_resend(5, start + Duration::from_millis(200))
            .is_empty());
    }

    #[test]
    fn test_window_exhaustion() {
        let now = Instant::now();
        let mut window = SendWindow::new(2, Duration::from_millis(100));
        window.push(vec![chat("a")], 0, now).unwrap();
        window.push(vec![chat("b")], 0, now).unwrap();
        assert_eq!(
            window.push(vec![chat("c")], 0, now),
            Err(WindowError::Exhausted(2))
        );

        window.acknowledge(1).unwrap();
        assert_eq!(window.push(vec![chat("c")], 0, now).unwrap().seq, 3);
    }

    #[test]
    fn test_ack_only_repeats_last_seq() {
        let now = Instant::now();
        let mut window = SendWindow::new(4, Duration::from_millis(100));
        window.push(vec![chat("a")], 0, now).unwrap();
        let ack = window.ack_only(12);
        assert_eq!(ack.seq, 1);
        assert_eq!(ack.ack, 12);
        assert!(ack.is_ack_only());
    }

    #[test]
    fn test_in_order_delivery() {
        let mut window = ReceiveWindow::new(16);
        assert_eq!(
            window.accept(bundle(1, "a")),
            Received::Delivered(vec![chat("a")])
        );
        assert_eq!(window.ack(), 1);
    }

    #[test]
    fn test_reordered_bundles_are_held() {
        let mut window = ReceiveWindow::new(16);
        assert_eq!(window.accept(bundle(2, "b")), Received::Buffered);
        assert_eq!(window.accept(bundle(3, "c")), Received::Buffered);
        assert_eq!(window.ack(), 0);
        assert_eq!(window.buffered(), 2);

        assert_eq!(
            window.accept(bundle(1, "a")),
            Received::Delivered(vec![chat("a"), chat("b"), chat("c")])
        );
        assert_eq!(window.ack(), 3);
        assert_eq!(window.buffered(), 0);
    }

    #[test]
    fn test_duplicates_and_window_limit() {
        let mut window = ReceiveWindow::new(4);
        window.accept(bundle(1, "a"));
        assert_eq!(window.accept(bundle(1, "a")), Received::Duplicate);
        assert_eq!(window.accept(bundle(9, "z")), Received::OutOfWindow);
        assert_eq!(window.accept(Bundle::ack_only(1, 0)), Received::AckOnly);
        assert_eq!(window.ack(), 1);
    }
}
