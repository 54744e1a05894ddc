//! Per-player input buffer fanned out to every player of a game.
//!
//! A [`PlayerActionQueue`] is written only by its source player. Every
//! consumer slot (including the source itself, which receives its own input
//! back inside the combined block) has its own read cursor. Writes never
//! overwrite unread data: if any consumer would lose bytes the whole write is
//! refused and the queue is left untouched.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("write of {len} bytes would overrun consumer {consumer}")]
    Overrun { len: usize, consumer: u8 },
    #[error("write of {0} bytes exceeds the queue capacity")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub player_number: u8,
    pub drop_count: u32,
    pub timeout_count: u32,
    pub small_lag_spikes: u32,
    pub large_lag_spikes: u32,
    pub bytes_written: u64,
}

#[derive(Debug)]
pub struct PlayerActionQueue {
    player_number: u8,
    buffer: Vec<u8>,
    written: u64,
    /// Absolute read position per consumer, indexed by player number - 1.
    heads: Vec<Option<u64>>,
    last_write: Option<Instant>,
    small_lag_threshold: Duration,
    large_lag_threshold: Duration,
    drop_count: u32,
    timeout_count: u32,
    small_lag_spikes: u32,
    large_lag_spikes: u32,
}

impl PlayerActionQueue {
    pub fn new(
        player_number: u8,
        num_consumers: usize,
        capacity: usize,
        small_lag_threshold: Duration,
        large_lag_threshold: Duration,
    ) -> Self {
        Self {
            player_number,
            buffer: vec![0; capacity],
            written: 0,
            heads: vec![Some(0); num_consumers],
            last_write: None,
            small_lag_threshold,
            large_lag_threshold,
            drop_count: 0,
            timeout_count: 0,
            small_lag_spikes: 0,
            large_lag_spikes: 0,
        }
    }

    pub fn player_number(&self) -> u8 {
        self.player_number
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn unread(&self, head: u64) -> usize {
        (self.written - head) as usize
    }

    /// Appends the source's actions for every consumer.
    pub fn add_actions(&mut self, data: &[u8], now: Instant) -> Result<(), QueueError> {
        let capacity = self.capacity();
        if data.len() > capacity {
            return Err(QueueError::TooLarge(data.len()));
        }
        for (index, head) in self.heads.iter().enumerate() {
            if let Some(head) = head {
                if self.unread(*head) + data.len() > capacity {
                    return Err(QueueError::Overrun {
                        len: data.len(),
                        consumer: index as u8 + 1,
                    });
                }
            }
        }

        let start = (self.written % capacity as u64) as usize;
        let first = data.len().min(capacity - start);
        self.buffer[start..start + first].copy_from_slice(&data[..first]);
        self.buffer[..data.len() - first].copy_from_slice(&data[first..]);
        self.written += data.len() as u64;

        if let Some(last) = self.last_write {
            let gap = now.saturating_duration_since(last);
            if gap > self.large_lag_threshold {
                self.large_lag_spikes += 1;
            } else if gap > self.small_lag_threshold {
                self.small_lag_spikes += 1;
            }
        }
        self.last_write = Some(now);
        self.timeout_count = 0;
        Ok(())
    }

    /// Unread bytes for `consumer`, or 0 if it no longer consumes.
    pub fn available(&self, consumer: u8) -> usize {
        self.head(consumer).map_or(0, |head| self.unread(head))
    }

    pub fn is_consumer(&self, consumer: u8) -> bool {
        self.head(consumer).is_some()
    }

    fn head(&self, consumer: u8) -> Option<u64> {
        let index = usize::from(consumer).checked_sub(1)?;
        self.heads.get(index).copied().flatten()
    }

    /// Takes exactly `len` bytes for `consumer`, or nothing if fewer are
    /// available.
    pub fn read(&mut self, consumer: u8, len: usize) -> Option<Vec<u8>> {
        let head = self.head(consumer)?;
        if self.unread(head) < len {
            return None;
        }
        let capacity = self.capacity();
        let start = (head % capacity as u64) as usize;
        let first = len.min(capacity - start);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.buffer[start..start + first]);
        out.extend_from_slice(&self.buffer[..len - first]);

        let index = usize::from(consumer) - 1;
        self.heads[index] = Some(head + len as u64);
        Some(out)
    }

    pub fn remove_consumer(&mut self, consumer: u8) {
        if let Some(index) = usize::from(consumer).checked_sub(1) {
            if let Some(head) = self.heads.get_mut(index) {
                *head = None;
            }
        }
    }

    /// Consumers holding more than `max_unread` bytes.
    pub fn lagging_consumers(&self, max_unread: usize) -> Vec<u8> {
        self.heads
            .iter()
            .enumerate()
            .filter_map(|(index, head)| {
                head.filter(|head| self.unread(*head) > max_unread)
                    .map(|_| index as u8 + 1)
            })
            .collect()
    }

    pub fn record_drop(&mut self) -> u32 {
        self.drop_count += 1;
        self.drop_count
    }

    /// Counts a stall; reset by the next successful write.
    pub fn record_timeout(&mut self) -> u32 {
        self.timeout_count += 1;
        self.timeout_count
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            player_number: self.player_number,
            drop_count: self.drop_count,
            timeout_count: self.timeout_count,
            small_lag_spikes: self.small_lag_spikes,
            large_lag_spikes: self.large_lag_spikes,
            bytes_written: self.written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(consumers: usize, capacity: usize) -> PlayerActionQueue {
        PlayerActionQueue::new(
            1,
            consumers,
            capacity,
            Duration::from_millis(50),
            Duration::from_millis(250),
        )
    }

    #[test]
    fn test_each_consumer_reads_independently() {
        let now = Instant::now();
        let mut q = queue(2, 16);
        q.add_actions(&[1, 2, 3, 4], now).unwrap();

        assert_eq!(q.available(1), 4);
        assert_eq!(q.read(1, 2), Some(vec![1, 2]));
        assert_eq!(q.available(1), 2);
        assert_eq!(q.available(2), 4);
        assert_eq!(q.read(2, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(q.read(2, 1), None);
    }

    #[test]
    fn test_wraparound() {
        let now = Instant::now();
        let mut q = queue(1, 8);
        q.add_actions(&[1, 2, 3, 4, 5, 6], now).unwrap();
        assert_eq!(q.read(1, 6), Some(vec![1, 2, 3, 4, 5, 6]));

        q.add_actions(&[7, 8, 9, 10, 11], now).unwrap();
        assert_eq!(q.read(1, 5), Some(vec![7, 8, 9, 10, 11]));
    }

    #[test]
    fn test_overflow_leaves_queue_unchanged() {
        let now = Instant::now();
        let mut q = queue(2, 8);
        q.add_actions(&[1, 2, 3, 4, 5, 6], now).unwrap();
        q.read(1, 6).unwrap();

        // consumer 2 still holds 6 unread bytes
        assert_eq!(
            q.add_actions(&[7, 8, 9], now),
            Err(QueueError::Overrun {
                len: 3,
                consumer: 2
            })
        );
        assert_eq!(q.available(1), 0);
        assert_eq!(q.available(2), 6);
        assert_eq!(q.stats().bytes_written, 6);
        assert_eq!(q.read(2, 6), Some(vec![1, 2, 3, 4, 5, 6]));

        assert_eq!(q.add_actions(&[0; 9], now), Err(QueueError::TooLarge(9)));
    }

    #[test]
    fn test_removed_consumer_no_longer_blocks() {
        let now = Instant::now();
        let mut q = queue(2, 4);
        q.add_actions(&[1, 2, 3, 4], now).unwrap();
        q.read(1, 4).unwrap();
        assert!(q.add_actions(&[5], now).is_err());

        q.remove_consumer(2);
        assert!(!q.is_consumer(2));
        assert_eq!(q.available(2), 0);
        assert!(q.add_actions(&[5], now).is_ok());
    }

    #[test]
    fn test_lagging_consumers() {
        let now = Instant::now();
        let mut q = queue(3, 64);
        q.add_actions(&[0; 10], now).unwrap();
        q.read(1, 10).unwrap();
        q.read(2, 5).unwrap();
        // exactly at the limit is not lagging
        assert_eq!(q.available(2), 5);
        assert_eq!(q.lagging_consumers(5), vec![3]);
        assert_eq!(q.lagging_consumers(4), vec![2, 3]);
    }

    #[test]
    fn test_lag_spikes_and_counters() {
        let start = Instant::now();
        let mut q = queue(1, 64);
        q.add_actions(&[0], start).unwrap();
        q.add_actions(&[0], start + Duration::from_millis(20)).unwrap();
        q.add_actions(&[0], start + Duration::from_millis(100)).unwrap();
        q.add_actions(&[0], start + Duration::from_millis(400)).unwrap();

        let stats = q.stats();
        assert_eq!(stats.small_lag_spikes, 1);
        assert_eq!(stats.large_lag_spikes, 1);

        assert_eq!(q.record_timeout(), 1);
        assert_eq!(q.record_timeout(), 2);
        q.add_actions(&[0], start + Duration::from_millis(410)).unwrap();
        assert_eq!(q.stats().timeout_count, 0);

        assert_eq!(q.record_drop(), 1);
        assert_eq!(q.stats().drop_count, 1);
    }

    #[test]
    fn test_invalid_consumer_numbers() {
        let q = queue(2, 8);
        assert_eq!(q.available(0), 0);
        assert_eq!(q.available(3), 0);
        assert!(!q.is_consumer(0));
    }
}
