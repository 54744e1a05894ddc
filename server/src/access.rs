//! Access policy consulted by the rendezvous listener and at login.

use crate::config::AccessConfig;
use crate::timer::DelayedTasks;
use log::info;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessLevel {
    Banned,
    Normal,
    Admin,
}

/// Allow/deny decisions per address. Implementations must be cheap; they
/// are called for every handshake.
pub trait AccessPolicy: Send + Sync {
    fn is_address_allowed(&self, address: IpAddr) -> bool;
    fn access_level(&self, address: IpAddr) -> AccessLevel;
    fn add_temp_ban(&self, address: IpAddr, duration: Duration);
    fn clear_temp_ban(&self, address: IpAddr) -> bool;
}

type BanTable = Arc<Mutex<HashMap<IpAddr, Instant>>>;

fn lock_bans(bans: &Mutex<HashMap<IpAddr, Instant>>) -> MutexGuard<'_, HashMap<IpAddr, Instant>> {
    bans.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory policy built from the static address lists in the config.
/// Temporary bans expire on their own.
pub struct AccessManager {
    admins: HashSet<IpAddr>,
    denied: HashSet<IpAddr>,
    temp_bans: BanTable,
    expiry: DelayedTasks<IpAddr>,
}

impl AccessManager {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            admins: config.admins.iter().copied().collect(),
            denied: config.denied.iter().copied().collect(),
            temp_bans: Arc::new(Mutex::new(HashMap::new())),
            expiry: DelayedTasks::new(),
        }
    }

    fn is_temp_banned(&self, address: IpAddr) -> bool {
        lock_bans(&self.temp_bans)
            .get(&address)
            .is_some_and(|until| *until > Instant::now())
    }

    pub fn temp_ban_count(&self) -> usize {
        let now = Instant::now();
        lock_bans(&self.temp_bans)
            .values()
            .filter(|until| **until > now)
            .count()
    }
}

impl Default for AccessManager {
    fn default() -> Self {
        Self::new(&AccessConfig::default())
    }
}

impl AccessPolicy for AccessManager {
    fn is_address_allowed(&self, address: IpAddr) -> bool {
        if self.admins.contains(&address) {
            return true;
        }
        !self.denied.contains(&address) && !self.is_temp_banned(address)
    }

    fn access_level(&self, address: IpAddr) -> AccessLevel {
        if self.admins.contains(&address) {
            AccessLevel::Admin
        } else if self.denied.contains(&address) || self.is_temp_banned(address) {
            AccessLevel::Banned
        } else {
            AccessLevel::Normal
        }
    }

    fn add_temp_ban(&self, address: IpAddr, duration: Duration) {
        let until = Instant::now() + duration;
        lock_bans(&self.temp_bans).insert(address, until);
        info!("Temporarily banned {} for {:?}", address, duration);

        let bans = Arc::clone(&self.temp_bans);
        self.expiry.schedule(address, duration, async move {
            let mut bans = lock_bans(&bans);
            if bans.get(&address).is_some_and(|until| *until <= Instant::now()) {
                bans.remove(&address);
                info!("Temporary ban on {} expired", address);
            }
        });
    }

    fn clear_temp_ban(&self, address: IpAddr) -> bool {
        self.expiry.cancel(&address);
        lock_bans(&self.temp_bans).remove(&address).is_some()
    }
}
