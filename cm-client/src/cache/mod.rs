//! Session-scoped caches fed by the dispatcher handlers.
//!
//! Handlers are the only writers and run one at a time, so each cache sits
//! behind its own lock with no cross-cache ordering. Readers may observe a
//! cache between two updates.

pub mod achievements;
pub mod friends;
pub mod licenses;
pub mod stats;
pub mod ticket;
pub mod times;

pub use achievements::{AchievementCache, CachedAchievement, Fingerprint};
pub use friends::{Friend, FriendsCache, PersonaState, Relationship};
pub use licenses::{AppEntry, License, LicenseCache, LicenseImport};
pub use stats::{GameStats, StatsCache, UnlockedAchievement};
pub use ticket::OwnershipTicketCache;
pub use times::{
    GameTime, JsonPlaytimeDir, LocalPlaytime, LocalPlaytimeSource, TimesCache, LAST_PLAYED_UNKNOWN,
};

use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct Caches {
    pub licenses: Arc<RwLock<LicenseCache>>,
    pub friends: Arc<RwLock<FriendsCache>>,
    pub stats: Arc<RwLock<StatsCache>>,
    pub times: Arc<RwLock<TimesCache>>,
    pub achievements: Arc<RwLock<AchievementCache>>,
    pub ticket: Arc<RwLock<OwnershipTicketCache>>,
}

impl Caches {
    pub fn new(license_reset_threshold: usize, achievements: AchievementCache) -> Self {
        Self {
            licenses: Arc::new(RwLock::new(LicenseCache::new(license_reset_threshold))),
            friends: Arc::new(RwLock::new(FriendsCache::new())),
            stats: Arc::new(RwLock::new(StatsCache::new())),
            times: Arc::new(RwLock::new(TimesCache::new())),
            achievements: Arc::new(RwLock::new(achievements)),
            ticket: Arc::new(RwLock::new(OwnershipTicketCache::new())),
        }
    }
}
