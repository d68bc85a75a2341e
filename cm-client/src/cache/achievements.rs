//! Fingerprint-keyed cache of unlocked achievements.
//!
//! An entry is only served while the game's fingerprint (last played,
//! minutes played) is unchanged. Stale entries are never evicted; they are
//! simply missed and overwritten by the next fetch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub last_played: u32,
    pub minutes_played: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAchievement {
    pub unlock_time: u32,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    fingerprint: Fingerprint,
    achievements: Vec<CachedAchievement>,
}

#[derive(Debug, Default)]
pub struct AchievementCache {
    entries: HashMap<u64, Entry>,
    dirty: bool,
}

impl AchievementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, game_id: u64, fingerprint: Fingerprint) -> Option<&[CachedAchievement]> {
        self.entries
            .get(&game_id)
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.achievements.as_slice())
    }

    pub fn update(
        &mut self,
        game_id: u64,
        achievements: Vec<CachedAchievement>,
        fingerprint: Fingerprint,
    ) {
        self.entries.insert(
            game_id,
            Entry {
                fingerprint,
                achievements,
            },
        );
        self.dirty = true;
    }

    /// True when entries changed since the last load or save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn to_json(&mut self) -> serde_json::Result<String> {
        let json = serde_json::to_string(&self.entries)?;
        self.dirty = false;
        Ok(json)
    }

    /// Loads a saved cache; anything unreadable yields an empty cache.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str(json) {
            Ok(entries) => Self {
                entries,
                dirty: false,
            },
            Err(e) => {
                warn!("Discarding corrupt achievement cache: {}", e);
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
