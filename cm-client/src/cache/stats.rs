use cm_proto::{AchievementBlock, UserStatsBody};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Slots per achievement block.
pub const BLOCK_BITS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedAchievement {
    /// `32 * (block - 1) + bit`
    pub id: u32,
    pub api_name: String,
    pub display_name: Option<String>,
    pub unlock_time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameStats {
    pub game_id: u64,
    pub stats: BTreeMap<u32, u32>,
    pub achievements: Vec<UnlockedAchievement>,
}

fn display_name(bit: &Value) -> Option<String> {
    match &bit["display"]["name"] {
        Value::String(name) => Some(name.clone()),
        Value::Object(localized) => localized
            .get("english")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Decodes unlocked achievements from bit blocks using the stats schema.
///
/// The schema is `stats.<block>.bits.<bit>` with a `name` and an optional
/// `display.name`. Blocks or bits the schema does not describe are skipped.
pub fn decode_achievements(blocks: &[AchievementBlock], schema: &Value) -> Vec<UnlockedAchievement> {
    let mut unlocked = Vec::new();

    for block in blocks {
        if block.achievement_id == 0 {
            warn!("Skipping achievement block with id 0");
            continue;
        }

        let block_schema = &schema["stats"][block.achievement_id.to_string()];
        if block_schema.is_null() {
            warn!("No schema for achievement block {}", block.achievement_id);
            continue;
        }

        for (bit, &unlock_time) in block.unlock_time.iter().enumerate() {
            if unlock_time == 0 {
                continue;
            }
            if bit >= BLOCK_BITS {
                warn!(
                    "Achievement block {} has more than {} bits",
                    block.achievement_id, BLOCK_BITS
                );
                break;
            }

            let bit_schema = &block_schema["bits"][bit.to_string()];
            let Some(api_name) = bit_schema["name"].as_str() else {
                warn!(
                    "No schema for bit {} of achievement block {}",
                    bit, block.achievement_id
                );
                continue;
            };

            let id = (block.achievement_id - 1)
                .checked_mul(BLOCK_BITS as u32)
                .and_then(|base| base.checked_add(bit as u32));
            let Some(id) = id else {
                warn!(
                    "Achievement id out of range for bit {} of block {}",
                    bit, block.achievement_id
                );
                continue;
            };

            unlocked.push(UnlockedAchievement {
                id,
                api_name: api_name.to_string(),
                display_name: display_name(bit_schema),
                unlock_time,
            });
        }
    }

    unlocked
}

#[derive(Debug, Default)]
pub struct StatsCache {
    games: HashMap<u64, GameStats>,
    pending: HashSet<u64>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks games whose stats have been requested.
    pub fn expect(&mut self, game_ids: impl IntoIterator<Item = u64>) {
        self.pending.extend(game_ids);
    }

    pub fn update(&mut self, body: &UserStatsBody) {
        self.pending.remove(&body.game_id);

        let achievements = decode_achievements(&body.achievement_blocks, &body.schema);
        debug!(
            "Stats for game {}: {} stats, {} unlocked achievements",
            body.game_id,
            body.stats.len(),
            achievements.len()
        );

        self.games.insert(
            body.game_id,
            GameStats {
                game_id: body.game_id,
                stats: body.stats.iter().map(|s| (s.stat_id, s.stat_value)).collect(),
                achievements,
            },
        );
    }

    /// Drops a pending game whose request failed.
    pub fn abandon(&mut self, game_id: u64) {
        self.pending.remove(&game_id);
    }

    pub fn get(&self, game_id: u64) -> Option<&GameStats> {
        self.games.get(&game_id)
    }

    /// True when no requested game is still outstanding.
    pub fn is_ready(&self) -> bool {
        self.pending.is_empty()
    }
}
