use chrono::{DateTime, TimeZone, Utc};
use cm_proto::PlayedGame;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

pub type AppId = u32;

/// Last-played value meaning "never played".
pub const LAST_PLAYED_UNKNOWN: u32 = 86400;

fn last_played(raw: u32) -> Option<u32> {
    match raw {
        0 | LAST_PLAYED_UNKNOWN => None,
        ts => Some(ts),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameTime {
    pub game_id: AppId,
    pub minutes_played: u32,
    /// Unix seconds; `None` when never played.
    pub last_played: Option<u32>,
}

impl GameTime {
    pub fn last_played_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.last_played?;
        Utc.timestamp_opt(ts as i64, 0).single()
    }
}

/// Playtime recorded by the local client for one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LocalPlaytime {
    #[serde(default)]
    pub minutes_played: u32,
    #[serde(default)]
    pub last_played: u32,
}

/// Read-only source of locally recorded playtime.
pub trait LocalPlaytimeSource: Send + Sync {
    fn load(&self, account_id: u32) -> anyhow::Result<HashMap<AppId, LocalPlaytime>>;
}

/// Per-account JSON file `<root>/<account_id>/playtime.json` keyed by app id.
#[derive(Debug, Clone)]
pub struct JsonPlaytimeDir {
    root: PathBuf,
}

impl JsonPlaytimeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl LocalPlaytimeSource for JsonPlaytimeDir {
    fn load(&self, account_id: u32) -> anyhow::Result<HashMap<AppId, LocalPlaytime>> {
        let path = self.root.join(account_id.to_string()).join("playtime.json");
        let contents = std::fs::read_to_string(&path)?;
        let raw: HashMap<String, LocalPlaytime> = serde_json::from_str(&contents)?;

        let mut times = HashMap::with_capacity(raw.len());
        for (key, playtime) in raw {
            match key.parse::<AppId>() {
                Ok(app_id) => {
                    times.insert(app_id, playtime);
                }
                Err(_) => warn!("Skipping non-numeric app id {:?} in {}", key, path.display()),
            }
        }
        Ok(times)
    }
}

#[derive(Debug, Default)]
pub struct TimesCache {
    times: BTreeMap<AppId, GameTime>,
    import_finished: bool,
}

impl TimesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores server-reported playtime and marks the import finished.
    pub fn update(&mut self, games: &[PlayedGame]) {
        for game in games {
            self.times.insert(
                game.app_id,
                GameTime {
                    game_id: game.app_id,
                    minutes_played: game.playtime_forever,
                    last_played: last_played(game.last_playtime),
                },
            );
        }
        self.import_finished = true;
        debug!("Imported playtime for {} games", games.len());
    }

    /// Fills in shared games the server reported nothing for. A shared game
    /// with no local record either is stored as never played.
    pub fn merge_local(&mut self, shared_games: &[AppId], local: &HashMap<AppId, LocalPlaytime>) {
        for app_id in shared_games {
            let server_has_time = self
                .times
                .get(app_id)
                .map(|t| t.minutes_played > 0)
                .unwrap_or(false);
            if server_has_time {
                continue;
            }
            match local.get(app_id) {
                Some(playtime) => {
                    self.times.insert(
                        *app_id,
                        GameTime {
                            game_id: *app_id,
                            minutes_played: playtime.minutes_played,
                            last_played: last_played(playtime.last_played),
                        },
                    );
                }
                None => {
                    self.times.entry(*app_id).or_insert(GameTime {
                        game_id: *app_id,
                        minutes_played: 0,
                        last_played: None,
                    });
                }
            }
        }
    }

    pub fn get(&self, game_id: AppId) -> Option<&GameTime> {
        self.times.get(&game_id)
    }

    pub fn all(&self) -> Vec<GameTime> {
        self.times.values().copied().collect()
    }

    pub fn is_import_finished(&self) -> bool {
        self.import_finished
    }
}
