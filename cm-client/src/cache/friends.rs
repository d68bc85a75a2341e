use cm_proto::PersonaInfo;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    None,
    Blocked,
    RequestRecipient,
    Friend,
    RequestInitiator,
    Ignored,
    IgnoredFriend,
    Unknown(u32),
}

impl Relationship {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Relationship::None,
            1 => Relationship::Blocked,
            2 => Relationship::RequestRecipient,
            3 => Relationship::Friend,
            4 => Relationship::RequestInitiator,
            5 => Relationship::Ignored,
            6 => Relationship::IgnoredFriend,
            other => Relationship::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersonaState {
    #[default]
    Offline,
    Online,
    Busy,
    Away,
    Snooze,
    LookingToTrade,
    LookingToPlay,
    Invisible,
}

impl PersonaState {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => PersonaState::Online,
            2 => PersonaState::Busy,
            3 => PersonaState::Away,
            4 => PersonaState::Snooze,
            5 => PersonaState::LookingToTrade,
            6 => PersonaState::LookingToPlay,
            7 => PersonaState::Invisible,
            _ => PersonaState::Offline,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayingGame {
    pub app_id: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friend {
    pub user_id: u64,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub state: PersonaState,
    pub game: Option<PlayingGame>,
}

impl Friend {
    fn new(user_id: u64, nickname: Option<String>) -> Self {
        Self {
            user_id,
            name: None,
            nickname,
            state: PersonaState::Offline,
            game: None,
        }
    }

    /// Nickname when one is set, persona name otherwise.
    pub fn display_name(&self) -> Option<&str> {
        self.nickname.as_deref().or(self.name.as_deref())
    }
}

/// Only users whose declared relationship is `Friend` are kept.
#[derive(Debug, Default)]
pub struct FriendsCache {
    friends: BTreeMap<u64, Friend>,
    nicknames: HashMap<u64, String>,
}

impl FriendsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a relationship list and returns users who just became friends.
    ///
    /// A full snapshot replaces everything; an incremental one adds and
    /// removes individual users.
    pub fn apply_relationships(
        &mut self,
        incremental: bool,
        entries: &[(u64, Relationship)],
    ) -> Vec<u64> {
        if !incremental {
            self.friends.clear();
        }

        let mut added = Vec::new();
        for (user_id, relationship) in entries {
            if *relationship == Relationship::Friend {
                if !self.friends.contains_key(user_id) {
                    let nickname = self.nicknames.get(user_id).cloned();
                    self.friends.insert(*user_id, Friend::new(*user_id, nickname));
                    added.push(*user_id);
                }
            } else if self.friends.remove(user_id).is_some() {
                debug!("User {} is no longer a friend ({:?})", user_id, relationship);
            }
        }
        added
    }

    /// Updates presence for a friend. Returns false for non-friends.
    pub fn update_persona(&mut self, info: &PersonaInfo) -> bool {
        let Some(friend) = self.friends.get_mut(&info.steam_id) else {
            debug!("Ignoring persona update for non-friend {}", info.steam_id);
            return false;
        };

        if let Some(name) = &info.player_name {
            friend.name = Some(name.clone());
        }
        if let Some(state) = info.persona_state {
            friend.state = PersonaState::from_code(state);
        }
        friend.game = match info.game_played_app_id {
            Some(app_id) if app_id != 0 => Some(PlayingGame {
                app_id,
                name: info.game_name.clone(),
            }),
            _ => None,
        };
        true
    }

    /// Replaces the nickname overrides.
    pub fn set_nicknames(&mut self, nicknames: impl IntoIterator<Item = (u64, String)>) {
        self.nicknames = nicknames.into_iter().collect();
        for friend in self.friends.values_mut() {
            friend.nickname = self.nicknames.get(&friend.user_id).cloned();
        }
    }

    pub fn get(&self, user_id: u64) -> Option<&Friend> {
        self.friends.get(&user_id)
    }

    pub fn friends(&self) -> Vec<Friend> {
        self.friends.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRIEND: Relationship = Relationship::Friend;

    #[test]
    fn test_friend_to_none_removes() {
        let mut cache = FriendsCache::new();
        cache.apply_relationships(false, &[(1, FRIEND), (2, FRIEND)]);

        let added = cache.apply_relationships(true, &[(1, Relationship::None), (3, FRIEND)]);

        assert_eq!(added, vec![3]);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_full_snapshot_replaces() {
        let mut cache = FriendsCache::new();
        cache.apply_relationships(false, &[(1, FRIEND), (2, FRIEND)]);

        cache.apply_relationships(false, &[(3, FRIEND), (4, Relationship::RequestRecipient)]);

        let ids: Vec<u64> = cache.friends().iter().map(|f| f.user_id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_persona_update_ignores_strangers() {
        let mut cache = FriendsCache::new();
        cache.apply_relationships(false, &[(1, FRIEND)]);

        let stranger = PersonaInfo {
            steam_id: 9,
            player_name: Some("Stranger".to_string()),
            ..PersonaInfo::default()
        };
        assert!(!cache.update_persona(&stranger));
        assert!(cache.get(9).is_none());

        let friend = PersonaInfo {
            steam_id: 1,
            player_name: Some("Alyx".to_string()),
            persona_state: Some(1),
            game_name: Some("Half-Life".to_string()),
            game_played_app_id: Some(70),
        };
        assert!(cache.update_persona(&friend));

        let alyx = cache.get(1).unwrap();
        assert_eq!(alyx.state, PersonaState::Online);
        assert_eq!(alyx.game.as_ref().unwrap().app_id, 70);
    }

    #[test]
    fn test_nickname_overrides_name() {
        let mut cache = FriendsCache::new();
        cache.set_nicknames(vec![(1, "Doc".to_string())]);
        cache.apply_relationships(false, &[(1, FRIEND)]);
        cache.update_persona(&PersonaInfo {
            steam_id: 1,
            player_name: Some("Eli".to_string()),
            ..PersonaInfo::default()
        });

        assert_eq!(cache.get(1).unwrap().display_name(), Some("Doc"));

        cache.set_nicknames(Vec::new());
        assert_eq!(cache.get(1).unwrap().display_name(), Some("Eli"));
    }
}
