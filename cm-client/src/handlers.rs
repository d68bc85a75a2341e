//! Dispatcher handlers that keep the caches in step with the server.

use crate::auth::AuthStateMachine;
use crate::cache::{Caches, License, LocalPlaytimeSource, Relationship};
use crate::credentials::{CredentialStore, OWNERSHIP_TICKET};
use crate::dispatcher::{Handler, Outbound};
use crate::error::Result;
use async_trait::async_trait;
use cm_proto::{EResult, Message, MessageKind, Payload};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on ids per product-info request.
pub const PRODUCT_INFO_CHUNK: usize = 1000;

/// Persona fields asked for when requesting friend data.
pub const FRIEND_DATA_FLAGS: u32 = 1106;

pub struct LicenseHandler {
    caches: Caches,
    auth: Arc<AuthStateMachine>,
}

impl LicenseHandler {
    pub const KINDS: &'static [MessageKind] = &[
        MessageKind::ClientLicenseList,
        MessageKind::ClientPicsProductInfoResponse,
    ];

    pub fn new(caches: Caches, auth: Arc<AuthStateMachine>) -> Self {
        Self { caches, auth }
    }
}

#[async_trait]
impl Handler for LicenseHandler {
    async fn handle(&self, message: &Message, outbound: &Outbound) -> Result<()> {
        match &message.payload {
            Payload::ClientLicenseList(body) => {
                if body.result != EResult::Ok {
                    warn!("License list failed: {}", body.result);
                    return Ok(());
                }

                let account_id = self.auth.account().account_id();
                let licenses: Vec<License> = body
                    .licenses
                    .iter()
                    .map(|record| License {
                        package_id: record.package_id,
                        shared: record.owner_id != 0 && record.owner_id != account_id,
                        access_token: record.access_token,
                    })
                    .collect();

                let import = self.caches.licenses.write().await.reconcile(&licenses);
                info!(
                    "Received {} licenses, requesting {} packages",
                    licenses.len(),
                    import.to_request.len()
                );

                for chunk in import.to_request.chunks(PRODUCT_INFO_CHUNK) {
                    outbound.send(Message::packages_info(chunk.to_vec()))?;
                }
            }
            Payload::ClientPicsProductInfoResponse(body) => {
                let new_apps = {
                    let mut licenses = self.caches.licenses.write().await;
                    let new_apps = licenses.on_package_info(&body.packages);
                    licenses.on_app_info(&body.apps);
                    new_apps
                };

                for chunk in new_apps.chunks(PRODUCT_INFO_CHUNK) {
                    outbound.send(Message::apps_info(chunk.to_vec()))?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct FriendsHandler {
    caches: Caches,
}

impl FriendsHandler {
    pub const KINDS: &'static [MessageKind] = &[
        MessageKind::ClientFriendsList,
        MessageKind::ClientPersonaState,
        MessageKind::ClientPlayerNicknameList,
    ];

    pub fn new(caches: Caches) -> Self {
        Self { caches }
    }
}

#[async_trait]
impl Handler for FriendsHandler {
    async fn handle(&self, message: &Message, outbound: &Outbound) -> Result<()> {
        match &message.payload {
            Payload::ClientFriendsList(body) => {
                let entries: Vec<(u64, Relationship)> = body
                    .friends
                    .iter()
                    .map(|f| (f.steam_id, Relationship::from_code(f.relationship)))
                    .collect();

                let (added, all) = {
                    let mut friends = self.caches.friends.write().await;
                    let added = friends.apply_relationships(body.incremental, &entries);
                    let all: Vec<u64> = friends.friends().iter().map(|f| f.user_id).collect();
                    (added, all)
                };

                if body.incremental {
                    if !added.is_empty() {
                        outbound.send(Message::request_friend_data(FRIEND_DATA_FLAGS, added))?;
                    }
                } else {
                    info!("Friends list: {} friends", all.len());
                    outbound.send(Message::change_status(
                        crate::cache::PersonaState::Invisible.code(),
                    ))?;
                    if !all.is_empty() {
                        outbound.send(Message::request_friend_data(FRIEND_DATA_FLAGS, all))?;
                    }
                }
            }
            Payload::ClientPersonaState(body) => {
                let mut friends = self.caches.friends.write().await;
                for info in &body.friends {
                    friends.update_persona(info);
                }
            }
            Payload::ClientPlayerNicknameList(body) => {
                self.caches.friends.write().await.set_nicknames(
                    body.nicknames
                        .iter()
                        .map(|n| (n.steam_id, n.nickname.clone())),
                );
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct StatsHandler {
    caches: Caches,
}

impl StatsHandler {
    pub const KINDS: &'static [MessageKind] = &[MessageKind::ClientGetUserStatsResponse];

    pub fn new(caches: Caches) -> Self {
        Self { caches }
    }
}

#[async_trait]
impl Handler for StatsHandler {
    async fn handle(&self, message: &Message, _outbound: &Outbound) -> Result<()> {
        if let Payload::ClientGetUserStatsResponse(body) = &message.payload {
            let mut stats = self.caches.stats.write().await;
            if body.result == EResult::Ok {
                stats.update(body);
            } else {
                warn!("Stats for game {} failed: {}", body.game_id, body.result);
                stats.abandon(body.game_id);
            }
        }
        Ok(())
    }
}

pub struct TimesHandler {
    caches: Caches,
    auth: Arc<AuthStateMachine>,
    local: Option<Arc<dyn LocalPlaytimeSource>>,
}

impl TimesHandler {
    pub const KINDS: &'static [MessageKind] = &[MessageKind::PlayerGetLastPlayedTimesResponse];

    pub fn new(
        caches: Caches,
        auth: Arc<AuthStateMachine>,
        local: Option<Arc<dyn LocalPlaytimeSource>>,
    ) -> Self {
        Self {
            caches,
            auth,
            local,
        }
    }
}

#[async_trait]
impl Handler for TimesHandler {
    async fn handle(&self, message: &Message, _outbound: &Outbound) -> Result<()> {
        let Payload::PlayerGetLastPlayedTimesResponse(body) = &message.payload else {
            return Ok(());
        };

        let local = match &self.local {
            Some(source) => match source.load(self.auth.account().account_id()) {
                Ok(local) => local,
                Err(e) => {
                    warn!("Could not read local playtime: {}", e);
                    Default::default()
                }
            },
            None => Default::default(),
        };

        let shared: Vec<u32> = self
            .caches
            .licenses
            .read()
            .await
            .shared_games()
            .iter()
            .map(|app| app.app_id)
            .collect();

        let mut times = self.caches.times.write().await;
        times.update(&body.games);
        times.merge_local(&shared, &local);
        Ok(())
    }
}

pub struct TicketHandler {
    caches: Caches,
    store: Arc<dyn CredentialStore>,
}

impl TicketHandler {
    pub const KINDS: &'static [MessageKind] =
        &[MessageKind::ClientGetAppOwnershipTicketResponse];

    pub fn new(caches: Caches, store: Arc<dyn CredentialStore>) -> Self {
        Self { caches, store }
    }
}

#[async_trait]
impl Handler for TicketHandler {
    async fn handle(&self, message: &Message, _outbound: &Outbound) -> Result<()> {
        let Payload::ClientGetAppOwnershipTicketResponse(body) = &message.payload else {
            return Ok(());
        };

        if body.result != EResult::Ok {
            warn!("Ownership ticket for app {} failed: {}", body.app_id, body.result);
            return Ok(());
        }

        let ticket = match hex::decode(&body.ticket) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("Malformed ownership ticket for app {}: {}", body.app_id, e);
                return Ok(());
            }
        };

        let kept = self.caches.ticket.write().await.store(body.app_id, ticket.clone());
        if kept {
            if let Err(e) = self.store.set(OWNERSHIP_TICKET, &ticket).await {
                warn!("Could not persist ownership ticket: {}", e);
            }
            debug!("Stored ownership ticket ({} bytes)", ticket.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AchievementCache;
    use crate::credentials::MemoryStore;
    use cm_proto::{
        AppOwnershipTicketBody, FriendRelationship, FriendsListBody, LicenseListBody,
        LicenseRecord, PackageInfo, ProductInfoBody,
    };
    use std::time::Duration;

    fn setup() -> (Caches, Arc<AuthStateMachine>, Outbound, crate::dispatcher::OutboundReceiver) {
        let (outbound, rx) = Outbound::new();
        let auth = Arc::new(AuthStateMachine::new(
            outbound.clone(),
            vec![0; 32],
            Duration::from_secs(1),
        ));
        (Caches::new(12_000, AchievementCache::new()), auth, outbound, rx)
    }

    #[tokio::test]
    async fn test_license_list_requests_in_chunks() {
        let (caches, auth, outbound, _rx) = setup();
        let handler = LicenseHandler::new(caches.clone(), auth);

        let records: Vec<LicenseRecord> = (1..=2500)
            .map(|package_id| LicenseRecord {
                package_id,
                time_created: 0,
                license_type: 0,
                flags: 0,
                owner_id: 0,
                access_token: 0,
            })
            .collect();
        let list = Message::new(Payload::ClientLicenseList(LicenseListBody {
            result: EResult::Ok,
            licenses: records,
        }));

        handler.handle(&list, &outbound).await.unwrap();

        let licenses = caches.licenses.read().await;
        assert!(licenses.package(2500).unwrap().importing);
        assert!(!licenses.is_ready());
    }

    #[tokio::test]
    async fn test_package_info_resolves() {
        let (caches, auth, outbound, _rx) = setup();
        let handler = LicenseHandler::new(caches.clone(), auth);
        caches.licenses.write().await.reconcile(&[License {
            package_id: 5,
            shared: false,
            access_token: 0,
        }]);

        let info = Message::new(Payload::ClientPicsProductInfoResponse(ProductInfoBody {
            packages: vec![PackageInfo {
                package_id: 5,
                app_ids: vec![50],
            }],
            ..ProductInfoBody::default()
        }));
        handler.handle(&info, &outbound).await.unwrap();

        assert!(caches.licenses.read().await.package(5).unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_friends_incremental_removal() {
        let (caches, _auth, outbound, _rx) = setup();
        let handler = FriendsHandler::new(caches.clone());
        let list = |incremental, friends: &[(u64, u32)]| {
            Message::new(Payload::ClientFriendsList(FriendsListBody {
                incremental,
                friends: friends
                    .iter()
                    .map(|(steam_id, relationship)| FriendRelationship {
                        steam_id: *steam_id,
                        relationship: *relationship,
                    })
                    .collect(),
            }))
        };

        handler.handle(&list(false, &[(1, 3), (2, 3)]), &outbound).await.unwrap();
        handler.handle(&list(true, &[(1, 0)]), &outbound).await.unwrap();

        let friends = caches.friends.read().await;
        assert!(friends.get(1).is_none());
        assert!(friends.get(2).is_some());
    }

    #[tokio::test]
    async fn test_ticket_persisted_for_client_app_only() {
        let (caches, _auth, outbound, _rx) = setup();
        let store = Arc::new(MemoryStore::new());
        let handler = TicketHandler::new(caches.clone(), store.clone());
        let reply = |app_id| {
            Message::new(Payload::ClientGetAppOwnershipTicketResponse(
                AppOwnershipTicketBody {
                    result: EResult::Ok,
                    app_id,
                    ticket: "c0ffee".to_string(),
                },
            ))
        };

        handler.handle(&reply(440), &outbound).await.unwrap();
        assert!(store.get(OWNERSHIP_TICKET).await.is_none());

        handler.handle(&reply(cm_proto::CLIENT_APP_ID), &outbound).await.unwrap();
        assert_eq!(store.get(OWNERSHIP_TICKET).await, Some(vec![0xc0, 0xff, 0xee]));
        assert!(caches.ticket.read().await.get().is_some());
    }
}
