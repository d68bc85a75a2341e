//! Session facade: one authenticated connection to a CM.

use crate::auth::{
    AccountInfo, AuthChallenge, AuthLostHandler, AuthState, AuthStateMachine, KeyExchange,
    LoginOutcome, PollStatus,
};
use crate::cache::{
    AchievementCache, CachedAchievement, Caches, Fingerprint, GameTime, LocalPlaytimeSource,
};
use crate::channel;
use crate::config::SessionConfig;
use crate::credentials::{self, CredentialStore};
use crate::dispatcher::{wait_reply, Dispatcher, HandlerTable, Outbound};
use crate::error::{Result, SessionError};
use crate::handlers::{FriendsHandler, LicenseHandler, StatsHandler, TicketHandler, TimesHandler};
use cm_proto::{CmFrameCodec, Collection, EResult, Message, Payload, CLIENT_APP_ID};
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Optional collaborators for a session.
#[derive(Default)]
pub struct SessionExtras {
    pub local_playtime: Option<Arc<dyn LocalPlaytimeSource>>,
    /// Warm-start contents for the achievement cache.
    pub achievement_cache: AchievementCache,
}

pub struct Session {
    outbound: Outbound,
    auth: Arc<AuthStateMachine>,
    caches: Caches,
    store: Arc<dyn CredentialStore>,
    reply_timeout: Duration,
    achievement_permits: Arc<Semaphore>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Session {
    pub async fn connect<S>(
        stream: S,
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_with(stream, config, store, SessionExtras::default()).await
    }

    /// Sets up the channel, announces the client and starts dispatching.
    pub async fn connect_with<S>(
        stream: S,
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        extras: SessionExtras,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let machine_id = credentials::ensure_machine_id(store.as_ref()).await?;

        let mut framed = Framed::new(stream, CmFrameCodec::new(config.max_frame_bytes));
        if let Some(psk) = &config.channel_psk {
            channel::establish(&mut framed, psk, config.reply_timeout).await?;
        }
        framed.send(Message::hello()).await?;
        debug!("Sent hello");

        let (outbound, receiver) = Outbound::new();
        let auth = Arc::new(AuthStateMachine::new(
            outbound.clone(),
            machine_id,
            config.reply_timeout,
        ));
        let caches = Caches::new(config.license_reset_threshold, extras.achievement_cache);

        let handlers = HandlerTable::builder()
            .route_all(AuthStateMachine::KINDS, auth.clone())
            .route_all(
                LicenseHandler::KINDS,
                Arc::new(LicenseHandler::new(caches.clone(), auth.clone())),
            )
            .route_all(
                FriendsHandler::KINDS,
                Arc::new(FriendsHandler::new(caches.clone())),
            )
            .route_all(StatsHandler::KINDS, Arc::new(StatsHandler::new(caches.clone())))
            .route_all(
                TimesHandler::KINDS,
                Arc::new(TimesHandler::new(
                    caches.clone(),
                    auth.clone(),
                    extras.local_playtime,
                )),
            )
            .route_all(
                TicketHandler::KINDS,
                Arc::new(TicketHandler::new(caches.clone(), store.clone())),
            )
            .build();

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            framed,
            handlers,
            outbound.clone(),
            receiver,
            cancel.clone(),
        );

        let task = {
            let auth = auth.clone();
            tokio::spawn(async move {
                let result = dispatcher.run().await;
                auth.abort_pending();
                match &result {
                    Ok(()) => info!("Session closed"),
                    Err(e) => error!("Session ended: {}", e),
                }
                result
            })
        };

        info!("Session started");

        Ok(Self {
            outbound,
            auth,
            caches,
            store,
            reply_timeout: config.reply_timeout,
            achievement_permits: Arc::new(Semaphore::new(config.achievement_concurrency.max(1))),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> AuthState {
        self.auth.state()
    }

    pub fn account(&self) -> AccountInfo {
        self.auth.account()
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn set_auth_lost_handler(&self, handler: AuthLostHandler) {
        self.auth.set_auth_lost_handler(handler);
    }

    pub async fn get_rsa_public_key(&self, account_name: &str) -> Result<KeyExchange> {
        self.auth.get_rsa_public_key(account_name).await
    }

    pub async fn authenticate_password(
        &self,
        account_name: &str,
        encrypted_password: &[u8],
        timestamp: u64,
    ) -> Result<LoginOutcome> {
        self.auth
            .authenticate_password(account_name, encrypted_password, timestamp)
            .await
    }

    pub async fn submit_guard_code(
        &self,
        code: &str,
        challenge: AuthChallenge,
    ) -> Result<AuthChallenge> {
        self.auth.submit_guard_code(code, challenge).await
    }

    /// Polls the pending auth session, persisting the refresh token once issued.
    pub async fn poll_auth_status(&self) -> Result<PollStatus> {
        let status = self.auth.poll_auth_status().await?;

        if let PollStatus::Ready {
            account_name,
            refresh_token,
        } = &status
        {
            self.store
                .set(credentials::REFRESH_TOKEN, refresh_token.as_bytes())
                .await?;
            self.store
                .set(credentials::ACCOUNT_NAME, account_name.as_bytes())
                .await?;
            let steam_id = self.auth.account().steam_id;
            if steam_id != 0 {
                self.store
                    .set(credentials::STEAM_ID, &steam_id.to_be_bytes())
                    .await?;
            }
            info!("Refresh token stored for {}", account_name);
        }

        Ok(status)
    }

    /// Polls at the descriptor interval until the session is confirmed.
    pub async fn wait_for_confirmation(
        &self,
        interval: Duration,
        attempts: u32,
    ) -> Result<PollStatus> {
        let interval = interval.max(Duration::from_millis(100));
        for _ in 0..attempts {
            let status = self.poll_auth_status().await?;
            if status != PollStatus::Pending {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
        Ok(PollStatus::Pending)
    }

    pub async fn authenticate_token(
        &self,
        steam_id: u64,
        account_name: &str,
        refresh_token: &str,
    ) -> Result<AuthChallenge> {
        let challenge = self
            .auth
            .authenticate_token(steam_id, account_name, refresh_token)
            .await?;

        let steam_id = self.auth.account().steam_id;
        self.store
            .set(credentials::STEAM_ID, &steam_id.to_be_bytes())
            .await?;
        self.store
            .set(credentials::ACCOUNT_NAME, account_name.as_bytes())
            .await?;
        Ok(challenge)
    }

    /// Logs on with credentials from the store. `None` when none are stored.
    pub async fn authenticate_stored(&self) -> Result<Option<AuthChallenge>> {
        let store = self.store.as_ref();
        let token = credentials::get_string(store, credentials::REFRESH_TOKEN).await;
        let account_name = credentials::get_string(store, credentials::ACCOUNT_NAME).await;
        let steam_id = credentials::get_u64(store, credentials::STEAM_ID).await;

        match (token, account_name, steam_id) {
            (Some(token), Some(account_name), Some(steam_id)) if !token.is_empty() => self
                .authenticate_token(steam_id, &account_name, &token)
                .await
                .map(Some),
            _ => Ok(None),
        }
    }

    fn require_auth(&self) -> Result<u64> {
        if !self.auth.is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(self.auth.account().steam_id)
    }

    /// Queues stats requests for the given games.
    pub async fn import_game_stats(&self, game_ids: &[u64]) -> Result<()> {
        let steam_id = self.require_auth()?;
        self.caches
            .stats
            .write()
            .await
            .expect(game_ids.iter().copied());
        for game_id in game_ids {
            self.outbound
                .submit("user stats", Message::user_stats(*game_id, steam_id));
        }
        Ok(())
    }

    /// Queues the playtime import.
    pub fn import_game_times(&self) -> Result<()> {
        self.require_auth()?;
        self.outbound
            .submit("last played times", Message::last_played_times());
        Ok(())
    }

    pub async fn retrieve_collections(&self) -> Result<Vec<Collection>> {
        self.require_auth()?;
        let rx = self
            .outbound
            .submit_call("collections", Message::collections());
        let reply = wait_reply(rx, self.reply_timeout, "collections").await?;

        match reply.payload {
            Payload::CloudConfigDownloadResponse(body) => Ok(body.collections),
            other => Err(SessionError::UnexpectedReply {
                expected: "collections",
                got: other.kind_code(),
            }),
        }
    }

    /// Returns the client app ownership ticket, fetching it when not cached.
    pub async fn get_steam_app_ownership_ticket(&self) -> Result<Vec<u8>> {
        if let Some(ticket) = self.caches.ticket.read().await.get() {
            return Ok(ticket.to_vec());
        }
        self.require_auth()?;

        let rx = self
            .outbound
            .call(Message::app_ownership_ticket(CLIENT_APP_ID))?;
        let reply = wait_reply(rx, self.reply_timeout, "ownership ticket").await?;

        match reply.payload {
            Payload::ClientGetAppOwnershipTicketResponse(body) if body.result != EResult::Ok => {
                Err(SessionError::backend(body.result))
            }
            Payload::ClientGetAppOwnershipTicketResponse(_) => self
                .caches
                .ticket
                .read()
                .await
                .get()
                .map(<[u8]>::to_vec)
                .ok_or(SessionError::UnexpectedReply {
                    expected: "ownership ticket",
                    got: cm_proto::MessageKind::ClientGetAppOwnershipTicketResponse.code(),
                }),
            other => Err(SessionError::UnexpectedReply {
                expected: "ownership ticket",
                got: other.kind_code(),
            }),
        }
    }

    pub fn register_auth_ticket_with_cm(&self, ticket: &[u8]) -> Result<()> {
        self.require_auth()?;
        self.outbound.send(Message::auth_list(ticket, CLIENT_APP_ID))
    }

    /// Unlocked achievements for a game, served from cache while its
    /// playtime fingerprint is unchanged.
    pub async fn get_unlocked_achievements(&self, game_id: u32) -> Result<Vec<CachedAchievement>> {
        let time = self.caches.times.read().await.get(game_id).copied();
        let Some(time) = time.filter(|t| t.minutes_played > 0) else {
            return Ok(Vec::new());
        };

        let fingerprint = Fingerprint {
            last_played: time.last_played.unwrap_or(0),
            minutes_played: time.minutes_played,
        };
        if let Some(hit) = self.caches.achievements.read().await.get(game_id as u64, fingerprint) {
            debug!("Achievement cache hit for {}", game_id);
            return Ok(hit.to_vec());
        }

        let steam_id = self.require_auth()?;
        let _permit = self
            .achievement_permits
            .acquire()
            .await
            .map_err(|_| SessionError::ConnectionClosed)?;

        self.caches.stats.write().await.expect([game_id as u64]);
        if let Err(e) = self.request_user_stats(game_id as u64, steam_id).await {
            self.caches.stats.write().await.abandon(game_id as u64);
            return Err(e);
        }

        let achievements: Vec<CachedAchievement> = self
            .caches
            .stats
            .read()
            .await
            .get(game_id as u64)
            .map(|stats| {
                stats
                    .achievements
                    .iter()
                    .map(|a| CachedAchievement {
                        unlock_time: a.unlock_time,
                        id: a.api_name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.caches
            .achievements
            .write()
            .await
            .update(game_id as u64, achievements.clone(), fingerprint);
        Ok(achievements)
    }

    async fn request_user_stats(&self, game_id: u64, steam_id: u64) -> Result<()> {
        let rx = self.outbound.call(Message::user_stats(game_id, steam_id))?;
        let reply = wait_reply(rx, self.reply_timeout, "user stats").await?;

        match reply.payload {
            Payload::ClientGetUserStatsResponse(body) if body.result != EResult::Ok => {
                Err(SessionError::backend(body.result))
            }
            Payload::ClientGetUserStatsResponse(_) => Ok(()),
            other => Err(SessionError::UnexpectedReply {
                expected: "user stats",
                got: other.kind_code(),
            }),
        }
    }

    pub async fn game_times(&self) -> Vec<GameTime> {
        self.caches.times.read().await.all()
    }

    /// Serializes the achievement cache for the next warm start.
    pub async fn achievement_cache_json(&self) -> Result<String> {
        let json = self
            .caches
            .achievements
            .write()
            .await
            .to_json()
            .map_err(cm_proto::ProtocolError::from)?;
        Ok(json)
    }

    /// Logs off and stops the dispatcher.
    pub fn close(&self) {
        if self.outbound.send(Message::log_off()).is_err() {
            debug!("Connection already closed");
        }
        self.cancel.cancel();
    }

    /// Waits for the dispatcher to stop and returns why it stopped.
    pub async fn wait_closed(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Dispatcher task failed: {}", e);
                    Err(SessionError::ConnectionClosed)
                }
            },
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStore;
    use cm_proto::{
        crypto, AchievementBlock, AllowedConfirmation, AppInfo, AppOwnershipTicketBody,
        BackendErrorKind, BeginAuthSessionResponseBody, ChannelCipher, ChannelEncryptRequestBody,
        ChannelEncryptResultBody, CollectionsBody, LastPlayedTimesBody, LicenseListBody,
        LicenseRecord, LogOnResponseBody, LoggedOffBody, MessageKind, PackageInfo, PlayedGame,
        ProductInfoBody, RsaKeyBody, UserStatsBody,
    };
    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    type Server = Framed<DuplexStream, CmFrameCodec>;

    const STEAM_ID: u64 = 76561197960287930;

    fn config() -> SessionConfig {
        SessionConfig {
            reply_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    async fn connect() -> (Arc<Session>, Server) {
        connect_with(config()).await
    }

    async fn connect_with(config: SessionConfig) -> (Arc<Session>, Server) {
        let (client, server) = duplex(256 * 1024);
        let mut server = Framed::new(server, CmFrameCodec::default());
        let session = Session::connect(client, config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let hello = server.next().await.unwrap().unwrap();
        assert_eq!(hello.kind(), Some(MessageKind::ClientHello));
        (Arc::new(session), server)
    }

    async fn expect(server: &mut Server, kind: MessageKind) -> Message {
        let message = tokio::time::timeout(Duration::from_secs(2), server.next())
            .await
            .expect("server timed out")
            .unwrap()
            .unwrap();
        assert_eq!(message.kind(), Some(kind));
        message
    }

    async fn expect_silence(server: &mut Server) {
        let next = tokio::time::timeout(Duration::from_millis(50), server.next()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    async fn reply(server: &mut Server, request: &Message, payload: Payload) {
        server
            .send(Message::new(payload).with_target_job(request.source_job))
            .await
            .unwrap();
    }

    async fn log_on(session: &Arc<Session>, server: &mut Server) {
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.authenticate_token(STEAM_ID, "gordon", "token").await })
        };
        let request = expect(server, MessageKind::ClientLogon).await;
        reply(
            server,
            &request,
            Payload::ClientLogOnResponse(LogOnResponseBody {
                result: EResult::Ok,
                steam_id: STEAM_ID,
                cell_id: 0,
                heartbeat_seconds: 0,
            }),
        )
        .await;
        task.await.unwrap().unwrap();
    }

    fn rsa_reply(result: EResult) -> Payload {
        Payload::AuthGetPasswordRsaPublicKeyResponse(RsaKeyBody {
            result,
            publickey_mod: "c0ffee".to_string(),
            publickey_exp: "010001".to_string(),
            timestamp: 1234,
        })
    }

    #[tokio::test]
    async fn test_rsa_key_ok() {
        let (session, mut server) = connect().await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_rsa_public_key("gordon").await })
        };
        let request = expect(&mut server, MessageKind::AuthGetPasswordRsaPublicKey).await;
        reply(&mut server, &request, rsa_reply(EResult::Ok)).await;

        let exchange = task.await.unwrap().unwrap();
        assert_eq!(exchange.challenge, AuthChallenge::PasswordRequired);
        assert_eq!(exchange.key.unwrap().exponent, "010001");
        assert_eq!(session.state(), AuthState::KeyReceived);
    }

    #[tokio::test]
    async fn test_rsa_key_failure_is_invalid_auth_data() {
        let (session, mut server) = connect().await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_rsa_public_key("nobody").await })
        };
        let request = expect(&mut server, MessageKind::AuthGetPasswordRsaPublicKey).await;
        reply(&mut server, &request, rsa_reply(EResult::InvalidParam)).await;

        let exchange = task.await.unwrap().unwrap();
        assert_eq!(exchange.challenge, AuthChallenge::InvalidAuthData);
        assert!(exchange.key.is_none());
    }

    #[tokio::test]
    async fn test_second_key_request_fails_fast() {
        let (session, mut server) = connect().await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_rsa_public_key("gordon").await })
        };
        let request = expect(&mut server, MessageKind::AuthGetPasswordRsaPublicKey).await;

        let second = session.get_rsa_public_key("gordon").await;
        assert!(matches!(second, Err(SessionError::RequestInFlight(_))));

        reply(&mut server, &request, rsa_reply(EResult::Ok)).await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connection_drop_is_network_error() {
        let (session, mut server) = connect().await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_rsa_public_key("gordon").await })
        };
        expect(&mut server, MessageKind::AuthGetPasswordRsaPublicKey).await;
        drop(server);

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), BackendErrorKind::NetworkError);
        assert!(matches!(
            session.wait_closed().await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_login_prefers_device_code() {
        let (session, mut server) = connect().await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.authenticate_password("gordon", b"enc", 1234).await })
        };
        let request = expect(&mut server, MessageKind::AuthBeginSessionViaCredentials).await;
        reply(
            &mut server,
            &request,
            Payload::AuthBeginSessionViaCredentialsResponse(BeginAuthSessionResponseBody {
                result: EResult::Ok,
                client_id: 5,
                request_id: "00".to_string(),
                interval: 5.0,
                allowed_confirmations: [2, 3]
                    .iter()
                    .map(|t| AllowedConfirmation {
                        confirmation_type: *t,
                        associated_message: String::new(),
                    })
                    .collect(),
                steam_id: STEAM_ID,
                extended_error_message: None,
            }),
        )
        .await;

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.challenge, AuthChallenge::DeviceCodeRequired);
        assert_eq!(session.state(), AuthState::ChallengePending);
    }

    #[tokio::test]
    async fn test_unsolicited_logon_reply_ends_session() {
        let (session, mut server) = connect().await;

        server
            .send(Message::new(Payload::ClientLogOnResponse(LogOnResponseBody {
                result: EResult::TryAnotherCM,
                steam_id: 0,
                cell_id: 0,
                heartbeat_seconds: 0,
            })))
            .await
            .unwrap();

        let err = session.wait_closed().await.unwrap_err();
        assert!(matches!(err, SessionError::UnsolicitedReply { .. }));
        assert_eq!(err.kind(), BackendErrorKind::BackendNotAvailable);
    }

    #[tokio::test]
    async fn test_log_off_invokes_auth_lost() {
        let (session, mut server) = connect().await;
        let (lost_tx, lost_rx) = tokio::sync::oneshot::channel();
        let lost_tx = std::sync::Mutex::new(Some(lost_tx));
        session.set_auth_lost_handler(Arc::new(move |err: SessionError| {
            if let Some(tx) = lost_tx.lock().unwrap().take() {
                let _ = tx.send(err.kind());
            }
        }));

        log_on(&session, &mut server).await;
        assert_eq!(session.state(), AuthState::Authenticated);

        server
            .send(Message::new(Payload::ClientLoggedOff(LoggedOffBody {
                result: EResult::Banned,
            })))
            .await
            .unwrap();

        let kind = tokio::time::timeout(Duration::from_secs(2), lost_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, BackendErrorKind::Banned);
    }

    #[tokio::test]
    async fn test_license_import_end_to_end() {
        let (session, mut server) = connect().await;
        let mut ready = session.caches().licenses.read().await.subscribe_ready();

        server
            .send(Message::new(Payload::ClientLicenseList(LicenseListBody {
                result: EResult::Ok,
                licenses: vec![LicenseRecord {
                    package_id: 100,
                    time_created: 0,
                    license_type: 0,
                    flags: 0,
                    owner_id: 0,
                    access_token: 9,
                }],
            })))
            .await
            .unwrap();

        let request = expect(&mut server, MessageKind::ClientPicsProductInfoRequest).await;
        match &request.payload {
            Payload::ClientPicsProductInfoRequest(body) => {
                assert_eq!(body.packages[0].package_id, 100);
                assert_eq!(body.packages[0].access_token, 9);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        server
            .send(Message::new(Payload::ClientPicsProductInfoResponse(ProductInfoBody {
                packages: vec![PackageInfo {
                    package_id: 100,
                    app_ids: vec![70],
                }],
                ..ProductInfoBody::default()
            })))
            .await
            .unwrap();

        expect(&mut server, MessageKind::ClientPicsProductInfoRequest).await;
        server
            .send(Message::new(Payload::ClientPicsProductInfoResponse(ProductInfoBody {
                apps: vec![AppInfo {
                    app_id: 70,
                    name: Some("Half-Life".to_string()),
                    app_type: Some("game".to_string()),
                    parent: None,
                }],
                ..ProductInfoBody::default()
            })))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), ready.wait_for(|ready| *ready))
            .await
            .unwrap()
            .unwrap();

        let owned = session.caches().licenses.read().await.owned_games();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name.as_deref(), Some("Half-Life"));
    }

    #[tokio::test]
    async fn test_zero_playtime_skips_network() {
        let (session, mut server) = connect().await;
        log_on(&session, &mut server).await;

        let achievements = session.get_unlocked_achievements(440).await.unwrap();

        assert!(achievements.is_empty());
        expect_silence(&mut server).await;
    }

    async fn import_times(session: &Arc<Session>, server: &mut Server, app_ids: &[u32]) {
        session.import_game_times().unwrap();
        let request = expect(server, MessageKind::PlayerGetLastPlayedTimes).await;
        reply(
            server,
            &request,
            Payload::PlayerGetLastPlayedTimesResponse(LastPlayedTimesBody {
                games: app_ids
                    .iter()
                    .map(|app_id| PlayedGame {
                        app_id: *app_id,
                        playtime_forever: 120,
                        last_playtime: 1_600_000_000,
                    })
                    .collect(),
            }),
        )
        .await;

        for _ in 0..100 {
            if session.caches().times.read().await.is_import_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("playtime import never finished");
    }

    fn empty_stats(game_id: u64) -> Payload {
        Payload::ClientGetUserStatsResponse(UserStatsBody {
            result: EResult::Ok,
            game_id,
            stats: Vec::new(),
            achievement_blocks: Vec::new(),
            schema: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn test_achievement_fetches_respect_concurrency_limit() {
        let (session, mut server) = connect_with(SessionConfig {
            achievement_concurrency: 1,
            ..config()
        })
        .await;
        log_on(&session, &mut server).await;
        import_times(&session, &mut server, &[440, 570]).await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.get_unlocked_achievements(440).await })
        };
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.get_unlocked_achievements(570).await })
        };

        let request = expect(&mut server, MessageKind::ClientGetUserStats).await;
        expect_silence(&mut server).await;

        let game_id = match &request.payload {
            Payload::ClientGetUserStats(body) => body.game_id,
            other => panic!("unexpected payload: {:?}", other),
        };
        reply(&mut server, &request, empty_stats(game_id)).await;

        let request = expect(&mut server, MessageKind::ClientGetUserStats).await;
        let other_game = match &request.payload {
            Payload::ClientGetUserStats(body) => body.game_id,
            other => panic!("unexpected payload: {:?}", other),
        };
        assert_ne!(other_game, game_id);
        reply(&mut server, &request, empty_stats(other_game)).await;

        assert!(first.await.unwrap().unwrap().is_empty());
        assert!(second.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_achievement_timeout_clears_pending_stats() {
        let (session, mut server) = connect_with(SessionConfig {
            reply_timeout: Duration::from_millis(100),
            ..config()
        })
        .await;
        log_on(&session, &mut server).await;
        import_times(&session, &mut server, &[440]).await;

        let err = session.get_unlocked_achievements(440).await.unwrap_err();

        assert!(matches!(err, SessionError::Timeout("user stats")));
        assert!(session.caches().stats.read().await.is_ready());
    }

    #[tokio::test]
    async fn test_malformed_license_list_keeps_session() {
        let (session, mut server) = connect().await;

        server
            .send(Message::new(Payload::Unknown {
                kind: MessageKind::ClientLicenseList.code(),
                body: bytes::Bytes::from_static(
                    br#"{"licenses":[{"package_id":1},{"package_id":"x"}]}"#,
                ),
            }))
            .await
            .unwrap();
        let request = expect(&mut server, MessageKind::ClientPicsProductInfoRequest).await;
        match &request.payload {
            Payload::ClientPicsProductInfoRequest(body) => {
                let ids: Vec<u32> = body.packages.iter().map(|p| p.package_id).collect();
                assert_eq!(ids, vec![1]);
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        server
            .send(Message::new(Payload::Unknown {
                kind: MessageKind::ClientLoggedOff.code(),
                body: bytes::Bytes::from_static(b"{\"result\":\"nope\"}"),
            }))
            .await
            .unwrap();

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_rsa_public_key("gordon").await })
        };
        let request = expect(&mut server, MessageKind::AuthGetPasswordRsaPublicKey).await;
        reply(&mut server, &request, rsa_reply(EResult::Ok)).await;

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_achievements_cached_by_fingerprint() {
        let (session, mut server) = connect().await;
        log_on(&session, &mut server).await;
        import_times(&session, &mut server, &[440]).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_unlocked_achievements(440).await })
        };
        let request = expect(&mut server, MessageKind::ClientGetUserStats).await;
        let mut unlock_time = vec![0; 32];
        unlock_time[3] = 1_500_000_000;
        reply(
            &mut server,
            &request,
            Payload::ClientGetUserStatsResponse(UserStatsBody {
                result: EResult::Ok,
                game_id: 440,
                stats: Vec::new(),
                achievement_blocks: vec![AchievementBlock {
                    achievement_id: 1,
                    unlock_time,
                }],
                schema: json!({ "stats": { "1": { "bits": { "3": { "name": "TF_PLAY_GAME" } } } } }),
            }),
        )
        .await;

        let first = task.await.unwrap().unwrap();
        assert_eq!(
            first,
            vec![CachedAchievement {
                unlock_time: 1_500_000_000,
                id: "TF_PLAY_GAME".to_string(),
            }]
        );

        let second = session.get_unlocked_achievements(440).await.unwrap();
        assert_eq!(second, first);
        expect_silence(&mut server).await;

        let json = session.achievement_cache_json().await.unwrap();
        assert!(json.contains("TF_PLAY_GAME"));
    }

    #[tokio::test]
    async fn test_collections_resolve_by_job() {
        let (session, mut server) = connect().await;
        log_on(&session, &mut server).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.retrieve_collections().await })
        };
        let request = expect(&mut server, MessageKind::CloudConfigDownload).await;
        reply(
            &mut server,
            &request,
            Payload::CloudConfigDownloadResponse(CollectionsBody {
                collections: vec![Collection {
                    name: "Favorites".to_string(),
                    app_ids: vec![70, 440],
                }],
            }),
        )
        .await;

        let collections = task.await.unwrap().unwrap();
        assert_eq!(collections[0].name, "Favorites");
    }

    #[tokio::test]
    async fn test_ownership_ticket_fetched_once() {
        let (session, mut server) = connect().await;
        log_on(&session, &mut server).await;

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_steam_app_ownership_ticket().await })
        };
        let request = expect(&mut server, MessageKind::ClientGetAppOwnershipTicket).await;
        reply(
            &mut server,
            &request,
            Payload::ClientGetAppOwnershipTicketResponse(AppOwnershipTicketBody {
                result: EResult::Ok,
                app_id: CLIENT_APP_ID,
                ticket: "beef".to_string(),
            }),
        )
        .await;

        assert_eq!(task.await.unwrap().unwrap(), vec![0xbe, 0xef]);
        assert_eq!(
            session.get_steam_app_ownership_ticket().await.unwrap(),
            vec![0xbe, 0xef]
        );
        expect_silence(&mut server).await;

        session.register_auth_ticket_with_cm(&[0xbe, 0xef]).unwrap();
        expect(&mut server, MessageKind::ClientAuthList).await;
    }

    #[tokio::test]
    async fn test_imports_require_authentication() {
        let (session, _server) = connect().await;

        assert!(matches!(
            session.import_game_times(),
            Err(SessionError::NotAuthenticated)
        ));
        assert!(matches!(
            session.import_game_stats(&[440]).await,
            Err(SessionError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_ignored() {
        let (session, mut server) = connect().await;

        server
            .send(Message::new(Payload::Unknown {
                kind: 4242,
                body: bytes::Bytes::from_static(b"{}"),
            }))
            .await
            .unwrap();

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.get_rsa_public_key("gordon").await })
        };
        let request = expect(&mut server, MessageKind::AuthGetPasswordRsaPublicKey).await;
        reply(&mut server, &request, rsa_reply(EResult::Ok)).await;

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_sends_log_off() {
        let (session, mut server) = connect().await;

        session.close();

        expect(&mut server, MessageKind::ClientLogOff).await;
        assert!(session.wait_closed().await.is_ok());
    }

    #[tokio::test]
    async fn test_encrypted_channel() {
        let psk = b"psk".to_vec();
        let (client, server) = duplex(64 * 1024);
        let mut server = Framed::new(server, CmFrameCodec::default());

        let server_task = tokio::spawn(async move {
            server
                .send(Message::new(Payload::ChannelEncryptRequest(
                    ChannelEncryptRequestBody {
                        server_nonce: "nonce".to_string(),
                    },
                )))
                .await
                .unwrap();
            let response = server.next().await.unwrap().unwrap();
            let client_nonce = match response.payload {
                Payload::ChannelEncryptResponse(body) => body.client_nonce,
                other => panic!("unexpected payload: {:?}", other),
            };
            server
                .send(Message::new(Payload::ChannelEncryptResult(
                    ChannelEncryptResultBody { result: EResult::Ok },
                )))
                .await
                .unwrap();
            let key = crypto::derive_channel_key(b"psk", "nonce", &client_nonce);
            server.codec_mut().set_cipher(ChannelCipher::new(key));

            let hello = server.next().await.unwrap().unwrap();
            assert_eq!(hello.kind(), Some(MessageKind::ClientHello));
            server
        });

        let config = SessionConfig {
            channel_psk: Some(psk),
            ..config()
        };
        let session = Session::connect(client, config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let _server = server_task.await.unwrap();

        session.close();
    }
}
