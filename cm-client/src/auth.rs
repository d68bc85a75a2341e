//! Authentication state machine.
//!
//! Two login variants share one machine: the guard-list flow, where the
//! server answers `OK` plus a set of allowed confirmations, and the legacy
//! flow, where the challenge is encoded in the result code itself. Both are
//! funnelled through [`resolve_challenge`]; everything before and after
//! that step is common.
//!
//! Each exchange kind (key request, login, guard code, poll, logon) owns a
//! single reply slot. Starting an exchange while its slot is occupied fails
//! fast with [`SessionError::RequestInFlight`].

use crate::dispatcher::{lock, wait_reply, Handler, Outbound};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use cm_proto::{
    BackendErrorKind, BeginAuthSessionBody, BeginAuthSessionResponseBody, EResult, GuardCodeBody,
    LogOnResponseBody, LogonBody, Message, MessageKind, Payload, PollSessionStatusBody,
    PollSessionStatusResponseBody, RsaKeyBody, PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    KeyRequested,
    KeyReceived,
    LoginSubmitted,
    ChallengePending,
    Authenticated,
    Failed(BackendErrorKind),
}

/// What the server wants before a login attempt can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChallenge {
    NoActionRequired,
    EmailCodeRequired,
    DeviceCodeRequired,
    DeviceConfirmationRequired,
    PasswordRequired,
    InvalidAuthData,
}

/// Confirmation methods as numbered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuardType {
    Unknown = 0,
    None = 1,
    EmailCode = 2,
    DeviceCode = 3,
    DeviceConfirmation = 4,
    EmailConfirmation = 5,
    MachineToken = 6,
    LegacyMachineAuth = 7,
}

impl GuardType {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => GuardType::None,
            2 => GuardType::EmailCode,
            3 => GuardType::DeviceCode,
            4 => GuardType::DeviceConfirmation,
            5 => GuardType::EmailConfirmation,
            6 => GuardType::MachineToken,
            7 => GuardType::LegacyMachineAuth,
            _ => GuardType::Unknown,
        }
    }

    fn challenge(self) -> Option<AuthChallenge> {
        match self {
            GuardType::None => Some(AuthChallenge::NoActionRequired),
            GuardType::EmailCode => Some(AuthChallenge::EmailCodeRequired),
            GuardType::DeviceCode => Some(AuthChallenge::DeviceCodeRequired),
            GuardType::DeviceConfirmation => Some(AuthChallenge::DeviceConfirmationRequired),
            _ => None,
        }
    }
}

fn rank(challenge: AuthChallenge) -> u8 {
    match challenge {
        AuthChallenge::DeviceCodeRequired => 4,
        AuthChallenge::EmailCodeRequired => 3,
        AuthChallenge::DeviceConfirmationRequired => 2,
        AuthChallenge::NoActionRequired => 1,
        _ => 0,
    }
}

/// Picks the challenge to present when several guard methods are offered.
///
/// Device code beats email code beats device confirmation beats nothing.
/// Guard types without a challenge mapping are ignored; an empty or fully
/// unrecognised list is invalid.
pub fn prioritize_guards(guards: &[GuardType]) -> AuthChallenge {
    guards
        .iter()
        .filter_map(|guard| guard.challenge())
        .max_by_key(|challenge| rank(*challenge))
        .unwrap_or(AuthChallenge::InvalidAuthData)
}

/// Resolves the login reply into a challenge, for both login variants.
///
/// `OK` defers to the offered guard list; the legacy denial codes carry the
/// challenge themselves. Bad-credential codes map to `InvalidAuthData` and
/// anything else is a hard failure.
pub fn resolve_challenge(result: EResult, guards: &[GuardType]) -> Result<AuthChallenge> {
    match result {
        EResult::Ok => Ok(prioritize_guards(guards)),
        EResult::AccountLogonDenied => Ok(AuthChallenge::EmailCodeRequired),
        EResult::AccountLoginDeniedNeedTwoFactor => Ok(AuthChallenge::DeviceCodeRequired),
        EResult::InvalidPassword
        | EResult::InvalidSteamID
        | EResult::AccountNotFound
        | EResult::InvalidLoginAuthCode
        | EResult::TwoFactorCodeMismatch
        | EResult::TwoFactorActivationCodeMismatch => Ok(AuthChallenge::InvalidAuthData),
        other => Err(SessionError::backend(other)),
    }
}

/// Maps the key-exchange result to a challenge.
///
/// Which non-OK codes mean "unknown account" is not pinned down, so every
/// failure is reported as invalid auth data for now.
fn key_exchange_challenge(result: EResult) -> AuthChallenge {
    if result == EResult::Ok {
        AuthChallenge::PasswordRequired
    } else {
        debug!("Key exchange failed with {}", result);
        AuthChallenge::InvalidAuthData
    }
}

/// RSA public key used to encipher the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub modulus: String,
    pub exponent: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    pub challenge: AuthChallenge,
    pub key: Option<PublicKey>,
}

/// Handle on an auth session awaiting out-of-band confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingDescriptor {
    pub client_id: u64,
    pub steam_id: u64,
    pub request_id: String,
    pub interval: Duration,
    pub challenge: AuthChallenge,
    pub extended_error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub challenge: AuthChallenge,
    /// Present when the server opened an auth session to poll.
    pub polling: Option<PollingDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Ready {
        account_name: String,
        refresh_token: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub steam_id: u64,
    pub persona_name: Option<String>,
    pub country: Option<String>,
}

impl AccountInfo {
    /// Lower 32 bits of the steam id.
    pub fn account_id(&self) -> u32 {
        (self.steam_id & 0xffff_ffff) as u32
    }
}

/// Called once when the server ends an authenticated session.
pub type AuthLostHandler = Arc<dyn Fn(SessionError) + Send + Sync>;

/// Single outstanding reply slot for one exchange kind.
struct Slot<T> {
    name: &'static str,
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Slot<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            tx: Mutex::new(None),
        }
    }

    fn arm(&self) -> Result<oneshot::Receiver<T>> {
        let mut slot = lock(&self.tx);
        if let Some(tx) = slot.as_ref() {
            // A dropped receiver (timed out caller) frees the slot
            if !tx.is_closed() {
                return Err(SessionError::RequestInFlight(self.name));
            }
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    fn take(&self) -> Option<oneshot::Sender<T>> {
        lock(&self.tx).take()
    }

    fn clear(&self) {
        lock(&self.tx).take();
    }
}

/// Delivers a reply to its slot. Returns false when nobody armed it.
fn fulfil<T>(slot: &Slot<T>, value: T) -> bool {
    match slot.take() {
        Some(tx) => {
            if tx.send(value).is_err() {
                debug!("Waiter for {} reply already gone", slot.name);
            }
            true
        }
        None => false,
    }
}

/// Poll period used when the server sends one that is not a usable duration.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn poll_interval(secs: f32) -> Duration {
    Duration::try_from_secs_f32(secs).unwrap_or_else(|_| {
        warn!("Unusable poll interval {}, using {:?}", secs, DEFAULT_POLL_INTERVAL);
        DEFAULT_POLL_INTERVAL
    })
}

/// Operating system code announced at login.
pub fn os_type() -> i32 {
    if cfg!(target_os = "windows") {
        16
    } else if cfg!(target_os = "macos") {
        -102
    } else if cfg!(target_os = "linux") {
        -203
    } else {
        -1
    }
}

pub struct AuthStateMachine {
    outbound: Outbound,
    machine_id: Vec<u8>,
    reply_timeout: Duration,
    state: Mutex<AuthState>,
    account: Mutex<AccountInfo>,
    auth_session: Mutex<Option<PollingDescriptor>>,
    auth_lost: Mutex<Option<AuthLostHandler>>,
    auth_lost_armed: AtomicBool,
    closed: AtomicBool,
    rsa: Slot<RsaKeyBody>,
    login: Slot<BeginAuthSessionResponseBody>,
    guard: Slot<EResult>,
    poll: Slot<PollSessionStatusResponseBody>,
    logon: Slot<LogOnResponseBody>,
}

impl AuthStateMachine {
    /// Message kinds this machine must be routed.
    pub const KINDS: &'static [MessageKind] = &[
        MessageKind::AuthGetPasswordRsaPublicKeyResponse,
        MessageKind::AuthBeginSessionViaCredentialsResponse,
        MessageKind::AuthUpdateSessionWithGuardCodeResponse,
        MessageKind::AuthPollSessionStatusResponse,
        MessageKind::ClientLogOnResponse,
        MessageKind::ClientLoggedOff,
        MessageKind::ClientAccountInfo,
    ];

    pub fn new(outbound: Outbound, machine_id: Vec<u8>, reply_timeout: Duration) -> Self {
        Self {
            outbound,
            machine_id,
            reply_timeout,
            state: Mutex::new(AuthState::Idle),
            account: Mutex::new(AccountInfo::default()),
            auth_session: Mutex::new(None),
            auth_lost: Mutex::new(None),
            auth_lost_armed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rsa: Slot::new("rsa key"),
            login: Slot::new("login"),
            guard: Slot::new("guard code"),
            poll: Slot::new("auth poll"),
            logon: Slot::new("logon"),
        }
    }

    pub fn state(&self) -> AuthState {
        *lock(&self.state)
    }

    pub fn account(&self) -> AccountInfo {
        lock(&self.account).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    /// Installs the callback fired when an authenticated session is ended
    /// by the server. It only fires after a successful login.
    pub fn set_auth_lost_handler(&self, handler: AuthLostHandler) {
        *lock(&self.auth_lost) = Some(handler);
    }

    fn set_state(&self, state: AuthState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Auth state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn fail(&self, err: SessionError) -> SessionError {
        self.set_state(AuthState::Failed(err.kind()));
        err
    }

    fn arm<T>(&self, slot: &Slot<T>) -> Result<oneshot::Receiver<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::ConnectionClosed);
        }
        slot.arm()
    }

    /// Drops every reply slot so suspended callers see a closed connection.
    pub fn abort_pending(&self) {
        self.closed.store(true, Ordering::Release);
        self.rsa.clear();
        self.login.clear();
        self.guard.clear();
        self.poll.clear();
        self.logon.clear();
    }

    pub async fn get_rsa_public_key(&self, account_name: &str) -> Result<KeyExchange> {
        let rx = self.arm(&self.rsa)?;
        self.set_state(AuthState::KeyRequested);

        if let Err(e) = self
            .outbound
            .send(Message::rsa_key_request(account_name.to_string()))
        {
            self.rsa.clear();
            return Err(e);
        }

        let body = wait_reply(rx, self.reply_timeout, "rsa key")
            .await
            .map_err(|e| self.fail(e))?;
        let challenge = key_exchange_challenge(body.result);

        if challenge != AuthChallenge::PasswordRequired {
            self.set_state(AuthState::Idle);
            return Ok(KeyExchange {
                challenge,
                key: None,
            });
        }

        self.set_state(AuthState::KeyReceived);
        Ok(KeyExchange {
            challenge,
            key: Some(PublicKey {
                modulus: body.publickey_mod,
                exponent: body.publickey_exp,
                timestamp: body.timestamp,
            }),
        })
    }

    /// Submits the enciphered password and resolves the resulting challenge.
    pub async fn authenticate_password(
        &self,
        account_name: &str,
        encrypted_password: &[u8],
        timestamp: u64,
    ) -> Result<LoginOutcome> {
        let rx = self.arm(&self.login)?;
        self.set_state(AuthState::LoginSubmitted);

        let request = Message::new(Payload::AuthBeginSessionViaCredentials(BeginAuthSessionBody {
            account_name: account_name.to_string(),
            encrypted_password: hex::encode(encrypted_password),
            encryption_timestamp: timestamp,
            remember_login: true,
            device_friendly_name: format!("cm-client {}", env!("CARGO_PKG_VERSION")),
            os_type: os_type(),
            machine_id: hex::encode(&self.machine_id),
        }));
        if let Err(e) = self.outbound.send(request) {
            self.login.clear();
            return Err(e);
        }

        let reply = wait_reply(rx, self.reply_timeout, "login")
            .await
            .map_err(|e| self.fail(e))?;
        let guards: Vec<GuardType> = reply
            .allowed_confirmations
            .iter()
            .map(|c| GuardType::from_code(c.confirmation_type))
            .collect();

        let challenge = resolve_challenge(reply.result, &guards).map_err(|e| {
            error!("Login failed: {}", e);
            self.fail(e)
        })?;

        if challenge == AuthChallenge::InvalidAuthData {
            info!("Login rejected: {}", reply.result);
            self.set_state(AuthState::Failed(BackendErrorKind::InvalidCredentials));
            return Ok(LoginOutcome {
                challenge,
                polling: None,
            });
        }

        let polling = (reply.result == EResult::Ok).then(|| PollingDescriptor {
            client_id: reply.client_id,
            steam_id: reply.steam_id,
            request_id: reply.request_id.clone(),
            interval: poll_interval(reply.interval),
            challenge,
            extended_error_message: reply.extended_error_message.clone(),
        });

        if reply.result == EResult::Ok {
            self.auth_lost_armed.store(true, Ordering::Release);
        }
        if reply.steam_id != 0 {
            lock(&self.account).steam_id = reply.steam_id;
        }
        *lock(&self.auth_session) = polling.clone();

        info!("Login accepted, challenge: {:?}", challenge);
        self.set_state(AuthState::ChallengePending);
        Ok(LoginOutcome { challenge, polling })
    }

    /// Sends an email or device code for the pending auth session.
    pub async fn submit_guard_code(
        &self,
        code: &str,
        challenge: AuthChallenge,
    ) -> Result<AuthChallenge> {
        let code_type = match challenge {
            AuthChallenge::EmailCodeRequired => GuardType::EmailCode,
            AuthChallenge::DeviceCodeRequired => GuardType::DeviceCode,
            other => {
                warn!("No code can answer challenge {:?}", other);
                return Ok(AuthChallenge::InvalidAuthData);
            }
        };

        let session = lock(&self.auth_session)
            .clone()
            .ok_or(SessionError::NoAuthSession)?;

        let rx = self.arm(&self.guard)?;
        let request = Message::new(Payload::AuthUpdateSessionWithGuardCode(GuardCodeBody {
            client_id: session.client_id,
            steam_id: session.steam_id,
            code: code.to_string(),
            code_type: code_type as u32,
        }));
        if let Err(e) = self.outbound.send(request) {
            self.guard.clear();
            return Err(e);
        }

        let result = wait_reply(rx, self.reply_timeout, "guard code")
            .await
            .map_err(|e| self.fail(e))?;
        match result {
            EResult::Ok => Ok(AuthChallenge::NoActionRequired),
            EResult::InvalidLoginAuthCode | EResult::TwoFactorCodeMismatch => {
                info!("Guard code rejected: {}", result);
                Ok(AuthChallenge::InvalidAuthData)
            }
            other => Err(self.fail(SessionError::backend(other))),
        }
    }

    /// Polls the pending auth session once.
    pub async fn poll_auth_status(&self) -> Result<PollStatus> {
        let session = lock(&self.auth_session)
            .clone()
            .ok_or(SessionError::NoAuthSession)?;

        let rx = self.arm(&self.poll)?;
        let request = Message::new(Payload::AuthPollSessionStatus(PollSessionStatusBody {
            client_id: session.client_id,
            request_id: session.request_id.clone(),
        }));
        if let Err(e) = self.outbound.send(request) {
            self.poll.clear();
            return Err(e);
        }

        let reply = wait_reply(rx, self.reply_timeout, "auth poll")
            .await
            .map_err(|e| self.fail(e))?;
        if reply.result != EResult::Ok {
            lock(&self.auth_session).take();
            return Err(self.fail(SessionError::backend(reply.result)));
        }

        let mut pending = lock(&self.auth_session);
        if let (Some(new_id), Some(session)) = (reply.new_client_id, pending.as_mut()) {
            session.client_id = new_id;
        }

        match reply.refresh_token {
            Some(refresh_token) => {
                pending.take();
                Ok(PollStatus::Ready {
                    account_name: reply.account_name.unwrap_or_default(),
                    refresh_token,
                })
            }
            None => Ok(PollStatus::Pending),
        }
    }

    /// Logs on with a stored refresh token.
    pub async fn authenticate_token(
        &self,
        steam_id: u64,
        account_name: &str,
        refresh_token: &str,
    ) -> Result<AuthChallenge> {
        let rx = self.arm(&self.logon)?;
        self.set_state(AuthState::LoginSubmitted);

        let request = Message::new(Payload::ClientLogon(LogonBody {
            protocol_version: PROTOCOL_VERSION,
            account_name: account_name.to_string(),
            steam_id,
            access_token: refresh_token.to_string(),
            machine_id: hex::encode(&self.machine_id),
            cell_id: 0,
            os_type: os_type(),
        }));
        if let Err(e) = self.outbound.send(request) {
            self.logon.clear();
            return Err(e);
        }

        let reply = wait_reply(rx, self.reply_timeout, "logon")
            .await
            .map_err(|e| self.fail(e))?;
        match reply.result {
            EResult::Ok => {
                {
                    let mut account = lock(&self.account);
                    account.steam_id = if reply.steam_id != 0 {
                        reply.steam_id
                    } else {
                        steam_id
                    };
                }
                self.auth_lost_armed.store(true, Ordering::Release);
                self.set_state(AuthState::Authenticated);
                info!("Logged on as {}", account_name);
                Ok(AuthChallenge::NoActionRequired)
            }
            EResult::InvalidPassword => {
                info!("Stored token rejected");
                Err(self.fail(SessionError::Backend {
                    kind: BackendErrorKind::InvalidCredentials,
                    result: reply.result,
                }))
            }
            other => {
                error!("Logon failed: {}", other);
                Err(self.fail(SessionError::backend(other)))
            }
        }
    }

    fn on_logged_off(&self, result: EResult) {
        let err = if result == EResult::Ok {
            SessionError::Backend {
                kind: BackendErrorKind::Unknown,
                result,
            }
        } else {
            SessionError::backend(result)
        };

        warn!("Logged off by server: {}", result);
        self.set_state(AuthState::Failed(err.kind()));

        if !self.auth_lost_armed.swap(false, Ordering::AcqRel) {
            debug!("Log-off before authentication, no callback armed");
            return;
        }
        let handler = lock(&self.auth_lost).clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

#[async_trait]
impl Handler for AuthStateMachine {
    async fn handle(&self, message: &Message, outbound: &Outbound) -> Result<()> {
        match &message.payload {
            Payload::AuthGetPasswordRsaPublicKeyResponse(body) => {
                if !fulfil(&self.rsa, body.clone()) {
                    warn!("Ignoring rsa key reply with no request pending");
                }
            }
            Payload::AuthBeginSessionViaCredentialsResponse(body) => {
                if !fulfil(&self.login, body.clone()) {
                    error!("Unsolicited login reply: {}", body.result);
                    return Err(SessionError::UnsolicitedReply {
                        kind: MessageKind::AuthBeginSessionViaCredentialsResponse,
                        result: body.result,
                    });
                }
            }
            Payload::AuthUpdateSessionWithGuardCodeResponse(body) => {
                if !fulfil(&self.guard, body.result) {
                    warn!("Ignoring guard code reply with no request pending");
                }
            }
            Payload::AuthPollSessionStatusResponse(body) => {
                if !fulfil(&self.poll, body.clone()) {
                    warn!("Ignoring poll reply with no request pending");
                }
            }
            Payload::ClientLogOnResponse(body) => {
                if body.result == EResult::Ok && body.heartbeat_seconds > 0 {
                    outbound.start_heartbeat(Duration::from_secs(body.heartbeat_seconds as u64));
                }
                if !fulfil(&self.logon, body.clone()) {
                    error!("Unsolicited logon reply: {}", body.result);
                    return Err(SessionError::UnsolicitedReply {
                        kind: MessageKind::ClientLogOnResponse,
                        result: body.result,
                    });
                }
            }
            Payload::ClientLoggedOff(body) => self.on_logged_off(body.result),
            Payload::ClientAccountInfo(body) => {
                let mut account = lock(&self.account);
                account.persona_name = Some(body.persona_name.clone());
                account.country = body.country.clone();
                debug!("Account persona: {}", body.persona_name);
            }
            _ => {}
        }
        Ok(())
    }
}
