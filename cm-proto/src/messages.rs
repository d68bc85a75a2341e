use crate::{EResult, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::warn;

/// App id of the desktop client itself; its ownership ticket authenticates the session.
pub const CLIENT_APP_ID: u32 = 7;

/// Protocol version announced in hello and logon messages.
pub const PROTOCOL_VERSION: u32 = 65580;

macro_rules! payloads {
    ($($kind:ident($body:ty) = $code:literal),+ $(,)?) => {
        /// Numeric message kind carried in every frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum MessageKind {
            $($kind = $code,)+
        }

        impl MessageKind {
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(MessageKind::$kind),)+
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                self as u32
            }
        }

        /// Typed body of a message, selected by its kind.
        #[derive(Debug, Clone)]
        pub enum Payload {
            $($kind($body),)+
            /// A kind this client does not understand; kept raw.
            Unknown { kind: u32, body: Bytes },
            /// A known kind whose body failed to parse. Never routed to a handler.
            Malformed { kind: u32, error: String, body: Bytes },
        }

        impl Payload {
            /// Numeric kind of this payload.
            pub fn kind_code(&self) -> u32 {
                match self {
                    $(Payload::$kind(_) => $code,)+
                    Payload::Unknown { kind, .. } => *kind,
                    Payload::Malformed { kind, .. } => *kind,
                }
            }

            pub fn kind(&self) -> Option<MessageKind> {
                match self {
                    Payload::Malformed { .. } => None,
                    _ => MessageKind::from_code(self.kind_code()),
                }
            }

            /// Decodes a JSON body according to its numeric kind.
            pub fn decode(kind: u32, body: &[u8]) -> Result<Self> {
                let payload = match kind {
                    $($code => Payload::$kind(serde_json::from_slice(body)?),)+
                    _ => Payload::Unknown {
                        kind,
                        body: Bytes::copy_from_slice(body),
                    },
                };
                Ok(payload)
            }

            /// Like [`Payload::decode`], but keeps an unparseable body as
            /// [`Payload::Malformed`] instead of failing.
            pub fn decode_lenient(kind: u32, body: &[u8]) -> Self {
                Self::decode(kind, body).unwrap_or_else(|e| {
                    warn!("Malformed body for message kind {}: {}", kind, e);
                    Payload::Malformed {
                        kind,
                        error: e.to_string(),
                        body: Bytes::copy_from_slice(body),
                    }
                })
            }

            pub fn encode(&self) -> Result<Vec<u8>> {
                let body = match self {
                    $(Payload::$kind(body) => serde_json::to_vec(body)?,)+
                    Payload::Unknown { body, .. } | Payload::Malformed { body, .. } => {
                        body.to_vec()
                    }
                };
                Ok(body)
            }
        }
    };
}

payloads! {
    ClientHeartBeat(Empty) = 703,
    ClientLogOff(Empty) = 706,
    ClientChangeStatus(ChangeStatusBody) = 716,
    ClientLogOnResponse(LogOnResponseBody) = 751,
    ClientLoggedOff(LoggedOffBody) = 757,
    ClientPersonaState(PersonaStateBody) = 766,
    ClientFriendsList(FriendsListBody) = 767,
    ClientAccountInfo(AccountInfoBody) = 768,
    ClientLicenseList(LicenseListBody) = 780,
    ClientRequestFriendData(RequestFriendDataBody) = 815,
    ClientGetUserStats(GetUserStatsBody) = 818,
    ClientGetUserStatsResponse(UserStatsBody) = 819,
    ClientGetAppOwnershipTicket(AppOwnershipTicketRequestBody) = 857,
    ClientGetAppOwnershipTicketResponse(AppOwnershipTicketBody) = 858,
    ChannelEncryptRequest(ChannelEncryptRequestBody) = 1303,
    ChannelEncryptResponse(ChannelEncryptResponseBody) = 1304,
    ChannelEncryptResult(ChannelEncryptResultBody) = 1305,
    ClientAuthList(AuthListBody) = 5505,
    ClientLogon(LogonBody) = 5514,
    ClientPlayerNicknameList(NicknameListBody) = 5587,
    ClientPicsProductInfoRequest(ProductInfoRequestBody) = 8903,
    ClientPicsProductInfoResponse(ProductInfoBody) = 8904,
    ClientHello(HelloBody) = 9805,
    AuthGetPasswordRsaPublicKey(RsaKeyRequestBody) = 9900,
    AuthGetPasswordRsaPublicKeyResponse(RsaKeyBody) = 9901,
    AuthBeginSessionViaCredentials(BeginAuthSessionBody) = 9902,
    AuthBeginSessionViaCredentialsResponse(BeginAuthSessionResponseBody) = 9903,
    AuthUpdateSessionWithGuardCode(GuardCodeBody) = 9904,
    AuthUpdateSessionWithGuardCodeResponse(ResultBody) = 9905,
    AuthPollSessionStatus(PollSessionStatusBody) = 9906,
    AuthPollSessionStatusResponse(PollSessionStatusResponseBody) = 9907,
    PlayerGetLastPlayedTimes(LastPlayedTimesRequestBody) = 9910,
    PlayerGetLastPlayedTimesResponse(LastPlayedTimesBody) = 9911,
    CloudConfigDownload(CollectionsRequestBody) = 9920,
    CloudConfigDownloadResponse(CollectionsBody) = 9921,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Frame envelope: job routing header plus a typed payload.
#[derive(Debug, Clone)]
pub struct Message {
    /// Job id chosen by the sender of a request; zero when no reply is expected.
    pub source_job: u64,
    /// Job id of the request this message answers; zero for unsolicited messages.
    pub target_job: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBody {
    pub result: EResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEncryptRequestBody {
    pub server_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEncryptResponseBody {
    pub client_nonce: String,
    pub sig: String, // HMAC-SHA256 hex encoded
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEncryptResultBody {
    pub result: EResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloBody {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaKeyRequestBody {
    pub account_name: String,
}

/// RSA public key material handed out for enciphering the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaKeyBody {
    pub result: EResult,
    #[serde(default)]
    pub publickey_mod: String, // hex
    #[serde(default)]
    pub publickey_exp: String, // hex
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginAuthSessionBody {
    pub account_name: String,
    pub encrypted_password: String, // hex
    pub encryption_timestamp: u64,
    pub remember_login: bool,
    pub device_friendly_name: String,
    pub os_type: i32,
    pub machine_id: String, // hex
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedConfirmation {
    pub confirmation_type: u32,
    #[serde(default)]
    pub associated_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginAuthSessionResponseBody {
    pub result: EResult,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub request_id: String, // hex
    #[serde(default)]
    pub interval: f32,
    #[serde(default)]
    pub allowed_confirmations: Vec<AllowedConfirmation>,
    #[serde(default)]
    pub steam_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardCodeBody {
    pub client_id: u64,
    pub steam_id: u64,
    pub code: String,
    pub code_type: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSessionStatusBody {
    pub client_id: u64,
    pub request_id: String, // hex
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSessionStatusResponseBody {
    pub result: EResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_client_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogonBody {
    pub protocol_version: u32,
    pub account_name: String,
    pub steam_id: u64,
    pub access_token: String,
    pub machine_id: String, // hex
    pub cell_id: u32,
    pub os_type: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOnResponseBody {
    pub result: EResult,
    #[serde(default)]
    pub steam_id: u64,
    #[serde(default)]
    pub cell_id: u32,
    #[serde(default)]
    pub heartbeat_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedOffBody {
    pub result: EResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfoBody {
    pub persona_name: String,
    #[serde(default)]
    pub country: Option<String>,
}

fn result_ok() -> EResult {
    EResult::Ok
}

/// Deserializes a list entry by entry, dropping entries that fail to parse.
fn skip_malformed<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping malformed list entry: {}", e);
                None
            }
        })
        .collect())
}

/// One entitlement record from the license list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub package_id: u32,
    #[serde(default)]
    pub time_created: u32,
    #[serde(default)]
    pub license_type: u32,
    #[serde(default)]
    pub flags: u32,
    /// Account id of the owner; differs from ours for family-shared licenses.
    #[serde(default)]
    pub owner_id: u32,
    #[serde(default)]
    pub access_token: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseListBody {
    #[serde(default = "result_ok")]
    pub result: EResult,
    #[serde(default, deserialize_with = "skip_malformed")]
    pub licenses: Vec<LicenseRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub package_id: u32,
    pub access_token: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductInfoRequestBody {
    #[serde(default)]
    pub packages: Vec<PackageRequest>,
    #[serde(default)]
    pub apps: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_id: u32,
    #[serde(default)]
    pub app_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub app_type: Option<String>,
    #[serde(default)]
    pub parent: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductInfoBody {
    #[serde(default, deserialize_with = "skip_malformed")]
    pub packages: Vec<PackageInfo>,
    #[serde(default, deserialize_with = "skip_malformed")]
    pub apps: Vec<AppInfo>,
    #[serde(default)]
    pub response_pending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRelationship {
    pub steam_id: u64,
    pub relationship: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendsListBody {
    pub incremental: bool,
    pub friends: Vec<FriendRelationship>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaInfo {
    pub steam_id: u64,
    #[serde(default)]
    pub player_name: Option<String>,
    #[serde(default)]
    pub persona_state: Option<u32>,
    #[serde(default)]
    pub game_name: Option<String>,
    #[serde(default)]
    pub game_played_app_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaStateBody {
    #[serde(deserialize_with = "skip_malformed")]
    pub friends: Vec<PersonaInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStatusBody {
    pub persona_state: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFriendDataBody {
    pub persona_state_requested: u32,
    pub friends: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nickname {
    pub steam_id: u64,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicknameListBody {
    pub nicknames: Vec<Nickname>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserStatsBody {
    pub game_id: u64,
    pub steam_id_for_user: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub stat_id: u32,
    pub stat_value: u32,
}

/// 32 achievement slots; a non-zero unlock time marks an unlocked bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AchievementBlock {
    pub achievement_id: u32,
    pub unlock_time: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatsBody {
    pub result: EResult,
    pub game_id: u64,
    #[serde(default)]
    pub stats: Vec<Stat>,
    #[serde(default)]
    pub achievement_blocks: Vec<AchievementBlock>,
    /// Stats schema as served by the backend; shape is only loosely fixed.
    #[serde(default)]
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPlayedTimesRequestBody {
    pub min_last_played: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayedGame {
    pub app_id: u32,
    /// Minutes.
    pub playtime_forever: u32,
    pub last_playtime: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPlayedTimesBody {
    pub games: Vec<PlayedGame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppOwnershipTicketRequestBody {
    pub app_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppOwnershipTicketBody {
    pub result: EResult,
    pub app_id: u32,
    #[serde(default)]
    pub ticket: String, // hex
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthListBody {
    pub tokens_left: u32,
    pub tickets: Vec<String>, // hex
    pub app_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsRequestBody {
    pub namespace: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub app_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsBody {
    pub collections: Vec<Collection>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            source_job: 0,
            target_job: 0,
            payload,
        }
    }

    pub fn with_source_job(mut self, job: u64) -> Self {
        self.source_job = job;
        self
    }

    pub fn with_target_job(mut self, job: u64) -> Self {
        self.target_job = job;
        self
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.payload.kind()
    }

    pub fn hello() -> Self {
        Self::new(Payload::ClientHello(HelloBody {
            protocol_version: PROTOCOL_VERSION,
        }))
    }

    pub fn heartbeat() -> Self {
        Self::new(Payload::ClientHeartBeat(Empty {}))
    }

    pub fn log_off() -> Self {
        Self::new(Payload::ClientLogOff(Empty {}))
    }

    pub fn channel_encrypt_response(client_nonce: String, sig: String) -> Self {
        Self::new(Payload::ChannelEncryptResponse(ChannelEncryptResponseBody {
            client_nonce,
            sig,
        }))
    }

    pub fn rsa_key_request(account_name: String) -> Self {
        Self::new(Payload::AuthGetPasswordRsaPublicKey(RsaKeyRequestBody {
            account_name,
        }))
    }

    pub fn change_status(persona_state: u32) -> Self {
        Self::new(Payload::ClientChangeStatus(ChangeStatusBody { persona_state }))
    }

    pub fn request_friend_data(persona_state_requested: u32, friends: Vec<u64>) -> Self {
        Self::new(Payload::ClientRequestFriendData(RequestFriendDataBody {
            persona_state_requested,
            friends,
        }))
    }

    pub fn packages_info(packages: Vec<PackageRequest>) -> Self {
        Self::new(Payload::ClientPicsProductInfoRequest(ProductInfoRequestBody {
            packages,
            apps: Vec::new(),
        }))
    }

    pub fn apps_info(apps: Vec<u32>) -> Self {
        Self::new(Payload::ClientPicsProductInfoRequest(ProductInfoRequestBody {
            packages: Vec::new(),
            apps,
        }))
    }

    pub fn user_stats(game_id: u64, steam_id_for_user: u64) -> Self {
        Self::new(Payload::ClientGetUserStats(GetUserStatsBody {
            game_id,
            steam_id_for_user,
        }))
    }

    pub fn last_played_times() -> Self {
        Self::new(Payload::PlayerGetLastPlayedTimes(LastPlayedTimesRequestBody {
            min_last_played: 0,
        }))
    }

    pub fn app_ownership_ticket(app_id: u32) -> Self {
        Self::new(Payload::ClientGetAppOwnershipTicket(
            AppOwnershipTicketRequestBody { app_id },
        ))
    }

    pub fn auth_list(ticket: &[u8], app_id: u32) -> Self {
        Self::new(Payload::ClientAuthList(AuthListBody {
            tokens_left: 0,
            tickets: vec![hex::encode(ticket)],
            app_ids: vec![app_id],
        }))
    }

    pub fn collections() -> Self {
        Self::new(Payload::CloudConfigDownload(CollectionsRequestBody { namespace: 1 }))
    }
}
