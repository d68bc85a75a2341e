use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! eresults {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Numeric result code attached to most server replies.
        ///
        /// Codes outside the known table are preserved as [`EResult::Other`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "u32", into = "u32")]
        pub enum EResult {
            $($name,)+
            Other(u32),
        }

        impl EResult {
            pub fn from_code(code: u32) -> Self {
                match code {
                    $($code => EResult::$name,)+
                    other => EResult::Other(other),
                }
            }

            pub fn code(self) -> u32 {
                match self {
                    $(EResult::$name => $code,)+
                    EResult::Other(code) => code,
                }
            }

            /// Every code with a name in the table.
            pub const KNOWN: &'static [EResult] = &[$(EResult::$name,)+];
        }
    };
}

eresults! {
    Ok = 1,
    Fail = 2,
    NoConnection = 3,
    InvalidPassword = 5,
    LoggedInElsewhere = 6,
    InvalidProtocolVer = 7,
    InvalidParam = 8,
    FileNotFound = 9,
    Busy = 10,
    InvalidState = 11,
    AccessDenied = 15,
    Timeout = 16,
    Banned = 17,
    AccountNotFound = 18,
    InvalidSteamID = 19,
    ServiceUnavailable = 20,
    NotLoggedOn = 21,
    Pending = 22,
    EncryptionFailure = 23,
    InsufficientPrivilege = 24,
    LimitExceeded = 25,
    Revoked = 26,
    Expired = 27,
    DuplicateRequest = 29,
    IPNotFound = 31,
    LogonSessionReplaced = 34,
    ConnectFailed = 35,
    HandshakeFailed = 36,
    IOFailure = 37,
    RemoteDisconnect = 38,
    Blocked = 40,
    Ignored = 41,
    NoMatch = 42,
    AccountDisabled = 43,
    ServiceReadOnly = 44,
    AccountNotFeatured = 45,
    TryAnotherCM = 48,
    AlreadyLoggedInElsewhere = 50,
    Suspended = 51,
    Cancelled = 52,
    DataCorruption = 53,
    DiskFull = 54,
    RemoteCallFailed = 55,
    RemoteFileConflict = 60,
    AccountLogonDenied = 63,
    InvalidLoginAuthCode = 65,
    AccountLogonDeniedNoMailSent = 66,
    ExpiredLoginAuthCode = 71,
    AccountLocked = 73,
    AccountLogonDeniedVerifiedEmailRequired = 74,
    BadResponse = 76,
    RequirePasswordReEntry = 77,
    UnexpectedError = 79,
    RateLimitExceeded = 84,
    AccountLoginDeniedNeedTwoFactor = 85,
    AccountLoginDeniedThrottle = 87,
    TwoFactorCodeMismatch = 88,
    TwoFactorActivationCodeMismatch = 89,
}

impl From<u32> for EResult {
    fn from(code: u32) -> Self {
        EResult::from_code(code)
    }
}

impl From<EResult> for u32 {
    fn from(result: EResult) -> Self {
        result.code()
    }
}

impl fmt::Display for EResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EResult::Other(code) => write!(f, "EResult({})", code),
            known => write!(f, "{:?}({})", known, known.code()),
        }
    }
}

/// Error taxonomy every non-OK result code collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    InvalidCredentials,
    NetworkError,
    BackendNotAvailable,
    BackendTimeout,
    TemporaryBlocked,
    Banned,
    AccessDenied,
    BackendError,
    Unknown,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendErrorKind::InvalidCredentials => "invalid credentials",
            BackendErrorKind::NetworkError => "network error",
            BackendErrorKind::BackendNotAvailable => "backend not available",
            BackendErrorKind::BackendTimeout => "backend timeout",
            BackendErrorKind::TemporaryBlocked => "temporarily blocked",
            BackendErrorKind::Banned => "banned",
            BackendErrorKind::AccessDenied => "access denied",
            BackendErrorKind::BackendError => "backend error",
            BackendErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Maps a non-OK result code onto the error taxonomy.
///
/// # Panics
///
/// Panics when called with [`EResult::Ok`]; success is never an error.
pub fn translate_error(result: EResult) -> BackendErrorKind {
    assert_ne!(result, EResult::Ok, "translate_error called with a success code");

    use EResult::*;
    match result {
        InvalidPassword
        | AccountNotFound
        | InvalidSteamID
        | InvalidLoginAuthCode
        | AccountLogonDeniedNoMailSent
        | AccountLoginDeniedNeedTwoFactor
        | TwoFactorCodeMismatch
        | TwoFactorActivationCodeMismatch => BackendErrorKind::InvalidCredentials,

        ConnectFailed | IOFailure | RemoteDisconnect => BackendErrorKind::NetworkError,

        Busy | ServiceUnavailable | Pending | IPNotFound | TryAnotherCM | Cancelled => {
            BackendErrorKind::BackendNotAvailable
        }

        Timeout => BackendErrorKind::BackendTimeout,

        RateLimitExceeded
        | LimitExceeded
        | Suspended
        | AccountLocked
        | AccountLogonDeniedVerifiedEmailRequired => BackendErrorKind::TemporaryBlocked,

        Banned => BackendErrorKind::Banned,

        AccessDenied
        | InsufficientPrivilege
        | LogonSessionReplaced
        | Blocked
        | Ignored
        | AccountDisabled
        | AccountNotFeatured => BackendErrorKind::AccessDenied,

        DataCorruption | DiskFull | RemoteCallFailed | RemoteFileConflict | BadResponse => {
            BackendErrorKind::BackendError
        }

        _ => BackendErrorKind::Unknown,
    }
}
