use cm_proto::{translate_error, BackendErrorKind, EResult, MessageKind, ProtocolError};

/// Errors surfaced by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{kind} (result: {result})")]
    Backend {
        kind: BackendErrorKind,
        result: EResult,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A single-slot exchange was started again before its reply arrived.
    #[error("{0} request already in flight")]
    RequestInFlight(&'static str),

    /// The server answered a request nobody is waiting for.
    #[error("unsolicited {kind} with result {result}")]
    UnsolicitedReply { kind: MessageKind, result: EResult },

    #[error("unexpected reply: expected {expected}, got kind {got}")]
    UnexpectedReply { expected: &'static str, got: u32 },

    #[error("no authentication session in progress")]
    NoAuthSession,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("credential store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl SessionError {
    /// Builds the hard-failure error for a non-OK result code.
    pub fn backend(result: EResult) -> Self {
        SessionError::Backend {
            kind: translate_error(result),
            result,
        }
    }

    /// Projects this error onto the backend error taxonomy.
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            SessionError::Backend { kind, .. } => *kind,
            SessionError::ConnectionClosed => BackendErrorKind::NetworkError,
            SessionError::Protocol(ProtocolError::Io(_)) => BackendErrorKind::NetworkError,
            SessionError::Protocol(_) => BackendErrorKind::BackendError,
            SessionError::Timeout(_) => BackendErrorKind::BackendTimeout,
            SessionError::UnsolicitedReply { result, .. } if *result != EResult::Ok => {
                translate_error(*result)
            }
            SessionError::NotAuthenticated => BackendErrorKind::AccessDenied,
            _ => BackendErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_projection() {
        assert_eq!(
            SessionError::ConnectionClosed.kind(),
            BackendErrorKind::NetworkError
        );
        assert_eq!(
            SessionError::backend(EResult::Banned).kind(),
            BackendErrorKind::Banned
        );
        assert_eq!(
            SessionError::UnsolicitedReply {
                kind: MessageKind::ClientLogOnResponse,
                result: EResult::TryAnotherCM,
            }
            .kind(),
            BackendErrorKind::BackendNotAvailable
        );
        assert_eq!(
            SessionError::RequestInFlight("login").kind(),
            BackendErrorKind::Unknown
        );
    }
}
