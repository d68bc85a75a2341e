//! Session layer for the CM protocol: authentication, message dispatch and
//! the caches built from server pushes.

pub mod auth;
pub mod cache;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod session;

pub use auth::{AuthChallenge, AuthState, KeyExchange, LoginOutcome, PollStatus, PollingDescriptor};
pub use config::{ClientConfig, SessionConfig};
pub use credentials::{CredentialStore, MemoryStore, TomlFileStore};
pub use error::{Result, SessionError};
pub use session::{Session, SessionExtras};
