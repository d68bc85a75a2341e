pub mod crypto;
pub mod eresult;
pub mod framing;
pub mod messages;

pub use crypto::*;
pub use eresult::*;
pub use framing::*;
pub use messages::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    #[error("Truncated frame: {0} bytes is shorter than the message header")]
    Truncated(usize),

    #[error("Frame encryption failed: {0}")]
    Encryption(String),

    #[error("Frame decryption failed: {0}")]
    Decryption(String),

    #[error("Channel handshake failed: {0}")]
    ChannelHandshake(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
