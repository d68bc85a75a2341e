use crate::{ProtocolError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the AES-GCM nonce prefixed to every encrypted frame
pub const CHANNEL_NONCE_LEN: usize = 12;

/// Length of a generated machine identifier
pub const MACHINE_ID_LEN: usize = 32;

/// Generates a random nonce as a hex string
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let nonce: [u8; 16] = rng.gen();
    hex::encode(nonce)
}

/// Generates a fresh machine identifier.
///
/// Called once per installation; the result must be persisted and reused.
pub fn generate_machine_id() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let id: [u8; MACHINE_ID_LEN] = rng.gen();
    id.to_vec()
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .expect("HMAC can take key of any size");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Computes HMAC-SHA256 and returns hex-encoded string
pub fn compute_hmac(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_bytes(key, data))
}

/// Computes the channel handshake signature:
/// HMAC(PSK, server_nonce | client_nonce)
pub fn compute_channel_signature(psk: &[u8], server_nonce: &str, client_nonce: &str) -> String {
    let data = format!("{}{}", server_nonce, client_nonce);
    compute_hmac(psk, data.as_bytes())
}

/// Derives the channel key from PSK and handshake nonces:
/// channel_key = HMAC(PSK, "channel" | server_nonce | client_nonce)
pub fn derive_channel_key(psk: &[u8], server_nonce: &str, client_nonce: &str) -> [u8; 32] {
    let data = format!("channel{}{}", server_nonce, client_nonce);
    hmac_bytes(psk, data.as_bytes())
}

/// Symmetric cipher applied to frame bodies once channel encryption is up.
#[derive(Clone)]
pub struct ChannelCipher {
    key: [u8; 32],
}

impl ChannelCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypts with a random nonce; output is `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

        let nonce_bytes: [u8; CHANNEL_NONCE_LEN] = rand::thread_rng().gen();
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < CHANNEL_NONCE_LEN {
            return Err(ProtocolError::Decryption("ciphertext too short".to_string()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?;

        let (nonce_bytes, ciphertext) = data.split_at(CHANNEL_NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))
    }
}

impl std::fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelCipher(..)")
    }
}
