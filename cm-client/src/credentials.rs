//! Persistence boundary for session credentials.
//!
//! Values are opaque byte blobs keyed by name. The session never touches
//! the filesystem itself; it only talks to a [`CredentialStore`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub const MACHINE_ID: &str = "machine_id";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const STEAM_ID: &str = "steam_id";
pub const ACCOUNT_NAME: &str = "account_name";
pub const OWNERSHIP_TICKET: &str = "ownership_ticket";

/// Key-value store for credentials that outlive a process.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
}

/// Returns the persisted machine id, generating and storing one on first use.
pub async fn ensure_machine_id(store: &dyn CredentialStore) -> anyhow::Result<Vec<u8>> {
    if let Some(id) = store.get(MACHINE_ID).await {
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let id = cm_proto::generate_machine_id();
    store.set(MACHINE_ID, &id).await?;
    info!("Generated new machine id");
    Ok(id)
}

/// Reads a string credential; non-UTF-8 blobs count as absent.
pub async fn get_string(store: &dyn CredentialStore, key: &str) -> Option<String> {
    let bytes = store.get(key).await?;
    match String::from_utf8(bytes) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Stored {} is not valid UTF-8, ignoring", key);
            None
        }
    }
}

/// Reads a big-endian u64 credential.
pub async fn get_u64(store: &dyn CredentialStore, key: &str) -> Option<u64> {
    let bytes = store.get(key).await?;
    let raw: [u8; 8] = bytes.as_slice().try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

/// In-memory store for tests and throwaway sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.read().ok()?.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.values
            .write()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// TOML file holding hex-encoded values in a single table.
///
/// The whole file is rewritten on every `set`.
#[derive(Debug)]
pub struct TomlFileStore {
    path: PathBuf,
    values: tokio::sync::RwLock<BTreeMap<String, String>>,
}

impl TomlFileStore {
    /// Opens the store, starting empty if the file is missing or unreadable.
    pub async fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let values = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match toml::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring unreadable credential file {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        Self {
            path,
            values: tokio::sync::RwLock::new(values),
        }
    }
}

#[async_trait]
impl CredentialStore for TomlFileStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let values = self.values.read().await;
        hex::decode(values.get(key)?).ok()
    }

    async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), hex::encode(value));

        let contents = toml::to_string(&*values)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_machine_id_generated_once() {
        let store = MemoryStore::new();

        let first = ensure_machine_id(&store).await.unwrap();
        let second = ensure_machine_id(&store).await.unwrap();

        assert_eq!(first.len(), cm_proto::MACHINE_ID_LEN);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_typed_getters() {
        let store = MemoryStore::new();
        store.set(STEAM_ID, &76561197960287930u64.to_be_bytes()).await.unwrap();
        store.set(ACCOUNT_NAME, b"gordon").await.unwrap();
        store.set(REFRESH_TOKEN, &[0xff, 0xfe]).await.unwrap();

        assert_eq!(get_u64(&store, STEAM_ID).await, Some(76561197960287930));
        assert_eq!(get_string(&store, ACCOUNT_NAME).await.as_deref(), Some("gordon"));
        assert_eq!(get_string(&store, REFRESH_TOKEN).await, None);
        assert_eq!(get_u64(&store, ACCOUNT_NAME).await, None);
    }

    #[tokio::test]
    async fn test_toml_store_persists() {
        let dir = std::env::temp_dir().join(format!("cm-creds-{}", cm_proto::generate_nonce()));
        let path = dir.join("credentials.toml");

        let store = TomlFileStore::open(&path).await;
        let id = ensure_machine_id(&store).await.unwrap();
        store.set(REFRESH_TOKEN, b"token").await.unwrap();

        let reopened = TomlFileStore::open(&path).await;
        assert_eq!(reopened.get(MACHINE_ID).await, Some(id));
        assert_eq!(get_string(&reopened, REFRESH_TOKEN).await.as_deref(), Some("token"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
