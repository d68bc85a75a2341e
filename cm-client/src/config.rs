use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub account: AccountSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pre-shared key for channel encryption (hex-encoded); plaintext when absent
    #[serde(default)]
    pub channel_psk: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountSettings {
    #[serde(default)]
    pub account_name: String,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitSettings {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    /// Package sets at or above this size never trigger a full license reset
    #[serde(default = "default_license_reset_threshold")]
    pub license_reset_threshold: usize,
    #[serde(default = "default_achievement_concurrency")]
    pub achievement_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    27017
}

fn default_credentials_path() -> String {
    "credentials.toml".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reply_timeout() -> u64 {
    30
}

fn default_max_frame_bytes() -> u32 {
    cm_proto::DEFAULT_MAX_FRAME_SIZE
}

fn default_license_reset_threshold() -> usize {
    12_000
}

fn default_achievement_concurrency() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            channel_psk: None,
        }
    }
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            account_name: String::new(),
            credentials_path: default_credentials_path(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            reply_timeout_secs: default_reply_timeout(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            license_reset_threshold: default_license_reset_threshold(),
            achievement_concurrency: default_achievement_concurrency(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Builds the runtime session settings, decoding the channel key.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let channel_psk = match &self.connection.channel_psk {
            Some(psk) => Some(
                hex::decode(psk)
                    .map_err(|_| anyhow::anyhow!("Invalid channel PSK: must be hex-encoded"))?,
            ),
            None => None,
        };

        Ok(SessionConfig {
            channel_psk,
            reply_timeout: Duration::from_secs(self.timeouts.reply_timeout_secs),
            max_frame_bytes: self.limits.max_frame_bytes,
            license_reset_threshold: self.limits.license_reset_threshold,
            achievement_concurrency: self.limits.achievement_concurrency.max(1),
        })
    }
}

/// Settings consumed by [`crate::Session::connect`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_psk: Option<Vec<u8>>,
    pub reply_timeout: Duration,
    pub max_frame_bytes: u32,
    pub license_reset_threshold: usize,
    pub achievement_concurrency: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_psk: None,
            reply_timeout: Duration::from_secs(default_reply_timeout()),
            max_frame_bytes: default_max_frame_bytes(),
            license_reset_threshold: default_license_reset_threshold(),
            achievement_concurrency: default_achievement_concurrency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [connection]
            host = "cm.example.net"
            channel_psk = "00ff"

            [limits]
            achievement_concurrency = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.host, "cm.example.net");
        assert_eq!(config.connection.port, 27017);
        assert_eq!(config.limits.license_reset_threshold, 12_000);
        assert_eq!(config.timeouts.reply_timeout_secs, 30);

        let session = config.session_config().unwrap();
        assert_eq!(session.channel_psk, Some(vec![0x00, 0xff]));
        assert_eq!(session.achievement_concurrency, 4);
    }

    #[test]
    fn test_bad_psk_rejected() {
        let mut config = ClientConfig::default();
        config.connection.channel_psk = Some("not hex".to_string());

        assert!(config.session_config().is_err());
    }
}
