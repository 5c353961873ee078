//! Server-wide settings shared by every protocol service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Settings that do not belong to a single protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Public host (name or IP) clients connect to
    #[serde(default = "default_public_host")]
    pub server_public_host: String,

    /// Name shown in client apps
    #[serde(default = "default_display_name")]
    pub server_display_name: String,

    /// Protocol declaration file
    #[serde(default = "default_protocol_config_path")]
    pub protocol_config_path: PathBuf,

    #[serde(default = "default_keepalive")]
    pub persistent_keepalive_seconds: u32,

    /// Handshake age under which a peer counts as online
    #[serde(default = "default_online_threshold")]
    pub peer_online_threshold_seconds: u64,

    /// Time budget for a single command on the execution target
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// MTU written into client links
    #[serde(default = "default_mtu")]
    pub mtu: String,
}

fn default_public_host() -> String {
    "127.0.0.1".to_string()
}

fn default_display_name() -> String {
    "AmneziaWG Server".to_string()
}

fn default_protocol_config_path() -> PathBuf {
    PathBuf::from("protocols.yaml")
}

fn default_keepalive() -> u32 {
    25
}

fn default_online_threshold() -> u64 {
    180
}

fn default_command_timeout() -> u64 {
    30
}

fn default_mtu() -> String {
    "1376".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_public_host: default_public_host(),
            server_display_name: default_display_name(),
            protocol_config_path: default_protocol_config_path(),
            persistent_keepalive_seconds: default_keepalive(),
            peer_online_threshold_seconds: default_online_threshold(),
            command_timeout_secs: default_command_timeout(),
            mtu: default_mtu(),
        }
    }
}

impl ServerSettings {
    /// Build from `AWG_*` environment variables, falling back to defaults
    ///
    /// Reads `AWG_SERVER_PUBLIC_HOST`, `AWG_SERVER_DISPLAY_NAME`,
    /// `AWG_PROTOCOL_CONFIG_PATH`, `AWG_PERSISTENT_KEEPALIVE_SECONDS`,
    /// `AWG_PEER_ONLINE_THRESHOLD_SECONDS`, `AWG_COMMAND_TIMEOUT_SECS` and
    /// `AWG_MTU`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerSettings::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(host) = lookup("AWG_SERVER_PUBLIC_HOST") {
            settings.server_public_host = host;
        }
        if let Some(name) = lookup("AWG_SERVER_DISPLAY_NAME") {
            settings.server_display_name = name;
        }
        if let Some(path) = lookup("AWG_PROTOCOL_CONFIG_PATH") {
            settings.protocol_config_path = PathBuf::from(path);
        }
        if let Some(value) = lookup("AWG_PERSISTENT_KEEPALIVE_SECONDS") {
            settings.persistent_keepalive_seconds =
                parse_number("AWG_PERSISTENT_KEEPALIVE_SECONDS", &value)?;
        }
        if let Some(value) = lookup("AWG_PEER_ONLINE_THRESHOLD_SECONDS") {
            settings.peer_online_threshold_seconds =
                parse_number("AWG_PEER_ONLINE_THRESHOLD_SECONDS", &value)?;
        }
        if let Some(value) = lookup("AWG_COMMAND_TIMEOUT_SECS") {
            settings.command_timeout_secs = parse_number("AWG_COMMAND_TIMEOUT_SECS", &value)?;
        }
        if let Some(mtu) = lookup("AWG_MTU") {
            settings.mtu = mtu;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let settings: Self = serde_yaml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_public_host.trim().is_empty() {
            return Err(ProtocolError::Config(
                "server_public_host must not be empty".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ProtocolError::Config(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn online_threshold(&self) -> Duration {
        Duration::from_secs(self.peer_online_threshold_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::Config(format!("{key} must be a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = ServerSettings::default();
        assert_eq!(settings.server_public_host, "127.0.0.1");
        assert_eq!(settings.persistent_keepalive_seconds, 25);
        assert_eq!(settings.online_threshold(), Duration::from_secs(180));
        assert_eq!(settings.command_timeout(), Duration::from_secs(30));
        assert_eq!(settings.mtu, "1376");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AWG_SERVER_PUBLIC_HOST", "vpn.example.com"),
            ("AWG_PEER_ONLINE_THRESHOLD_SECONDS", "60"),
            ("AWG_MTU", "1280"),
        ]
        .into_iter()
        .collect();
        let settings =
            ServerSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.server_public_host, "vpn.example.com");
        assert_eq!(settings.peer_online_threshold_seconds, 60);
        assert_eq!(settings.mtu, "1280");
        assert_eq!(settings.server_display_name, "AmneziaWG Server");
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let err = ServerSettings::from_lookup(|key| {
            (key == "AWG_COMMAND_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));

        let err = ServerSettings::from_lookup(|key| {
            (key == "AWG_COMMAND_TIMEOUT_SECS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "server_public_host: 203.0.113.7\nmtu: \"1420\"\n").unwrap();
        let settings = ServerSettings::from_yaml_file(&path).unwrap();
        assert_eq!(settings.server_public_host, "203.0.113.7");
        assert_eq!(settings.mtu, "1420");
        assert_eq!(settings.command_timeout_secs, 30);
    }
}
