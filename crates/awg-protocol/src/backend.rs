//! Tunnel backends
//!
//! A [`TunnelBackend`] is everything the peer service needs from the
//! tunnel daemon: its live dump, its config file, live sync and key
//! material. [`AwgBackend`] drives the AmneziaWG tools (`wg`, `wg-quick`)
//! over an [`ExecutionChannel`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::channel::{shell_quote, ExecutionChannel};
use crate::error::Result;

/// Server public key file under the config directory
pub const SERVER_PUBLIC_KEY_FILE: &str = "wireguard_server_public_key.key";

/// Preshared key file under the config directory
pub const PRESHARED_KEY_FILE: &str = "wireguard_psk.key";

/// Control-plane operations of a tunnel daemon
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Raw live-status dump
    async fn peers_dump(&self) -> Result<String>;

    /// Current config file text
    async fn read_config(&self) -> Result<String>;

    /// Replace the config file
    async fn write_config(&self, content: &str) -> Result<()>;

    /// Apply the config file to the running interface without dropping sessions
    async fn sync_config(&self) -> Result<()>;

    /// Fresh base64 private key
    async fn generate_private_key(&self) -> Result<String>;

    /// Public key for a base64 private key
    async fn derive_public_key(&self, private_key: &str) -> Result<String>;

    async fn server_public_key(&self) -> Result<String>;

    /// Preshared key shared by all peers of the interface
    async fn preshared_key(&self) -> Result<String>;
}

/// Backend settings resolved from a protocol definition
#[derive(Debug, Clone)]
pub struct AwgBackendConfig {
    pub interface: String,
    /// Directory holding `<interface>.conf` and the key files
    pub config_path: String,
    pub wg_command: String,
    pub wg_quick_command: String,
}

impl AwgBackendConfig {
    pub fn config_file(&self) -> String {
        format!("{}/{}.conf", self.dir(), self.interface)
    }

    pub fn key_file(&self, name: &str) -> String {
        format!("{}/{}", self.dir(), name)
    }

    fn dir(&self) -> &str {
        self.config_path.trim_end_matches('/')
    }
}

/// AmneziaWG backend over an execution channel
pub struct AwgBackend {
    channel: Arc<dyn ExecutionChannel>,
    config: AwgBackendConfig,
}

impl std::fmt::Debug for AwgBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwgBackend")
            .field("target", &self.channel.target())
            .field("config", &self.config)
            .finish()
    }
}

impl AwgBackend {
    pub fn new(channel: Arc<dyn ExecutionChannel>, config: AwgBackendConfig) -> Self {
        Self { channel, config }
    }

    pub fn config(&self) -> &AwgBackendConfig {
        &self.config
    }

    pub fn dump_command(&self) -> String {
        format!("{} show {} dump", self.config.wg_command, shell_quote(&self.config.interface))
    }

    pub fn sync_command(&self) -> String {
        format!(
            "{} strip {} | {} syncconf {} /dev/stdin",
            self.config.wg_quick_command,
            shell_quote(&self.config.config_file()),
            self.config.wg_command,
            shell_quote(&self.config.interface)
        )
    }

    async fn read_key(&self, name: &str) -> Result<String> {
        let content = self.channel.read_file(&self.config.key_file(name)).await?;
        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl TunnelBackend for AwgBackend {
    #[instrument(
        skip(self),
        fields(otel.name = "awg.dump", interface = %self.config.interface)
    )]
    async fn peers_dump(&self) -> Result<String> {
        let output = self.channel.run(&self.dump_command(), true).await?;
        debug!(bytes = output.stdout.len(), "read live dump");
        Ok(output.stdout)
    }

    async fn read_config(&self) -> Result<String> {
        self.channel.read_file(&self.config.config_file()).await
    }

    #[instrument(
        skip(self, content),
        fields(otel.name = "awg.write_config", interface = %self.config.interface)
    )]
    async fn write_config(&self, content: &str) -> Result<()> {
        self.channel
            .write_file(&self.config.config_file(), content)
            .await?;
        info!(bytes = content.len(), "wrote tunnel config");
        Ok(())
    }

    #[instrument(
        skip(self),
        fields(otel.name = "awg.sync", interface = %self.config.interface)
    )]
    async fn sync_config(&self) -> Result<()> {
        self.channel.run(&self.sync_command(), true).await?;
        info!("synced tunnel config");
        Ok(())
    }

    async fn generate_private_key(&self) -> Result<String> {
        let command = format!("{} genkey", self.config.wg_command);
        let output = self.channel.run(&command, true).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String> {
        let command = format!(
            "printf '%s' {} | {} pubkey",
            shell_quote(private_key),
            self.config.wg_command
        );
        let output = self.channel.run(&command, true).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn server_public_key(&self) -> Result<String> {
        self.read_key(SERVER_PUBLIC_KEY_FILE).await
    }

    async fn preshared_key(&self) -> Result<String> {
        self.read_key(PRESHARED_KEY_FILE).await
    }
}
