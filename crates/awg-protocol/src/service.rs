//! Peer orchestration for one protocol
//!
//! [`ProtocolService`] lists, creates, updates and deletes peers by
//! reconciling the daemon's live dump with its config file. Every
//! read-modify-write of the config file runs under the protocol's mutex, so
//! concurrent requests never lose each other's edits or share an address.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::allocator::{self, host_cidr, IpAllocator};
use crate::backend::TunnelBackend;
use crate::conf::{self, PeerEntry};
use crate::dump::{DumpParser, PeerStatus};
use crate::error::{ProtocolError, Result};
use crate::generator::{AppType, ClientProfile, ConfigGenerator, ConfigPayload};
use crate::registry::ProtocolDefinition;
use crate::settings::ServerSettings;

/// A peer as seen by callers: live status plus its application type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(flatten)]
    pub status: PeerStatus,
    pub app_type: AppType,
}

impl Peer {
    pub fn public_key(&self) -> &str {
        &self.status.public_key
    }
}

/// Result of creating a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerResult {
    pub protocol: String,
    pub app_type: AppType,
    pub config: ConfigPayload,
    pub public_key: String,
    pub private_key: String,
    /// `a.b.c.d/32`
    pub allocated_ip: String,
    /// `host:port` clients connect to
    pub endpoint: String,
}

/// Result of re-keying a peer under a new application type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub old_public_key: String,
    pub peer: PeerResult,
}

/// Aggregated traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub total_rx_bytes: u64,
    pub total_tx_bytes: u64,
    pub total_peers: usize,
    pub online_peers: usize,
}

#[derive(Debug, Clone, Copy)]
enum AddressChoice {
    /// Lowest free address
    Next,
    /// Caller-chosen, validated against the live dump
    Requested(Ipv4Addr),
    /// Address of the peer being replaced, taken as is
    Preserved(Ipv4Addr),
}

/// Orchestrates peers of one protocol
pub struct ProtocolService {
    definition: ProtocolDefinition,
    backend: Arc<dyn TunnelBackend>,
    generator: Arc<dyn ConfigGenerator>,
    settings: ServerSettings,
    parser: DumpParser,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ProtocolService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolService")
            .field("protocol", &self.definition.name)
            .field("container", &self.definition.container_name)
            .finish_non_exhaustive()
    }
}

impl ProtocolService {
    pub fn new(
        definition: ProtocolDefinition,
        backend: Arc<dyn TunnelBackend>,
        generator: Arc<dyn ConfigGenerator>,
        settings: ServerSettings,
    ) -> Self {
        let parser = DumpParser::new(settings.online_threshold());
        Self {
            definition,
            backend,
            generator,
            settings,
            parser,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Share a config-file lock with other services of the same protocol
    pub fn with_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.lock = lock;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ProtocolDefinition {
        &self.definition
    }

    pub fn generator(&self) -> &dyn ConfigGenerator {
        self.generator.as_ref()
    }

    /// All peers: configured ones in file order, then peers only the daemon knows
    #[instrument(
        skip(self),
        fields(otel.name = "protocol.list_peers", protocol = %self.definition.name)
    )]
    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        let dump = self
            .read_step("peers_dump", || self.backend.peers_dump())
            .await?;
        let config = self
            .read_step("read_config", || self.backend.read_config())
            .await?;
        Ok(self.merge_peers(&dump, &config))
    }

    /// One peer by public key
    pub async fn get_peer(&self, public_key: &str) -> Result<Peer> {
        self.list_peers()
            .await?
            .into_iter()
            .find(|peer| peer.public_key() == public_key)
            .ok_or_else(|| ProtocolError::PeerNotFound(public_key.to_string()))
    }

    /// Peers filtered by online state; `None` returns all of them
    pub async fn peers_status(&self, online_only: Option<bool>) -> Result<Vec<Peer>> {
        let peers = self.list_peers().await?;
        Ok(match online_only {
            Some(online) => peers
                .into_iter()
                .filter(|peer| peer.status.online == online)
                .collect(),
            None => peers,
        })
    }

    pub async fn traffic_summary(&self) -> Result<TrafficSummary> {
        let peers = self.list_peers().await?;
        Ok(peers.iter().fold(TrafficSummary::default(), |mut acc, peer| {
            acc.total_rx_bytes += peer.status.rx_bytes;
            acc.total_tx_bytes += peer.status.tx_bytes;
            acc.total_peers += 1;
            if peer.status.online {
                acc.online_peers += 1;
            }
            acc
        }))
    }

    /// Create a peer and render its client configuration
    ///
    /// `requested_address` may be an IPv4 address with or without `/32`;
    /// without it the lowest free address of the subnet is used.
    #[instrument(
        skip(self),
        fields(otel.name = "protocol.create_peer", protocol = %self.definition.name)
    )]
    pub async fn create_peer(
        &self,
        app_type: &str,
        requested_address: Option<&str>,
    ) -> Result<PeerResult> {
        let app_type: AppType = app_type.parse()?;
        let choice = match requested_address {
            Some(address) => AddressChoice::Requested(allocator::parse_requested(address)?),
            None => AddressChoice::Next,
        };

        let _guard = self.lock.lock().await;
        let config = self
            .read_step("read_config", || self.backend.read_config())
            .await?;
        let (updated, peer) = self.provision(app_type, &config, choice).await?;
        self.commit(&updated).await?;

        info!(
            allocated_ip = %peer.allocated_ip,
            app_type = %peer.app_type,
            "Peer created"
        );
        Ok(peer)
    }

    /// Remove every section of `public_key`; `false` when there was none
    #[instrument(
        skip(self),
        fields(otel.name = "protocol.delete_peer", protocol = %self.definition.name)
    )]
    pub async fn delete_peer(&self, public_key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let config = self
            .read_step("read_config", || self.backend.read_config())
            .await?;

        let (updated, removed) = conf::remove_peer(&config, public_key);
        if removed == 0 {
            debug!("peer not in config, nothing to delete");
            return Ok(false);
        }

        self.commit(&updated).await?;
        info!(sections = removed, "Peer deleted");
        Ok(true)
    }

    /// Replace a peer with a freshly keyed one of another application type.
    ///
    /// The peer keeps its address. Removal and re-creation land in a single
    /// config write and sync.
    #[instrument(
        skip(self),
        fields(otel.name = "protocol.update_peer", protocol = %self.definition.name)
    )]
    pub async fn update_peer(&self, public_key: &str, app_type: &str) -> Result<PeerUpdate> {
        let app_type: AppType = app_type.parse()?;

        let _guard = self.lock.lock().await;
        let config = self
            .read_step("read_config", || self.backend.read_config())
            .await?;

        let section = conf::peer_sections(&config)
            .into_iter()
            .find(|section| section.public_key.as_deref() == Some(public_key))
            .ok_or_else(|| ProtocolError::PeerNotFound(public_key.to_string()))?;

        let (without, _) = conf::remove_peer(&config, public_key);
        let choice = section
            .first_ipv4()
            .map(AddressChoice::Preserved)
            .unwrap_or(AddressChoice::Next);

        let (updated, peer) = self.provision(app_type, &without, choice).await?;
        self.commit(&updated).await?;

        info!(
            new_public_key = %peer.public_key,
            allocated_ip = %peer.allocated_ip,
            app_type = %peer.app_type,
            "Peer updated"
        );
        Ok(PeerUpdate {
            old_public_key: public_key.to_string(),
            peer,
        })
    }

    /// Keys, address and rendered payload for a new peer, plus the config
    /// text that contains it. Nothing is written here.
    async fn provision(
        &self,
        app_type: AppType,
        base_config: &str,
        choice: AddressChoice,
    ) -> Result<(String, PeerResult)> {
        let private_key = self.backend.generate_private_key().await?;
        let public_key = self.backend.derive_public_key(&private_key).await?;

        let network = conf::interface_cidr(base_config)?;
        let port = conf::listen_port(base_config)?;

        let ip = match choice {
            AddressChoice::Preserved(ip) => ip,
            AddressChoice::Requested(ip) => {
                self.allocator(network, base_config)
                    .await?
                    .check_available(ip)?;
                ip
            }
            AddressChoice::Next => self.allocator(network, base_config).await?.next_available()?,
        };
        let allocated_ip = host_cidr(ip);

        let preshared_key = self
            .read_step("preshared_key", || self.backend.preshared_key())
            .await?;
        let server_public_key = self
            .read_step("server_public_key", || self.backend.server_public_key())
            .await?;

        let updated = conf::append_peer(
            base_config,
            &PeerEntry {
                public_key: &public_key,
                preshared_key: &preshared_key,
                allowed_ips: &allocated_ip,
                app_type: app_type.as_str(),
            },
        );

        let profile = ClientProfile {
            client_private_key: private_key.clone(),
            client_public_key: public_key.clone(),
            server_public_key,
            preshared_key,
            client_ip: ip,
            params: conf::extract_obfuscation_params(&updated, &self.definition.awg_junk_params),
            host: self.settings.server_public_host.clone(),
            port,
            primary_dns: self.definition.primary_dns.clone(),
            secondary_dns: self.definition.secondary_dns.clone(),
            container_name: self.definition.container_name.clone(),
            description: self.settings.server_display_name.clone(),
            subnet_address: conf::subnet_address(base_config)
                .unwrap_or_else(|| self.definition.default_subnet_address.clone()),
            mtu: self.settings.mtu.clone(),
            persistent_keepalive: self.settings.persistent_keepalive_seconds,
        };
        let config = self.generator.render(app_type, &profile)?;

        Ok((
            updated,
            PeerResult {
                protocol: self.definition.name.clone(),
                app_type,
                config,
                public_key,
                private_key,
                allocated_ip,
                endpoint: format!("{}:{}", self.settings.server_public_host, port),
            },
        ))
    }

    /// Allocator seeded with every address the live dump reports and every
    /// address already written to the config file, synced or not
    async fn allocator(&self, network: ipnet::Ipv4Net, config: &str) -> Result<IpAllocator> {
        let dump = self
            .read_step("peers_dump", || self.backend.peers_dump())
            .await?;
        let mut allocator = IpAllocator::from_network(network);
        for status in self.parser.parse(&dump).values() {
            allocator.mark_used(status.allowed_ips.iter().map(String::as_str));
        }
        for section in conf::peer_sections(config) {
            allocator.mark_used(section.allowed_ips.iter().map(String::as_str));
        }
        Ok(allocator)
    }

    /// Write the config and apply it. Never retried.
    async fn commit(&self, config: &str) -> Result<()> {
        self.backend.write_config(config).await?;
        self.backend.sync_config().await
    }

    fn merge_peers(&self, dump: &str, config: &str) -> Vec<Peer> {
        let mut live = self.parser.parse(dump);
        let mut seen = HashSet::new();
        let mut peers = Vec::new();

        for section in conf::peer_sections(config) {
            let Some(key) = section.public_key else {
                continue;
            };
            if !seen.insert(key.clone()) {
                continue;
            }
            let app_type = section
                .app_type
                .as_deref()
                .and_then(|tag| tag.parse().ok())
                .unwrap_or_default();
            let status = live
                .remove(&key)
                .unwrap_or_else(|| PeerStatus::offline(key, section.allowed_ips));
            peers.push(Peer { status, app_type });
        }

        peers.extend(live.into_values().map(|status| Peer {
            status,
            app_type: AppType::default(),
        }));
        peers
    }

    /// Run a read-only step, retrying once if it timed out
    async fn read_step<T, F, Fut>(&self, step: &'static str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(e) if e.is_retryable() => {
                warn!(
                    protocol = %self.definition.name,
                    step,
                    error = %e,
                    "read step timed out, retrying once"
                );
                op().await
            }
            result => result,
        }
    }
}
