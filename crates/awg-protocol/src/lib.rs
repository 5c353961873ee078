//! AWG Protocol - AmneziaWG peer orchestration
//!
//! Manages peers of AmneziaWG (obfuscated WireGuard) interfaces running in
//! containers: reads the daemon's live dump, edits its config file in place,
//! allocates client addresses and renders client configurations, either as a
//! plaintext profile or as a compressed `vpn://` link for the AmneziaVPN app.
//!
//! # Modules
//!
//! - [`allocator`] - Client address allocation inside the interface subnet
//! - [`backend`] - Tunnel daemon control plane (`wg` / `wg-quick`)
//! - [`channel`] - Command execution on a target container
//! - [`codec`] - `vpn://` link encoding
//! - [`conf`] - Config file reading and peer section editing
//! - [`docker`] - Docker exec channel (bollard)
//! - [`dump`] - Live status dump parsing
//! - [`generator`] - Client configuration rendering
//! - [`registry`] - Protocol declarations and service cache
//! - [`service`] - Peer lifecycle orchestration
//! - [`settings`] - Server-wide settings
//! - [`testing`] - In-memory doubles
//!
//! # Example
//!
//! ```ignore
//! use awg_protocol::{DockerChannelFactory, ProtocolRegistry, ServerSettings};
//! use std::sync::Arc;
//!
//! let settings = ServerSettings::from_env()?;
//! let registry = ProtocolRegistry::load(
//!     settings.protocol_config_path.clone(),
//!     settings.clone(),
//!     Arc::new(DockerChannelFactory::local()?),
//! )
//! .await?;
//!
//! let service = registry.create("amneziawg2").await?;
//! let peer = service.create_peer("amnezia_vpn", None).await?;
//! println!("{} -> {}", peer.allocated_ip, peer.config.as_str());
//! ```

pub mod allocator;
pub mod backend;
pub mod channel;
pub mod codec;
pub mod conf;
pub mod docker;
pub mod dump;
pub mod error;
pub mod generator;
pub mod link;
pub mod params;
pub mod registry;
pub mod service;
pub mod settings;
pub mod testing;

// Re-export commonly used types
pub use allocator::IpAllocator;
pub use backend::{AwgBackend, AwgBackendConfig, TunnelBackend};
pub use channel::{ChannelFactory, CommandOutput, ExecutionChannel};
pub use docker::{DockerChannel, DockerChannelFactory};
pub use dump::{DumpParser, PeerStatus};
pub use error::{ErrorKind, ProtocolError, Result};
pub use generator::{AppType, AwgConfigGenerator, ClientProfile, ConfigGenerator, ConfigPayload};
pub use link::VpnLink;
pub use params::{ObfuscationParam, ObfuscationParams, ParamValue};
pub use registry::{ProtocolDefinition, ProtocolRegistry};
pub use service::{Peer, PeerResult, PeerUpdate, ProtocolService, TrafficSummary};
pub use settings::ServerSettings;
