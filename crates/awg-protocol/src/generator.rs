//! Client configuration payloads
//!
//! Depending on the application type a new peer receives either a
//! compressed `vpn://` link (AmneziaVPN app) or a plaintext AmneziaWG
//! profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};
use crate::link::{AwgBlock, ContainerEntry, LastConfig, VpnLink, PROTOCOL_VERSION, TRANSPORT_UDP};
use crate::params::{ObfuscationParam, ObfuscationParams};

/// Allowed IPs pushed to every client: full tunnel
pub const CLIENT_ALLOWED_IPS: [&str; 2] = ["0.0.0.0/0", "::/0"];

/// Which client application consumes a generated profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    /// AmneziaVPN app, receives a `vpn://` link
    AmneziaVpn,
    /// AmneziaWG app, receives a plaintext profile
    #[default]
    AmneziaWg,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::AmneziaVpn => "amnezia_vpn",
            AppType::AmneziaWg => "amnezia_wg",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amnezia_vpn" | "vpn" => Ok(AppType::AmneziaVpn),
            "amnezia_wg" | "wg" | "amneziawg" => Ok(AppType::AmneziaWg),
            _ => Err(ProtocolError::UnsupportedAppType(s.to_string())),
        }
    }
}

/// Generated client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum ConfigPayload {
    /// `vpn://` link
    Uri(String),
    /// Plaintext tunnel profile
    Text(String),
}

impl ConfigPayload {
    pub fn as_str(&self) -> &str {
        match self {
            ConfigPayload::Uri(value) | ConfigPayload::Text(value) => value,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            ConfigPayload::Uri(value) | ConfigPayload::Text(value) => value,
        }
    }
}

/// Everything needed to render one client's configuration
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub client_private_key: String,
    pub client_public_key: String,
    pub server_public_key: String,
    pub preshared_key: String,
    pub client_ip: Ipv4Addr,
    pub params: ObfuscationParams,
    /// Public host clients connect to
    pub host: String,
    pub port: u16,
    pub primary_dns: String,
    pub secondary_dns: String,
    pub container_name: String,
    /// Server display name, omitted from links when empty
    pub description: String,
    pub subnet_address: String,
    pub mtu: String,
    pub persistent_keepalive: u32,
}

/// Renders client configuration for a tunnel protocol
pub trait ConfigGenerator: Send + Sync {
    /// Render the payload for `app_type`
    fn render(&self, app_type: AppType, profile: &ClientProfile) -> Result<ConfigPayload>;

    /// Decode and verify a link produced by [`ConfigGenerator::render`]
    fn decode_link(&self, uri: &str) -> Result<VpnLink>;
}

/// Generator for AmneziaWG 2 clients
#[derive(Debug, Clone, Copy, Default)]
pub struct AwgConfigGenerator;

impl AwgConfigGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build the link document for a profile
    pub fn build_link(&self, profile: &ClientProfile) -> Result<VpnLink> {
        let params = profile.params.complete();
        let last_config = LastConfig {
            params: params.clone(),
            allowed_ips: CLIENT_ALLOWED_IPS.iter().map(|s| s.to_string()).collect(),
            client_id: profile.client_public_key.clone(),
            client_ip: profile.client_ip.to_string(),
            client_priv_key: profile.client_private_key.clone(),
            client_pub_key: profile.client_public_key.clone(),
            config: link_profile(profile, &params),
            host_name: profile.host.clone(),
            mtu: profile.mtu.clone(),
            persistent_keep_alive: profile.persistent_keepalive.to_string(),
            port: profile.port,
            psk_key: profile.preshared_key.clone(),
            server_pub_key: profile.server_public_key.clone(),
            extra: Default::default(),
        };

        Ok(VpnLink {
            containers: vec![ContainerEntry {
                awg: AwgBlock {
                    params,
                    last_config: last_config.to_embedded_json()?,
                    port: profile.port.to_string(),
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    subnet_address: profile.subnet_address.clone(),
                    transport_proto: TRANSPORT_UDP.to_string(),
                    extra: Default::default(),
                },
                container: profile.container_name.clone(),
            }],
            default_container: profile.container_name.clone(),
            description: profile.description.clone(),
            dns1: profile.primary_dns.clone(),
            dns2: profile.secondary_dns.clone(),
            host_name: profile.host.clone(),
        })
    }
}

impl ConfigGenerator for AwgConfigGenerator {
    fn render(&self, app_type: AppType, profile: &ClientProfile) -> Result<ConfigPayload> {
        match app_type {
            AppType::AmneziaVpn => {
                let link = self.build_link(profile)?;
                let uri = link.encode()?;
                // generated links must decode back to the same document
                if self.decode_link(&uri)? != link {
                    return Err(ProtocolError::CorruptPayload(
                        "generated link does not decode to its source".to_string(),
                    ));
                }
                Ok(ConfigPayload::Uri(uri))
            }
            AppType::AmneziaWg => Ok(ConfigPayload::Text(plaintext_profile(profile))),
        }
    }

    fn decode_link(&self, uri: &str) -> Result<VpnLink> {
        VpnLink::decode(uri)
    }
}

fn push_interface_params(out: &mut String, params: &ObfuscationParams) {
    for param in ObfuscationParam::INTERFACE_ORDER {
        out.push_str(&format!("{param} = {}\n", params.render(param)));
    }
}

/// Like [`push_interface_params`], leaving out parameters with no value
fn push_set_interface_params(out: &mut String, params: &ObfuscationParams) {
    for param in ObfuscationParam::INTERFACE_ORDER {
        let value = params.render(param);
        if !value.is_empty() {
            out.push_str(&format!("{param} = {value}\n"));
        }
    }
}

/// Profile embedded in a link; DNS stays as placeholders the app fills in
fn link_profile(profile: &ClientProfile, params: &ObfuscationParams) -> String {
    let mut out = String::from("[Interface]\n");
    out.push_str(&format!("Address = {}/32\n", profile.client_ip));
    out.push_str("DNS = $PRIMARY_DNS, $SECONDARY_DNS\n");
    out.push_str(&format!("MTU = {}\n", profile.mtu));
    out.push_str(&format!("PrivateKey = {}\n", profile.client_private_key));
    push_interface_params(&mut out, params);
    push_peer_stanza(&mut out, profile);
    out
}

/// Standalone AmneziaWG profile
pub fn plaintext_profile(profile: &ClientProfile) -> String {
    let mut out = String::from("[Interface]\n");
    out.push_str(&format!("Address = {}/32\n", profile.client_ip));
    out.push_str(&format!(
        "DNS = {}, {}\n",
        profile.primary_dns, profile.secondary_dns
    ));
    out.push_str(&format!("PrivateKey = {}\n", profile.client_private_key));
    push_set_interface_params(&mut out, &profile.params);
    push_peer_stanza(&mut out, profile);
    out
}

fn push_peer_stanza(out: &mut String, profile: &ClientProfile) {
    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", profile.server_public_key));
    out.push_str(&format!("PresharedKey = {}\n", profile.preshared_key));
    out.push_str(&format!("AllowedIPs = {}\n", CLIENT_ALLOWED_IPS.join(", ")));
    out.push_str(&format!("Endpoint = {}:{}\n", profile.host, profile.port));
    out.push_str(&format!(
        "PersistentKeepalive = {}\n",
        profile.persistent_keepalive
    ));
}
