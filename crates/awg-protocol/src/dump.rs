//! Parsing of `wg show <interface> dump` output
//!
//! The first line describes the interface itself and is ignored. Every
//! following line is one peer, tab separated:
//!
//! ```text
//! public-key  preshared-key  endpoint  allowed-ips  latest-handshake  rx  tx  keepalive
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Endpoint value for peers that never connected
pub const NO_ENDPOINT: &str = "(none)";

/// Keepalive value when persistent keepalive is disabled
pub const KEEPALIVE_OFF: &str = "off";

/// Default age after which a handshake no longer counts as online (3 minutes)
pub const DEFAULT_ONLINE_THRESHOLD_SECS: u64 = 180;

const MIN_FIELDS: usize = 8;

/// Live state of a single peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Seconds, 0 when disabled
    pub persistent_keepalive: u32,
    pub online: bool,
}

impl PeerStatus {
    /// Status for a peer that is configured but absent from the live dump
    pub fn offline(public_key: impl Into<String>, allowed_ips: Vec<String>) -> Self {
        Self {
            public_key: public_key.into(),
            endpoint: None,
            allowed_ips,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            persistent_keepalive: 0,
            online: false,
        }
    }
}

/// Parser for the daemon's tabular dump
///
/// `online` is a heuristic: a peer counts as online while its latest
/// handshake is strictly younger than the threshold. WireGuard re-handshakes
/// roughly every two minutes on an active session, but nothing in the
/// protocol guarantees it, and clock skew between this process and the
/// execution target shifts the boundary.
#[derive(Debug, Clone, Copy)]
pub struct DumpParser {
    online_threshold: Duration,
}

impl Default for DumpParser {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_ONLINE_THRESHOLD_SECS))
    }
}

impl DumpParser {
    pub fn new(online_threshold: Duration) -> Self {
        Self { online_threshold }
    }

    pub fn online_threshold(&self) -> Duration {
        self.online_threshold
    }

    /// Parse a dump against the current wall clock
    pub fn parse(&self, dump: &str) -> BTreeMap<String, PeerStatus> {
        self.parse_at(dump, Utc::now())
    }

    /// Parse a dump, deriving `online` relative to `now`
    pub fn parse_at(&self, dump: &str, now: DateTime<Utc>) -> BTreeMap<String, PeerStatus> {
        let mut peers = BTreeMap::new();

        for (index, line) in dump.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_row(line, now) {
                Some(status) => {
                    peers.insert(status.public_key.clone(), status);
                }
                None => {
                    debug!(line = index + 1, "skipping malformed dump row");
                }
            }
        }

        peers
    }

    fn parse_row(&self, line: &str, now: DateTime<Utc>) -> Option<PeerStatus> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < MIN_FIELDS {
            return None;
        }

        let public_key = fields[0].trim();
        if public_key.is_empty() {
            return None;
        }

        let endpoint = match fields[2].trim() {
            NO_ENDPOINT | "" => None,
            value => Some(value.to_string()),
        };

        let allowed_ips = fields[3]
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty() && *ip != "(none)")
            .map(str::to_string)
            .collect();

        let handshake_secs: i64 = fields[4].trim().parse().ok()?;
        let last_handshake = if handshake_secs == 0 {
            None
        } else {
            Some(DateTime::from_timestamp(handshake_secs, 0)?)
        };

        let rx_bytes = fields[5].trim().parse().ok()?;
        let tx_bytes = fields[6].trim().parse().ok()?;
        let persistent_keepalive = match fields[7].trim() {
            KEEPALIVE_OFF => 0,
            value => value.parse().ok()?,
        };

        Some(PeerStatus {
            public_key: public_key.to_string(),
            endpoint,
            allowed_ips,
            online: self.is_online(last_handshake, now),
            last_handshake,
            rx_bytes,
            tx_bytes,
            persistent_keepalive,
        })
    }

    /// Strict comparison: a handshake exactly `threshold` old is offline.
    /// Timestamps in the future count as age zero.
    pub fn is_online(&self, last_handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(handshake) = last_handshake else {
            return false;
        };
        let age = now.signed_duration_since(handshake).num_seconds().max(0);
        (age as u64) < self.online_threshold.as_secs()
    }
}
