use awg_observability::LogFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Peer management for AmneziaWG containers
#[derive(Parser)]
#[command(name = "awg-manager")]
#[command(version, about = "Peer management for AmneziaWG containers")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Protocol declaration file
    #[arg(long, env = "AWG_PROTOCOL_CONFIG_PATH", global = true)]
    pub(crate) protocols: Option<PathBuf>,

    /// Log output format (pretty, json, compact)
    #[arg(long, default_value = "compact", global = true)]
    pub(crate) log_format: LogFormat,

    /// Also write JSON logs to daily rotated files in this directory
    #[arg(long, env = "AWG_LOG_DIR", global = true)]
    pub(crate) log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List declared protocols
    Protocols,

    /// Manage peers of a protocol
    Peers {
        /// Protocol name (case-insensitive)
        #[arg(short, long, default_value = "amneziawg2")]
        protocol: String,

        #[command(subcommand)]
        action: PeersCommand,
    },

    /// Inspect vpn:// links
    Link {
        #[command(subcommand)]
        action: LinkCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum PeersCommand {
    /// List peers with live status
    List {
        /// Only peers with a recent handshake
        #[arg(long)]
        online: bool,

        /// Only peers without a recent handshake
        #[arg(long, conflicts_with = "online")]
        offline: bool,
    },

    /// Show one peer
    Show {
        /// Peer public key
        public_key: String,
    },

    /// Create a peer and print its client configuration
    Create {
        /// Client application: amnezia_wg (plaintext) or amnezia_vpn (vpn:// link)
        #[arg(long, default_value = "amnezia_wg")]
        app_type: String,

        /// Address to assign (e.g. 10.8.1.7 or 10.8.1.7/32); lowest free one if omitted
        #[arg(long)]
        address: Option<String>,
    },

    /// Delete a peer
    Delete {
        /// Peer public key
        public_key: String,
    },

    /// Re-key a peer for another client application, keeping its address
    Update {
        /// Peer public key
        public_key: String,

        /// New client application
        #[arg(long)]
        app_type: String,
    },

    /// Aggregate traffic counters
    Traffic,
}

#[derive(Subcommand)]
pub(crate) enum LinkCommand {
    /// Decode a vpn:// link into its JSON document
    Decode {
        /// The link, with or without the vpn:// prefix
        uri: String,
    },
}

impl PeersCommand {
    /// Online filter of `peers list`
    pub(crate) fn online_filter(online: bool, offline: bool) -> Option<bool> {
        match (online, offline) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}
