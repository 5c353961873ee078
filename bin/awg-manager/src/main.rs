//! awg-manager -- command-line peer management for AmneziaWG containers.
//!
//! Every command prints JSON on stdout; logs go to stderr. Server settings
//! come from `AWG_*` environment variables.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;

use awg_observability::{init_logging, FileLoggingConfig, LogLevel, LoggingConfig};
use awg_protocol::{
    AwgConfigGenerator, ConfigGenerator, DockerChannelFactory, ProtocolRegistry, ServerSettings,
};
use cli::{Cli, Commands, LinkCommand, PeersCommand};
use tracing::{debug, info};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: LogLevel::from_verbosity(cli.verbose),
        format: cli.log_format,
        file: cli.log_dir.clone().map(|directory| FileLoggingConfig {
            directory,
            prefix: "awg-manager".to_string(),
            rotation: Default::default(),
        }),
        ..Default::default()
    };

    // Hold the guard for the lifetime of the process
    let _guard = match init_logging(&logging).context("Failed to initialize logging") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
    {
        Ok(rt) => match rt.block_on(run(cli)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Link {
            action: LinkCommand::Decode { uri },
        } => {
            let link = AwgConfigGenerator::new()
                .decode_link(&uri)
                .context("Failed to decode link")?;
            print_json(&link)
        }
        Commands::Protocols => {
            let registry = open_registry(cli.protocols).await?;
            print_json(&registry.definitions().await)
        }
        Commands::Peers { protocol, action } => {
            let registry = open_registry(cli.protocols).await?;
            run_peers(&registry, &protocol, action).await
        }
    }
}

async fn open_registry(protocols: Option<std::path::PathBuf>) -> Result<ProtocolRegistry> {
    let mut settings = ServerSettings::from_env().context("Invalid server settings")?;
    if let Some(path) = protocols {
        settings.protocol_config_path = path;
    }

    let channels =
        DockerChannelFactory::local().context("Failed to create Docker client")?;
    let source = settings.protocol_config_path.clone();
    ProtocolRegistry::load(&source, settings, Arc::new(channels))
        .await
        .with_context(|| format!("Failed to load protocols from {}", source.display()))
}

async fn run_peers(registry: &ProtocolRegistry, protocol: &str, action: PeersCommand) -> Result<()> {
    let service = registry
        .create(protocol)
        .await
        .with_context(|| format!("Failed to open protocol '{protocol}'"))?;
    debug!(
        protocol = service.name(),
        container = %service.definition().container_name,
        "Protocol opened"
    );

    match action {
        PeersCommand::List { online, offline } => {
            let peers = service
                .peers_status(PeersCommand::online_filter(online, offline))
                .await
                .context("Failed to list peers")?;
            print_json(&peers)
        }
        PeersCommand::Show { public_key } => {
            let peer = service.get_peer(&public_key).await?;
            print_json(&peer)
        }
        PeersCommand::Create { app_type, address } => {
            let peer = service
                .create_peer(&app_type, address.as_deref())
                .await
                .context("Failed to create peer")?;
            info!(
                protocol = service.name(),
                allocated_ip = %peer.allocated_ip,
                "Peer created"
            );
            print_json(&peer)
        }
        PeersCommand::Delete { public_key } => {
            let deleted = service
                .delete_peer(&public_key)
                .await
                .context("Failed to delete peer")?;
            info!(protocol = service.name(), deleted, "Peer delete finished");
            print_json(&serde_json::json!({
                "public_key": public_key,
                "deleted": deleted,
            }))
        }
        PeersCommand::Update {
            public_key,
            app_type,
        } => {
            let update = service
                .update_peer(&public_key, &app_type)
                .await
                .context("Failed to update peer")?;
            info!(
                protocol = service.name(),
                old_public_key = %update.old_public_key,
                new_public_key = %update.peer.public_key,
                "Peer updated"
            );
            print_json(&update)
        }
        PeersCommand::Traffic => {
            let summary = service
                .traffic_summary()
                .await
                .context("Failed to read traffic counters")?;
            print_json(&summary)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
