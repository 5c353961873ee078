//! Protocol declarations and service registry
//!
//! Protocols are declared in a YAML file:
//!
//! ```yaml
//! protocols:
//!   AmneziaWG2:
//!     implementation: amneziawg2
//!     container_name: amnezia-awg2
//!     awg_junk_params: { Jc: 4, Jmin: 50, Jmax: 1000 }
//! ```
//!
//! Names are case-insensitive. Each declaration names an implementation from
//! [`IMPLEMENTATIONS`], which wires a backend and a config generator over an
//! execution channel to the protocol's container.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::backend::{AwgBackend, AwgBackendConfig, TunnelBackend};
use crate::channel::{ChannelFactory, ExecutionChannel};
use crate::error::{ProtocolError, Result};
use crate::generator::{AwgConfigGenerator, ConfigGenerator};
use crate::params::ObfuscationParams;
use crate::service::ProtocolService;
use crate::settings::ServerSettings;

/// Name of the built-in protocol used when no declaration file exists
pub const BUILTIN_PROTOCOL: &str = "amneziawg2";

/// Declaration of one protocol instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    /// Lowercased protocol name, filled from the map key
    #[serde(default)]
    pub name: String,

    /// Key into [`IMPLEMENTATIONS`]
    #[serde(default = "default_implementation")]
    pub implementation: String,

    /// Container hosting the tunnel daemon; defaults to the protocol name
    #[serde(default)]
    pub container_name: String,

    #[serde(default = "default_interface")]
    pub interface: String,

    /// Directory holding the interface config and key files
    #[serde(default = "default_config_path")]
    pub config_path: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Fallback obfuscation parameters for names missing from the config file
    #[serde(default = "ObfuscationParams::builtin_defaults")]
    pub awg_junk_params: ObfuscationParams,

    #[serde(default = "default_primary_dns")]
    pub primary_dns: String,

    #[serde(default = "default_secondary_dns")]
    pub secondary_dns: String,

    /// Subnet announced in links when the config has no `Address`
    #[serde(default = "default_subnet_address")]
    pub default_subnet_address: String,

    #[serde(default = "default_wg_command")]
    pub wg_command: String,

    #[serde(default = "default_wg_quick_command")]
    pub wg_quick_command: String,
}

fn default_implementation() -> String {
    BUILTIN_PROTOCOL.to_string()
}

fn default_interface() -> String {
    "awg0".to_string()
}

fn default_config_path() -> String {
    "/opt/amnezia/awg".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_primary_dns() -> String {
    "1.1.1.1".to_string()
}

fn default_secondary_dns() -> String {
    "1.0.0.1".to_string()
}

fn default_subnet_address() -> String {
    "10.8.1.0".to_string()
}

fn default_wg_command() -> String {
    "wg".to_string()
}

fn default_wg_quick_command() -> String {
    "wg-quick".to_string()
}

impl ProtocolDefinition {
    /// The fallback `amneziawg2` declaration
    pub fn builtin() -> Self {
        Self {
            name: BUILTIN_PROTOCOL.to_string(),
            implementation: default_implementation(),
            container_name: "amnezia-awg2".to_string(),
            interface: default_interface(),
            config_path: default_config_path(),
            enabled: true,
            awg_junk_params: ObfuscationParams::builtin_defaults(),
            primary_dns: default_primary_dns(),
            secondary_dns: default_secondary_dns(),
            default_subnet_address: default_subnet_address(),
            wg_command: default_wg_command(),
            wg_quick_command: default_wg_quick_command(),
        }
    }

    pub fn backend_config(&self) -> AwgBackendConfig {
        AwgBackendConfig {
            interface: self.interface.clone(),
            config_path: self.config_path.clone(),
            wg_command: self.wg_command.clone(),
            wg_quick_command: self.wg_quick_command.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProtocolsFile {
    #[serde(default)]
    protocols: BTreeMap<String, ProtocolDefinition>,
}

/// Backend and generator pair an implementation wires for a protocol
pub type Components = (Arc<dyn TunnelBackend>, Arc<dyn ConfigGenerator>);

/// A protocol implementation selectable from a declaration
pub struct Implementation {
    pub name: &'static str,
    pub build: fn(&ProtocolDefinition, Arc<dyn ExecutionChannel>) -> Components,
}

/// Known implementations
pub const IMPLEMENTATIONS: &[Implementation] = &[Implementation {
    name: BUILTIN_PROTOCOL,
    build: build_amneziawg2,
}];

fn build_amneziawg2(
    definition: &ProtocolDefinition,
    channel: Arc<dyn ExecutionChannel>,
) -> Components {
    (
        Arc::new(AwgBackend::new(channel, definition.backend_config())),
        Arc::new(AwgConfigGenerator::new()),
    )
}

/// Look up an implementation by name, case-insensitively
pub fn resolve_implementation(reference: &str) -> Option<&'static Implementation> {
    let reference = reference.trim();
    IMPLEMENTATIONS
        .iter()
        .find(|implementation| implementation.name.eq_ignore_ascii_case(reference))
}

/// Parse a declaration document into definitions keyed by lowercased name
pub fn parse_definitions(yaml: &str) -> Result<BTreeMap<String, ProtocolDefinition>> {
    let file: ProtocolsFile = if yaml.trim().is_empty() {
        ProtocolsFile::default()
    } else {
        serde_yaml::from_str(yaml)
            .map_err(|e| ProtocolError::Config(format!("invalid protocol declarations: {e}")))?
    };
    normalize(file.protocols)
}

fn normalize(
    entries: BTreeMap<String, ProtocolDefinition>,
) -> Result<BTreeMap<String, ProtocolDefinition>> {
    let mut definitions = BTreeMap::new();
    for (name, mut definition) in entries {
        let key = normalize_name(&name);
        if key.is_empty() {
            return Err(ProtocolError::Config("protocol name must not be empty".into()));
        }
        definition.name = key.clone();
        if definition.container_name.trim().is_empty() {
            definition.container_name = key.clone();
        }
        if definitions.insert(key.clone(), definition).is_some() {
            return Err(ProtocolError::Config(format!(
                "protocol '{key}' declared more than once"
            )));
        }
    }
    Ok(definitions)
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn builtin_definitions() -> BTreeMap<String, ProtocolDefinition> {
    let builtin = ProtocolDefinition::builtin();
    BTreeMap::from([(builtin.name.clone(), builtin)])
}

/// Read declarations from `path`, falling back to the built-in protocol if
/// the file does not exist
pub async fn load_definitions(path: &Path) -> Result<BTreeMap<String, ProtocolDefinition>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let definitions = parse_definitions(&content)?;
            info!(
                path = %path.display(),
                count = definitions.len(),
                "Loaded protocol declarations"
            );
            Ok(definitions)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                "Protocol declaration file not found, using built-in {BUILTIN_PROTOCOL}"
            );
            Ok(builtin_definitions())
        }
        Err(e) => Err(ProtocolError::Config(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Protocol definitions plus the services built from them
pub struct ProtocolRegistry {
    source: Option<PathBuf>,
    settings: ServerSettings,
    channels: Arc<dyn ChannelFactory>,
    definitions: RwLock<BTreeMap<String, ProtocolDefinition>>,
    services: Mutex<HashMap<String, Arc<ProtocolService>>>,
    /// Config-file locks by protocol name; never dropped on reload
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl ProtocolRegistry {
    /// Registry backed by a declaration file
    pub async fn load(
        source: impl Into<PathBuf>,
        settings: ServerSettings,
        channels: Arc<dyn ChannelFactory>,
    ) -> Result<Self> {
        let source = source.into();
        let definitions = load_definitions(&source).await?;
        Ok(Self::build(Some(source), definitions, settings, channels))
    }

    /// Registry over fixed definitions; [`ProtocolRegistry::reload`] restores
    /// the built-in protocol
    pub fn from_definitions(
        definitions: Vec<ProtocolDefinition>,
        settings: ServerSettings,
        channels: Arc<dyn ChannelFactory>,
    ) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for definition in definitions {
            let name = definition.name.clone();
            if by_name.insert(name.clone(), definition).is_some() {
                return Err(ProtocolError::Config(format!(
                    "protocol '{name}' declared more than once"
                )));
            }
        }
        Ok(Self::build(None, normalize(by_name)?, settings, channels))
    }

    fn build(
        source: Option<PathBuf>,
        definitions: BTreeMap<String, ProtocolDefinition>,
        settings: ServerSettings,
        channels: Arc<dyn ChannelFactory>,
    ) -> Self {
        Self {
            source,
            settings,
            channels,
            definitions: RwLock::new(definitions),
            services: Mutex::new(HashMap::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Re-read declarations and drop every cached service
    #[instrument(skip(self), fields(otel.name = "registry.reload"))]
    pub async fn reload(&self) -> Result<()> {
        let definitions = match &self.source {
            Some(path) => load_definitions(path).await?,
            None => builtin_definitions(),
        };

        let mut services = self.services.lock().await;
        *self.definitions.write().await = definitions;
        services.clear();
        info!("Protocol registry reloaded");
        Ok(())
    }

    /// Declaration of `name`, enabled or not
    pub async fn get(&self, name: &str) -> Result<ProtocolDefinition> {
        let key = normalize_name(name);
        let definitions = self.definitions.read().await;
        definitions
            .get(&key)
            .cloned()
            .ok_or_else(|| unsupported(name, &definitions))
    }

    /// All declarations in name order
    pub async fn definitions(&self) -> Vec<ProtocolDefinition> {
        self.definitions.read().await.values().cloned().collect()
    }

    /// Names of enabled protocols, sorted
    pub async fn list_available(&self) -> Vec<String> {
        available_names(&*self.definitions.read().await)
    }

    /// Service for `name`, built on first use and cached until reload
    #[instrument(skip(self), fields(otel.name = "registry.create"))]
    pub async fn create(&self, name: &str) -> Result<Arc<ProtocolService>> {
        let key = normalize_name(name);
        let mut services = self.services.lock().await;
        if let Some(service) = services.get(&key) {
            return Ok(Arc::clone(service));
        }

        let definition = {
            let definitions = self.definitions.read().await;
            definitions
                .get(&key)
                .cloned()
                .ok_or_else(|| unsupported(name, &definitions))?
        };
        if !definition.enabled {
            return Err(ProtocolError::ProtocolDisabled(definition.name));
        }

        let implementation = resolve_implementation(&definition.implementation).ok_or_else(|| {
            ProtocolError::Loading(format!(
                "unknown implementation '{}' for protocol '{}'",
                definition.implementation, definition.name
            ))
        })?;

        let channel = self
            .channels
            .connect(&definition.container_name, self.settings.command_timeout())
            .await?;
        let (backend, generator) = (implementation.build)(&definition, channel);

        let service = Arc::new(
            ProtocolService::new(definition, backend, generator, self.settings.clone())
                .with_lock(self.lock_for(&key)),
        );
        services.insert(key, Arc::clone(&service));
        debug!(protocol = %service.name(), "Created protocol service");
        Ok(service)
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

fn available_names(definitions: &BTreeMap<String, ProtocolDefinition>) -> Vec<String> {
    definitions
        .values()
        .filter(|definition| definition.enabled)
        .map(|definition| definition.name.clone())
        .collect()
}

fn unsupported(name: &str, definitions: &BTreeMap<String, ProtocolDefinition>) -> ProtocolError {
    ProtocolError::UnsupportedProtocol {
        name: name.to_string(),
        available: available_names(definitions).join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ObfuscationParam, ParamValue};
    use crate::testing::ScriptedChannelFactory;

    const DECLARATIONS: &str = r#"
protocols:
  AmneziaWG2:
    implementation: amneziawg2
    container_name: amnezia-awg2
    awg_junk_params: { Jc: 4, Jmin: 50, Jmax: 1000, S1: 0, S2: 0, H1: 1, H2: 2, H3: 3, H4: 4 }
  Legacy:
    enabled: false
"#;

    fn registry(definitions: Vec<ProtocolDefinition>) -> (ProtocolRegistry, Arc<ScriptedChannelFactory>) {
        let factory = Arc::new(ScriptedChannelFactory::default());
        let registry =
            ProtocolRegistry::from_definitions(definitions, ServerSettings::default(), factory.clone())
                .unwrap();
        (registry, factory)
    }

    #[test]
    fn test_parse_lowercases_and_fills_defaults() {
        let definitions = parse_definitions(DECLARATIONS).unwrap();
        let names: Vec<&str> = definitions.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["amneziawg2", "legacy"]);

        let awg = &definitions["amneziawg2"];
        assert_eq!(awg.name, "amneziawg2");
        assert_eq!(awg.interface, "awg0");
        assert_eq!(awg.primary_dns, "1.1.1.1");
        assert_eq!(awg.awg_junk_params.len(), 9);
        assert_eq!(
            awg.awg_junk_params.get(ObfuscationParam::Jmax),
            Some(&ParamValue::Int(1000))
        );

        let legacy = &definitions["legacy"];
        assert!(!legacy.enabled);
        assert_eq!(legacy.container_name, "legacy");
        assert_eq!(legacy.awg_junk_params, ObfuscationParams::builtin_defaults());
    }

    #[test]
    fn test_parse_rejects_case_duplicates() {
        let yaml = "protocols:\n  Awg: {}\n  AWG: {}\n";
        assert!(matches!(parse_definitions(yaml), Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_parse_failure_is_config_error() {
        assert!(matches!(
            parse_definitions("protocols: [unterminated"),
            Err(ProtocolError::Config(_))
        ));
        assert!(parse_definitions("").unwrap().is_empty());
    }

    #[test]
    fn test_resolve_implementation() {
        assert!(resolve_implementation("AmneziaWG2").is_some());
        assert!(resolve_implementation("openvpn").is_none());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let definitions = load_definitions(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[BUILTIN_PROTOCOL], ProtocolDefinition::builtin());
    }

    #[tokio::test]
    async fn test_create_errors() {
        let mut disabled = ProtocolDefinition::builtin();
        disabled.name = "legacy".into();
        disabled.enabled = false;
        let mut broken = ProtocolDefinition::builtin();
        broken.name = "broken".into();
        broken.implementation = "openvpn".into();
        let (registry, factory) =
            registry(vec![ProtocolDefinition::builtin(), disabled, broken]);

        match registry.create("missing").await.unwrap_err() {
            ProtocolError::UnsupportedProtocol { name, available } => {
                assert_eq!(name, "missing");
                assert_eq!(available, "amneziawg2, broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            registry.create("Legacy").await,
            Err(ProtocolError::ProtocolDisabled(_))
        ));
        assert!(matches!(
            registry.create("broken").await,
            Err(ProtocolError::Loading(_))
        ));
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_services_cached_until_reload() {
        let (registry, factory) = registry(vec![ProtocolDefinition::builtin()]);

        let first = registry.create("AmneziaWG2").await.unwrap();
        let second = registry.create("amneziawg2").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.connects(), 1);
        assert_eq!(factory.targets(), vec!["amnezia-awg2".to_string()]);

        registry.reload().await.unwrap();
        let third = registry.create("amneziawg2").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(factory.connects(), 2);
    }

    #[tokio::test]
    async fn test_list_available_and_get() {
        let mut disabled = ProtocolDefinition::builtin();
        disabled.name = "legacy".into();
        disabled.enabled = false;
        let (registry, _) = registry(vec![disabled, ProtocolDefinition::builtin()]);

        assert_eq!(registry.list_available().await, vec!["amneziawg2"]);
        assert!(!registry.get("LEGACY").await.unwrap().enabled);
        assert_eq!(registry.definitions().await.len(), 2);
    }
}
