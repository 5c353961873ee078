//! In-memory doubles for tests
//!
//! [`ScriptedChannel`] answers commands from a script and records what it
//! was asked to run. [`MemoryBackend`] simulates a whole tunnel daemon: a
//! config file, the running interface (updated only on sync) and key files.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::backend::TunnelBackend;
use crate::channel::{ChannelFactory, CommandOutput, ExecutionChannel};
use crate::conf;
use crate::error::{command_label, ProtocolError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Timeout,
    Unreachable,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

/// [`ExecutionChannel`] answering from a script
///
/// Rules match when the command contains their pattern; the first match
/// wins. Unmatched commands succeed with empty output.
#[derive(Debug)]
pub struct ScriptedChannel {
    target: String,
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Succeed with `stdout`
    pub fn respond(self, pattern: &str, stdout: &str) -> Self {
        self.rule(
            pattern,
            Reply::Output(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
            None,
        )
    }

    /// Exit with `exit_code` and `stderr`
    pub fn fail(self, pattern: &str, exit_code: i64, stderr: &str) -> Self {
        self.rule(
            pattern,
            Reply::Output(CommandOutput {
                exit_code,
                stderr: stderr.to_string(),
                ..Default::default()
            }),
            None,
        )
    }

    /// Time out the next `times` matching commands
    pub fn timeout(self, pattern: &str, times: usize) -> Self {
        self.rule(pattern, Reply::Timeout, Some(times))
    }

    /// Report the target as unreachable
    pub fn unreachable(self, pattern: &str) -> Self {
        self.rule(pattern, Reply::Unreachable, None)
    }

    fn rule(self, pattern: &str, reply: Reply, remaining: Option<usize>) -> Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
        self
    }

    /// Every command run so far, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    fn reply_for(&self, command: &str) -> Reply {
        let mut rules = lock(&self.rules);
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) || !command.contains(&rule.pattern) {
                continue;
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return rule.reply.clone();
        }
        Reply::Output(CommandOutput::default())
    }
}

#[async_trait]
impl ExecutionChannel for ScriptedChannel {
    fn target(&self) -> &str {
        &self.target
    }

    async fn run(&self, command: &str, check: bool) -> Result<CommandOutput> {
        lock(&self.commands).push(command.to_string());
        match self.reply_for(command) {
            Reply::Output(output) => output.checked(command, check),
            Reply::Timeout => Err(ProtocolError::Timeout {
                command: command_label(command),
                secs: 0,
            }),
            Reply::Unreachable => Err(ProtocolError::TargetUnreachable {
                target: self.target.clone(),
                reason: "scripted".to_string(),
            }),
        }
    }
}

/// [`ChannelFactory`] handing out empty [`ScriptedChannel`]s
#[derive(Debug, Default)]
pub struct ScriptedChannelFactory {
    targets: Mutex<Vec<String>>,
}

impl ScriptedChannelFactory {
    pub fn connects(&self) -> usize {
        lock(&self.targets).len()
    }

    pub fn targets(&self) -> Vec<String> {
        lock(&self.targets).clone()
    }
}

#[async_trait]
impl ChannelFactory for ScriptedChannelFactory {
    async fn connect(&self, target: &str, _timeout: Duration) -> Result<Arc<dyn ExecutionChannel>> {
        lock(&self.targets).push(target.to_string());
        Ok(Arc::new(ScriptedChannel::new(target)))
    }
}

/// Live counters of one simulated peer
#[derive(Debug, Clone, Default)]
struct LivePeer {
    endpoint: Option<String>,
    last_handshake: i64,
    rx_bytes: u64,
    tx_bytes: u64,
}

#[derive(Debug)]
struct MemoryState {
    config: String,
    /// Config the running interface was last synced from
    live_config: String,
    server_private_key: String,
    server_public_key: String,
    preshared_key: String,
    live: HashMap<String, LivePeer>,
    read_timeouts: usize,
    fail_next_sync: bool,
    writes: usize,
    syncs: usize,
}

/// [`TunnelBackend`] simulating the daemon in memory
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Daemon whose interface already runs `config`
    pub fn new(config: &str) -> Self {
        Self::with_live_config(config, config)
    }

    /// Daemon whose file and running interface differ
    pub fn with_live_config(config: &str, live_config: &str) -> Self {
        let (server_private_key, server_public_key) = generate_keypair();
        Self {
            state: Mutex::new(MemoryState {
                config: config.to_string(),
                live_config: live_config.to_string(),
                server_private_key,
                server_public_key,
                preshared_key: STANDARD.encode(rand::random::<[u8; 32]>()),
                live: HashMap::new(),
                read_timeouts: 0,
                fail_next_sync: false,
                writes: 0,
                syncs: 0,
            }),
        }
    }

    pub fn config(&self) -> String {
        lock(&self.state).config.clone()
    }

    pub fn server_public(&self) -> String {
        lock(&self.state).server_public_key.clone()
    }

    pub fn preshared(&self) -> String {
        lock(&self.state).preshared_key.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn sync_count(&self) -> usize {
        lock(&self.state).syncs
    }

    /// Record a handshake (unix seconds) and traffic for a peer
    pub fn set_handshake(&self, public_key: &str, unix_secs: i64, rx_bytes: u64, tx_bytes: u64) {
        lock(&self.state).live.insert(
            public_key.to_string(),
            LivePeer {
                endpoint: Some("198.51.100.4:51234".to_string()),
                last_handshake: unix_secs,
                rx_bytes,
                tx_bytes,
            },
        );
    }

    /// Time out the next `count` read-only calls
    pub fn inject_read_timeouts(&self, count: usize) {
        lock(&self.state).read_timeouts = count;
    }

    pub fn fail_next_sync(&self) {
        lock(&self.state).fail_next_sync = true;
    }

    fn read<T>(&self, step: &str, f: impl FnOnce(&MemoryState) -> T) -> Result<T> {
        let mut state = lock(&self.state);
        if state.read_timeouts > 0 {
            state.read_timeouts -= 1;
            return Err(ProtocolError::Timeout {
                command: step.to_string(),
                secs: 0,
            });
        }
        Ok(f(&state))
    }

    fn render_dump(state: &MemoryState) -> String {
        let port = conf::listen_port(&state.live_config).unwrap_or(0);
        let mut dump = format!(
            "{}\t{}\t{}\toff\n",
            state.server_private_key, state.server_public_key, port
        );
        for section in conf::peer_sections(&state.live_config) {
            let Some(key) = section.public_key else {
                continue;
            };
            let live = state.live.get(&key).cloned().unwrap_or_default();
            let allowed_ips = if section.allowed_ips.is_empty() {
                "(none)".to_string()
            } else {
                section.allowed_ips.join(",")
            };
            dump.push_str(&format!(
                "{key}\t{}\t{}\t{allowed_ips}\t{}\t{}\t{}\toff\n",
                state.preshared_key,
                live.endpoint.as_deref().unwrap_or("(none)"),
                live.last_handshake,
                live.rx_bytes,
                live.tx_bytes,
            ));
        }
        dump
    }
}

#[async_trait]
impl TunnelBackend for MemoryBackend {
    async fn peers_dump(&self) -> Result<String> {
        tokio::task::yield_now().await;
        self.read("wg show", Self::render_dump)
    }

    async fn read_config(&self) -> Result<String> {
        tokio::task::yield_now().await;
        self.read("cat", |state| state.config.clone())
    }

    async fn write_config(&self, content: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = lock(&self.state);
        state.config = content.to_string();
        state.writes += 1;
        Ok(())
    }

    async fn sync_config(&self) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_sync) {
            return Err(ProtocolError::Execution {
                command: "wg syncconf".to_string(),
                reason: "exit code 1: Unable to modify interface".to_string(),
            });
        }
        state.live_config = state.config.clone();
        state.syncs += 1;
        Ok(())
    }

    async fn generate_private_key(&self) -> Result<String> {
        tokio::task::yield_now().await;
        Ok(generate_keypair().0)
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String> {
        tokio::task::yield_now().await;
        let bytes: [u8; 32] = STANDARD
            .decode(private_key.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| ProtocolError::Execution {
                command: "wg pubkey".to_string(),
                reason: "invalid private key".to_string(),
            })?;
        let public = PublicKey::from(&StaticSecret::from(bytes));
        Ok(STANDARD.encode(public.as_bytes()))
    }

    async fn server_public_key(&self) -> Result<String> {
        tokio::task::yield_now().await;
        self.read("cat", |state| state.server_public_key.clone())
    }

    async fn preshared_key(&self) -> Result<String> {
        tokio::task::yield_now().await;
        self.read("cat", |state| state.preshared_key.clone())
    }
}

fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (
        STANDARD.encode(secret.to_bytes()),
        STANDARD.encode(public.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_timeout_is_consumed() {
        let channel = ScriptedChannel::new("awg").timeout("dump", 1).respond("dump", "ok");
        assert!(matches!(
            channel.run("wg show awg0 dump", true).await,
            Err(ProtocolError::Timeout { .. })
        ));
        assert_eq!(channel.run("wg show awg0 dump", true).await.unwrap().stdout, "ok");
    }

    #[tokio::test]
    async fn test_memory_dump_follows_sync() {
        let backend = MemoryBackend::new("[Interface]\nListenPort = 51820\n");
        backend
            .write_config("[Interface]\nListenPort = 51820\n\n[Peer]\nPublicKey = a2V5\nAllowedIPs = 10.8.1.2/32\n")
            .await
            .unwrap();
        assert_eq!(backend.peers_dump().await.unwrap().lines().count(), 1);

        backend.sync_config().await.unwrap();
        let dump = backend.peers_dump().await.unwrap();
        let row: Vec<&str> = dump.lines().nth(1).unwrap().split('\t').collect();
        assert_eq!(row[0], "a2V5");
        assert_eq!(row[2], "(none)");
        assert_eq!(row[3], "10.8.1.2/32");
        assert_eq!(row[4], "0");
    }

    #[tokio::test]
    async fn test_memory_keys_are_consistent() {
        let backend = MemoryBackend::new("");
        let private = backend.generate_private_key().await.unwrap();
        let public = backend.derive_public_key(&private).await.unwrap();
        assert_eq!(STANDARD.decode(&public).unwrap().len(), 32);
        assert_eq!(backend.derive_public_key(&private).await.unwrap(), public);
        assert!(backend.derive_public_key("short").await.is_err());
    }
}
