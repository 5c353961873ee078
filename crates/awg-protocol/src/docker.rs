//! Docker execution channel using bollard
//!
//! Runs commands inside the tunnel container through the Docker exec API.
//! Calls are async end to end, so they never block the tokio scheduler.

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::channel::{ChannelFactory, CommandOutput, ExecutionChannel};
use crate::error::{command_label, ProtocolError, Result};

/// Default per-command time budget
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ExecutionChannel`] bound to one Docker container
pub struct DockerChannel {
    docker: Docker,
    container: String,
    timeout: Duration,
}

impl std::fmt::Debug for DockerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerChannel")
            .field("container", &self.container)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DockerChannel {
    /// Connect to the local Docker daemon using platform defaults
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TargetUnreachable`] if the daemon cannot be
    /// reached.
    pub async fn connect(container: &str, timeout: Duration) -> Result<Self> {
        let docker = connect_local(container)?;
        docker
            .ping()
            .await
            .map_err(|e| unreachable(container, format!("Docker ping failed: {e}")))?;
        tracing::info!(container = %container, "Connected to Docker daemon");
        Ok(Self::with_client(docker, container, timeout))
    }

    /// Build a channel from a pre-configured bollard client
    pub fn with_client(docker: Docker, container: &str, timeout: Duration) -> Self {
        Self {
            docker,
            container: container.to_string(),
            timeout,
        }
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec_created = self
            .docker
            .create_exec(&self.container, exec_options)
            .await
            .map_err(|e| unreachable(&self.container, format!("failed to create exec: {e}")))?;

        let start_result = self
            .docker
            .start_exec(&exec_created.id, None)
            .await
            .map_err(|e| exec_error(command, format!("failed to start exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(result) = output.next().await {
                    match result {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(exec_error(command, format!("error reading exec output: {e}")));
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(exec_error(command, "exec started detached".to_string()));
            }
        }

        let exec_inspect = self
            .docker
            .inspect_exec(&exec_created.id)
            .await
            .map_err(|e| exec_error(command, format!("failed to inspect exec: {e}")))?;

        Ok(CommandOutput {
            exit_code: exec_inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl ExecutionChannel for DockerChannel {
    fn target(&self) -> &str {
        &self.container
    }

    #[instrument(
        skip(self, command),
        fields(
            otel.name = "container.exec",
            container = %self.container,
            cmd = %command_label(command),
        )
    )]
    async fn run(&self, command: &str, check: bool) -> Result<CommandOutput> {
        let output = tokio::time::timeout(self.timeout, self.exec(command))
            .await
            .map_err(|_| ProtocolError::Timeout {
                command: command_label(command),
                secs: self.timeout.as_secs(),
            })??;

        tracing::debug!(
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "exec completed"
        );

        output.checked(command, check)
    }
}

/// Hands out [`DockerChannel`]s sharing one Docker client
#[derive(Clone)]
pub struct DockerChannelFactory {
    docker: Docker,
}

impl std::fmt::Debug for DockerChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerChannelFactory").finish_non_exhaustive()
    }
}

impl DockerChannelFactory {
    /// Factory over the local daemon. The daemon is pinged once per channel.
    pub fn local() -> Result<Self> {
        Ok(Self::with_client(connect_local("docker")?))
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ChannelFactory for DockerChannelFactory {
    async fn connect(&self, target: &str, timeout: Duration) -> Result<Arc<dyn ExecutionChannel>> {
        self.docker
            .ping()
            .await
            .map_err(|e| unreachable(target, format!("Docker ping failed: {e}")))?;
        Ok(Arc::new(DockerChannel::with_client(
            self.docker.clone(),
            target,
            timeout,
        )))
    }
}

/// Local Docker client without pinging, for factories that connect lazily
pub fn connect_local(container: &str) -> Result<Docker> {
    Docker::connect_with_local_defaults()
        .map_err(|e| unreachable(container, format!("Failed to connect to Docker: {e}")))
}

fn unreachable(container: &str, reason: String) -> ProtocolError {
    ProtocolError::TargetUnreachable {
        target: container.to_string(),
        reason,
    }
}

fn exec_error(command: &str, reason: String) -> ProtocolError {
    ProtocolError::Execution {
        command: command_label(command),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debug_hides_client() {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        let channel = DockerChannel::with_client(docker, "amnezia-awg2", DEFAULT_COMMAND_TIMEOUT);
        let debug = format!("{channel:?}");
        assert!(debug.contains("amnezia-awg2"));
        assert_eq!(channel.target(), "amnezia-awg2");
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            unreachable("amnezia-awg2", "no such container".into()),
            ProtocolError::TargetUnreachable { .. }
        ));
        let err = exec_error("wg show awg0 dump", "failed to inspect exec".into());
        assert_eq!(
            err.to_string(),
            "Command `wg show` failed: failed to inspect exec"
        );
    }
}
