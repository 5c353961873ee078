//! Execution channel abstraction
//!
//! An [`ExecutionChannel`] runs shell commands against one fixed execution
//! target (usually the container hosting the tunnel daemon) and moves files
//! in and out of it. Channels do not serialize calls; callers that mutate a
//! shared file hold the protocol lock for the whole sequence.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into an error when `check` is set
    pub fn checked(self, command: &str, check: bool) -> Result<Self> {
        if check && !self.success() {
            return Err(ProtocolError::command_failed(command, &self));
        }
        Ok(self)
    }
}

/// Runs commands and file operations on one execution target
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Identity of the execution target (container name)
    fn target(&self) -> &str;

    /// Run `command` through `sh -c`.
    ///
    /// With `check` set a non-zero exit status is an
    /// [`ProtocolError::Execution`] error.
    async fn run(&self, command: &str, check: bool) -> Result<CommandOutput>;

    /// Full file content, unmodified
    async fn read_file(&self, path: &str) -> Result<String> {
        let output = self.run(&read_file_command(path), true).await?;
        Ok(output.stdout)
    }

    /// Replace a file's content; readers see the old or the new file, never
    /// a partial one
    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        for command in write_file_commands(path, content) {
            self.run(&command, true).await?;
        }
        Ok(())
    }
}

/// Opens channels to named execution targets
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(&self, target: &str, timeout: Duration) -> Result<Arc<dyn ExecutionChannel>>;
}

/// Single-quote a string for `sh`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn read_file_command(path: &str) -> String {
    format!("cat {}", shell_quote(path))
}

/// Raw bytes per write command; 64 KiB once base64 encoded, well under
/// the kernel's 128 KiB limit on a single argv string
pub const WRITE_CHUNK_BYTES: usize = 48 * 1024;

/// Commands that atomically replace `path` with `content`.
///
/// The content travels base64 encoded, so no quoting-sensitive character
/// ever reaches the shell. It is decoded chunk by chunk into a sibling temp
/// file; the last command renames that file over the destination.
pub fn write_file_commands(path: &str, content: &str) -> Vec<String> {
    let tmp = shell_quote(&format!("{path}.awg-tmp"));
    let bytes = content.as_bytes();
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![bytes]
    } else {
        bytes.chunks(WRITE_CHUNK_BYTES).collect()
    };
    let last = chunks.len() - 1;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let redirect = if i == 0 { ">" } else { ">>" };
            let mut command = format!(
                "printf '%s' {} | base64 -d {redirect} {tmp}",
                shell_quote(&STANDARD.encode(chunk))
            );
            if i == last {
                command.push_str(&format!(" && mv -f {tmp} {}", shell_quote(path)));
            }
            command
        })
        .collect()
}
