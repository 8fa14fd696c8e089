//! Subprocess transport.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::Transport;
use crate::error::TransportError;

/// Standard I/O transport for MCP servers.
///
/// Spawns the server with the descriptor's env overlaid on ours. The child's
/// stderr is inherited so its diagnostics land in our log stream, never on
/// our stdout.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Bytes of a line not yet terminated. Kept across calls so a cancelled
    /// `receive` does not drop half a frame.
    pending: Vec<u8>,
    connected: bool,
}

impl StdioTransport {
    /// Spawn a new stdio transport.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        debug!(command = command, args = ?args, "Spawning MCP server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Own process group, so close() reaches anything the server forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdin"))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdout"))
        })?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
            connected: true,
        })
    }

    /// Get the process ID of the child process.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\n');

        self.stdin
            .write_all(&frame)
            .await
            .map_err(TransportError::WriteError)?;
        self.stdin.flush().await.map_err(TransportError::WriteError)?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        loop {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }

            let read = self
                .stdout
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(TransportError::ReadError)?;

            if read == 0 {
                self.connected = false;
                return Err(TransportError::ConnectionClosed);
            }

            if self.pending.last() != Some(&b'\n') {
                continue;
            }

            let line = std::mem::take(&mut self.pending);
            let message = String::from_utf8_lossy(&line).trim().to_string();
            if message.is_empty() {
                continue;
            }
            return Ok(message);
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        if let Some(pid) = self.child.id() {
            debug!(pid = pid, "Stopping MCP server process");

            #[cfg(unix)]
            {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                let group = Pid::from_raw(pid as i32);
                let _ = killpg(group, Signal::SIGTERM);

                tokio::select! {
                    _ = self.child.wait() => {
                        debug!("MCP server exited gracefully");
                    }
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(2)) => {
                        warn!("MCP server did not exit gracefully, killing");
                        let _ = killpg(group, Signal::SIGKILL);
                        self.child.kill().await.map_err(TransportError::TerminateFailed)?;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                self.child.kill().await.map_err(TransportError::TerminateFailed)?;
            }
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
