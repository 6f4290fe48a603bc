//! Stdio transport
//!
//! Spawns the server as a child process and exchanges newline-delimited
//! JSON-RPC over its stdin/stdout. Each pooled connection owns its own
//! process.

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::Result;
use crate::error::MeshError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace};

/// Child-process transport
pub struct StdioTransport {
    server_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl StdioTransport {
    /// Spawn the server process
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        debug!(server_id = %server_id, "Starting server process: {} {:?}", command, args);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            MeshError::transport(server_id, format!("Failed to spawn '{command}': {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MeshError::transport(server_id, "Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MeshError::transport(server_id, "Failed to get stdout"))?;

        Ok(Self {
            server_id: server_id.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        })
    }

    async fn write_message(&mut self, message: &JsonRpcRequest) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MeshError::transport(&self.server_id, e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| MeshError::transport(&self.server_id, e))
    }

    /// Read lines until the response for `id` arrives
    ///
    /// Server notifications, log noise and responses to other ids are
    /// skipped.
    async fn read_response(&mut self, id: u64) -> Result<JsonRpcResponse> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| MeshError::transport(&self.server_id, e))?;

            if read == 0 {
                return Err(MeshError::transport(
                    &self.server_id,
                    "Server closed connection",
                ));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
                trace!(server_id = %self.server_id, "Skipping non-JSON-RPC line");
                continue;
            };

            match response.numeric_id() {
                Some(got) if got == id => return Ok(response),
                Some(got) => {
                    debug!(server_id = %self.server_id, expected = id, got, "Skipping response with mismatched id");
                }
                None => trace!(server_id = %self.server_id, "Skipping server notification"),
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;

        trace!(server_id = %self.server_id, id, "Sending request: {}", method);
        self.write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        let response = self.read_response(id).await?;
        response.into_result(&self.server_id)
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn close(&mut self) -> Result<()> {
        debug!(server_id = %self.server_id, "Stopping server process");
        // Closing stdin first lets well-behaved servers exit on their own.
        let _ = self.stdin.shutdown().await;
        if self.child.try_wait()?.is_none() {
            let _ = self.child.kill().await;
        }
        Ok(())
    }
}
