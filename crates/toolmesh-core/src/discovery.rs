//! Server discovery
//!
//! A [`DiscoverySource`] lists the servers that should currently exist.
//! The client polls it periodically and reconciles the registry with the
//! answer; servers absent for several consecutive sweeps are removed.

use crate::Result;
use crate::config::{MeshConfig, ServerAddress, ServerConfig};
use crate::error::MeshError;
use crate::transport::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A server reported by a discovery source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredServer {
    pub id: String,

    #[serde(flatten)]
    pub address: ServerAddress,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl DiscoveredServer {
    pub fn new(id: impl Into<String>, address: ServerAddress) -> Self {
        Self {
            id: id.into(),
            address,
            capabilities: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn from_config(id: impl Into<String>, config: &ServerConfig) -> Self {
        Self {
            id: id.into(),
            address: config.address.clone(),
            capabilities: config.capabilities.clone(),
            tags: config.tags.clone(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Where the set of discoverable servers comes from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Current set of servers; an error leaves the registry untouched
    async fn list_servers(&self) -> Result<Vec<DiscoveredServer>>;
}

/// Fixed list of servers
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    servers: Vec<DiscoveredServer>,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<DiscoveredServer>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn list_servers(&self) -> Result<Vec<DiscoveredServer>> {
        Ok(self.servers.clone())
    }
}

/// JSON file in the `servers` layout of the main config, re-read on every
/// poll
///
/// ```json
/// { "servers": { "search-b": { "transport": "http", "url": "http://10.0.0.6/mcp" } } }
/// ```
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DiscoverySource for FileDiscovery {
    async fn list_servers(&self) -> Result<Vec<DiscoveredServer>> {
        let path = self.path.clone();
        let config = tokio::task::spawn_blocking(move || MeshConfig::from_file(path))
            .await
            .map_err(|e| MeshError::Config(format!("discovery file read aborted: {e}")))??;

        debug!(path = %self.path.display(), servers = config.servers.len(), "Read discovery file");
        Ok(config
            .servers
            .iter()
            .map(|(id, server)| DiscoveredServer::from_config(id, server))
            .collect())
    }
}

/// Outcome of one self-describe (`tools/list`) probe
#[derive(Debug)]
pub struct DescribeReport {
    pub server_id: String,
    pub tools: Vec<ToolDescriptor>,
    /// Capabilities not previously known for the server
    pub added: usize,
    pub latency: Duration,
    pub error: Option<MeshError>,
}

impl DescribeReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_static_discovery() {
        let source = StaticDiscovery::new(vec![
            DiscoveredServer::new("a", ServerAddress::Memory).with_capabilities(["search"]),
        ]);
        let servers = source.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].capabilities, vec!["search".to_string()]);
    }

    #[tokio::test]
    async fn test_file_discovery_rereads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"servers": {{"b": {{"transport": "http", "url": "http://localhost:9000/mcp", "capabilities": ["fetch"]}}}}}}"#
        )
        .unwrap();

        let source = FileDiscovery::new(file.path());
        let servers = source.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "b");
        assert_eq!(servers[0].address, ServerAddress::http("http://localhost:9000/mcp"));

        std::fs::write(file.path(), r#"{"servers": {}}"#).unwrap();
        assert!(source.list_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_discovery_missing_file() {
        let source = FileDiscovery::new("/nonexistent/toolmesh-discovery.json");
        assert!(matches!(
            source.list_servers().await,
            Err(MeshError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_source() {
        let mut source = MockDiscoverySource::new();
        source
            .expect_list_servers()
            .times(1)
            .returning(|| Ok(vec![DiscoveredServer::new("m", ServerAddress::Memory)]));

        let servers = source.list_servers().await.unwrap();
        assert_eq!(servers[0].id, "m");
    }

    #[test]
    fn test_discovered_server_json() {
        let server: DiscoveredServer = serde_json::from_str(
            r#"{"id": "files", "transport": "stdio", "command": "fs-server", "tags": ["local"]}"#,
        )
        .unwrap();
        assert_eq!(server.address, ServerAddress::stdio("fs-server", Vec::<String>::new()));
        assert_eq!(server.tags, vec!["local".to_string()]);
        assert!(server.capabilities.is_empty());
    }
}
