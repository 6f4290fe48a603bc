//! In-process tool servers
//!
//! An [`InMemoryServer`] answers the same JSON-RPC methods as a real MCP
//! server, with adjustable latency and reachability. Requests still pass
//! through the JSON codec, so embedding local tools or driving the pool and
//! router in tests exercises the same paths as a remote server.

use super::{
    Arguments, CapabilityResult, Connector, JsonRpcRequest, JsonRpcResponse, ServerInfo,
    ToolDescriptor, Transport,
};
use crate::Result;
use crate::config::ServerAddress;
use crate::error::{INVALID_PARAMS, METHOD_NOT_FOUND, MeshError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Handler behind one in-process tool
pub type ToolHandler = Arc<dyn Fn(&Arguments) -> Result<CapabilityResult> + Send + Sync>;

struct Tool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

struct Inner {
    info: ServerInfo,
    tools: RwLock<BTreeMap<String, Tool>>,
    latency: Mutex<Duration>,
    reachable: AtomicBool,
    connects: AtomicUsize,
    calls: AtomicUsize,
    pings: AtomicUsize,
    open: AtomicUsize,
}

/// Shareable handle to an in-process server
#[derive(Clone)]
pub struct InMemoryServer {
    inner: Arc<Inner>,
}

impl InMemoryServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                info: ServerInfo {
                    name: name.into(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                tools: RwLock::new(BTreeMap::new()),
                latency: Mutex::new(Duration::ZERO),
                reachable: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
            }),
        }
    }

    /// Add a tool
    pub fn with_tool<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Arguments) -> Result<CapabilityResult> + Send + Sync + 'static,
    {
        let name = name.into();
        self.inner.tools.write().insert(
            name.clone(),
            Tool {
                descriptor: ToolDescriptor::new(name),
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Add a tool answering with fixed text
    pub fn with_text_tool(self, name: impl Into<String>, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        self.with_tool(name, move |_| Ok(CapabilityResult::text(reply.clone())))
    }

    /// Delay applied to every request, handshake included
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Unreachable servers refuse connections and fail every request
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    /// Connections ever opened
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// `tools/call` requests received
    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.inner.pings.load(Ordering::SeqCst)
    }

    fn handle(&self, request: &JsonRpcRequest) -> std::result::Result<Value, (i64, String)> {
        match request.method.as_str() {
            "initialize" => Ok(serde_json::json!({
                "protocolVersion": super::PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": self.inner.info,
            })),
            "ping" => {
                self.inner.pings.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({}))
            }
            "tools/list" => {
                let tools: Vec<ToolDescriptor> = self
                    .inner
                    .tools
                    .read()
                    .values()
                    .map(|t| t.descriptor.clone())
                    .collect();
                Ok(serde_json::json!({ "tools": tools }))
            }
            "tools/call" => {
                self.inner.calls.fetch_add(1, Ordering::SeqCst);
                self.call_tool(&request.params)
            }
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        }
    }

    fn call_tool(&self, params: &Value) -> std::result::Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "missing tool name".to_string()))?;
        let args = Arguments::from_value(params.get("arguments").cloned().unwrap_or(Value::Null))
            .map_err(|e| (INVALID_PARAMS, e.to_string()))?;

        let handler = self
            .inner
            .tools
            .read()
            .get(name)
            .map(|t| t.handler.clone())
            .ok_or_else(|| (INVALID_PARAMS, format!("Unknown tool: {name}")))?;

        match handler(&args) {
            Ok(result) => serde_json::to_value(result).map_err(|e| (-32603, e.to_string())),
            Err(MeshError::Protocol { code, message }) => Err((code, message)),
            Err(other) => Err((-32603, other.to_string())),
        }
    }
}

impl std::fmt::Debug for InMemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryServer")
            .field("name", &self.inner.info.name)
            .field("reachable", &self.is_reachable())
            .finish_non_exhaustive()
    }
}

/// Transport bound to one [`InMemoryServer`]
pub struct InMemoryTransport {
    server_id: String,
    server: InMemoryServer,
    next_id: AtomicU64,
    closed: bool,
}

impl InMemoryTransport {
    async fn round_trip(&self, request: JsonRpcRequest) -> Result<Option<Value>> {
        let latency = *self.server.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.server.is_reachable() {
            return Err(MeshError::transport(&self.server_id, "connection reset by peer"));
        }

        // Through the codec, as a remote peer would see it.
        let wire = serde_json::to_string(&request)?;
        let request: JsonRpcRequest = serde_json::from_str(&wire)?;

        let Some(id) = request.id else {
            return Ok(None);
        };
        let response = match self.server.handle(&request) {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err((code, message)) => JsonRpcResponse::failure(id, code, message),
        };
        let wire = serde_json::to_string(&response)?;
        let response: JsonRpcResponse = serde_json::from_str(&wire)?;
        response.into_result(&self.server_id).map(Some)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        if self.closed {
            return Err(MeshError::transport(&self.server_id, "transport closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let result = self
            .round_trip(JsonRpcRequest::new(id, method, params))
            .await?;
        Ok(result.unwrap_or(Value::Null))
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        if self.closed {
            return Err(MeshError::transport(&self.server_id, "transport closed"));
        }
        self.round_trip(JsonRpcRequest::notification(method, params))
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.server.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.server.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Connector resolving server ids to in-process servers
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    servers: Arc<RwLock<HashMap<String, InMemoryServer>>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `server_id` from `server`, replacing any previous one
    pub fn insert(&self, server_id: impl Into<String>, server: InMemoryServer) {
        self.servers.write().insert(server_id.into(), server);
    }

    pub fn with_server(self, server_id: impl Into<String>, server: InMemoryServer) -> Self {
        self.insert(server_id, server);
        self
    }

    pub fn remove(&self, server_id: &str) -> Option<InMemoryServer> {
        self.servers.write().remove(server_id)
    }

    pub fn server(&self, server_id: &str) -> Option<InMemoryServer> {
        self.servers.read().get(server_id).cloned()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, server_id: &str, _address: &ServerAddress) -> Result<Box<dyn Transport>> {
        let server = self
            .server(server_id)
            .ok_or_else(|| MeshError::transport(server_id, "no in-process server with this id"))?;

        if !server.is_reachable() {
            return Err(MeshError::transport(server_id, "connection refused"));
        }

        server.inner.connects.fetch_add(1, Ordering::SeqCst);
        server.inner.open.fetch_add(1, Ordering::SeqCst);
        debug!(server_id = %server_id, "Opened in-process transport");

        Ok(Box::new(InMemoryTransport {
            server_id: server_id.to_string(),
            server,
            next_id: AtomicU64::new(0),
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::initialize_params;

    fn echo_server() -> InMemoryServer {
        InMemoryServer::new("echo").with_tool("echo", |args| {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(CapabilityResult::text(text))
        })
    }

    #[tokio::test]
    async fn test_handshake_and_call() {
        let connector = InMemoryConnector::new().with_server("s1", echo_server());
        let mut transport = connector.connect("s1", &ServerAddress::Memory).await.unwrap();

        let init = transport.request("initialize", initialize_params()).await.unwrap();
        assert_eq!(init["serverInfo"]["name"], "echo");
        transport
            .notify("notifications/initialized", Value::Null)
            .await
            .unwrap();

        let result = transport
            .request(
                "tools/call",
                serde_json::json!({"name": "echo", "arguments": {"text": "hi"}}),
            )
            .await
            .unwrap();
        let result: CapabilityResult = serde_json::from_value(result).unwrap();
        assert_eq!(result.text_content(), "hi");

        let server = connector.server("s1").unwrap();
        assert_eq!(server.call_count(), 1);
        assert_eq!(server.open_connections(), 1);
        transport.close().await.unwrap();
        assert_eq!(server.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_protocol_error() {
        let connector = InMemoryConnector::new().with_server("s1", echo_server());
        let mut transport = connector.connect("s1", &ServerAddress::Memory).await.unwrap();

        let err = transport
            .request("tools/call", serde_json::json!({"name": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Protocol { code, .. } if code == INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let server = echo_server();
        let connector = InMemoryConnector::new().with_server("s1", server.clone());
        let mut transport = connector.connect("s1", &ServerAddress::Memory).await.unwrap();

        server.set_reachable(false);
        assert!(matches!(
            transport.request("ping", Value::Null).await,
            Err(MeshError::Transport { .. })
        ));
        assert!(connector.connect("s1", &ServerAddress::Memory).await.is_err());
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let server = echo_server().with_latency(Duration::from_millis(250));
        let connector = InMemoryConnector::new().with_server("s1", server);
        let mut transport = connector.connect("s1", &ServerAddress::Memory).await.unwrap();

        let started = tokio::time::Instant::now();
        transport.request("ping", Value::Null).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
