//! Pooled connections
//!
//! A [`Connection`] wraps one transport and walks the state machine
//! `connecting -> ready <-> busy`, with any state able to move to the
//! terminal `closed`. Only the pool creates connections and hands them out.

use crate::Result;
use crate::config::ServerAddress;
use crate::error::MeshError;
use crate::transport::{
    Arguments, CapabilityResult, Connector, ServerInfo, ToolDescriptor, Transport,
    initialize_params,
};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Busy,
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::{Busy, Closed, Connecting, Ready};
        matches!(
            (self, next),
            (Connecting, Ready) | (Ready, Busy) | (Busy, Ready) | (Connecting | Ready | Busy, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Connection {
    id: u64,
    server_id: String,
    state: ConnectionState,
    transport: Box<dyn Transport>,
    server_info: Option<ServerInfo>,
    requests: u64,
    created_at: Instant,
    last_used: Instant,
    /// Set while a request awaits its response; still set if that future
    /// was dropped, which makes the connection unusable
    in_flight: bool,
    broken: bool,
}

impl Connection {
    /// Open a transport and run the MCP handshake
    pub(crate) async fn open(
        id: u64,
        server_id: &str,
        address: &ServerAddress,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let transport = connector.connect(server_id, address).await?;
        let now = Instant::now();
        let mut conn = Self {
            id,
            server_id: server_id.to_string(),
            state: ConnectionState::Connecting,
            transport,
            server_info: None,
            requests: 0,
            created_at: now,
            last_used: now,
            in_flight: false,
            broken: false,
        };

        match conn.handshake().await {
            Ok(()) => {
                conn.transition(ConnectionState::Ready)?;
                Ok(conn)
            }
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let result = self.call("initialize", initialize_params()).await?;
        self.server_info = result
            .get("serverInfo")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        self.transport
            .notify("notifications/initialized", Value::Null)
            .await?;

        debug!(
            server_id = %self.server_id,
            connection_id = self.id,
            peer = self.server_info.as_ref().map_or("unknown", |i| i.name.as_str()),
            "Connection ready"
        );
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(MeshError::transport(
                &self.server_id,
                format!(
                    "connection {} cannot move from {} to {}",
                    self.id, self.state, next
                ),
            ));
        }
        trace!(connection_id = self.id, from = %self.state, to = %next, "Connection state");
        self.state = next;
        Ok(())
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        if self.state == ConnectionState::Closed {
            return Err(MeshError::transport(&self.server_id, "connection is closed"));
        }

        self.requests += 1;
        self.in_flight = true;
        let result = self.transport.request(method, params).await;
        self.in_flight = false;

        if let Err(e) = &result {
            // Protocol errors leave the channel usable.
            if !matches!(e, MeshError::Protocol { .. }) {
                self.broken = true;
            }
        }
        result
    }

    /// Invoke a capability (`tools/call`)
    pub async fn invoke(&mut self, capability: &str, args: &Arguments) -> Result<CapabilityResult> {
        let params = serde_json::json!({
            "name": capability,
            "arguments": args,
        });
        let result = self.call("tools/call", params).await?;
        serde_json::from_value(result).map_err(|e| MeshError::Protocol {
            code: -32603,
            message: format!("malformed tools/call result: {e}"),
        })
    }

    /// List advertised tools (`tools/list`)
    pub async fn describe(&mut self) -> Result<Vec<ToolDescriptor>> {
        let result = self.call("tools/list", serde_json::json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools).map_err(|e| MeshError::Protocol {
            code: -32603,
            message: format!("malformed tools/list result: {e}"),
        })
    }

    /// Liveness probe; does not count as use for idle eviction
    pub async fn ping(&mut self) -> Result<()> {
        self.call("ping", Value::Null).await.map(|_| ())
    }

    /// Close the transport; idempotent
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(e) = self.transport.close().await {
            debug!(server_id = %self.server_id, connection_id = self.id, "Error closing transport: {}", e);
        }
    }

    pub(crate) fn mark_busy(&mut self) -> Result<()> {
        self.transition(ConnectionState::Busy)
    }

    pub(crate) fn mark_ready(&mut self) -> Result<()> {
        self.transition(ConnectionState::Ready)?;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Whether the connection may go back to the idle set
    pub fn is_reusable(&self) -> bool {
        self.state != ConnectionState::Closed && !self.in_flight && !self.broken
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Requests sent over this connection, handshake included
    pub fn request_count(&self) -> u64 {
        self.requests
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryConnector, InMemoryServer};

    async fn open(server: InMemoryServer) -> Connection {
        let connector = InMemoryConnector::new().with_server("s", server);
        Connection::open(1, "s", &ServerAddress::Memory, &connector)
            .await
            .unwrap()
    }

    #[test]
    fn test_state_machine() {
        use ConnectionState::*;
        assert!(Connecting.can_become(Ready));
        assert!(Ready.can_become(Busy));
        assert!(Busy.can_become(Ready));
        assert!(Busy.can_become(Closed));
        assert!(!Connecting.can_become(Busy));
        assert!(!Closed.can_become(Ready));
        assert!(!Closed.can_become(Closed));
    }

    #[tokio::test]
    async fn test_open_runs_handshake() {
        let conn = open(InMemoryServer::new("alpha")).await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.server_info().unwrap().name, "alpha");
        assert_eq!(conn.request_count(), 1);
    }

    #[tokio::test]
    async fn test_invoke_and_describe() {
        let server = InMemoryServer::new("alpha").with_text_tool("search", "found");
        let mut conn = open(server).await;

        conn.mark_busy().unwrap();
        let result = conn.invoke("search", &Arguments::new()).await.unwrap();
        assert_eq!(result.text_content(), "found");
        conn.mark_ready().unwrap();

        let tools = conn.describe().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_connection_usable() {
        let mut conn = open(InMemoryServer::new("alpha")).await;
        let err = conn.invoke("missing", &Arguments::new()).await.unwrap_err();
        assert!(matches!(err, MeshError::Protocol { .. }));
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_transport_error_breaks_connection() {
        let server = InMemoryServer::new("alpha");
        let mut conn = open(server.clone()).await;
        server.set_reachable(false);

        assert!(conn.ping().await.is_err());
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let server = InMemoryServer::new("alpha");
        let mut conn = open(server.clone()).await;
        conn.close().await;
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(server.open_connections(), 0);
        assert!(conn.ping().await.is_err());
        assert!(conn.mark_busy().is_err());
    }

    #[tokio::test]
    async fn test_handshake_failure_closes_transport() {
        let server = InMemoryServer::new("alpha").with_latency(Duration::from_millis(1));
        let connector = InMemoryConnector::new().with_server("s", server.clone());
        // Unknown id: connector refuses before any handshake.
        assert!(
            Connection::open(1, "other", &ServerAddress::Memory, &connector)
                .await
                .is_err()
        );
        assert_eq!(server.open_connections(), 0);
    }
}
