//! Wire protocol and transports
//!
//! Every backend speaks JSON-RPC 2.0 framed according to its transport.
//! A [`Transport`] is one exclusive channel to one server; a [`Connector`]
//! opens new transports for the pool. The core never looks inside
//! [`Arguments`]; they are validated as a JSON object and passed through.

use crate::Result;
use crate::config::ServerAddress;
use crate::error::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[cfg(feature = "http")]
pub mod http;
pub mod memory;
#[cfg(feature = "stdio")]
pub mod stdio;

pub use memory::{InMemoryConnector, InMemoryServer};

/// MCP protocol revision sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const JSONRPC_VERSION: &str = "2.0";

/// Named arguments of a capability call
///
/// Always a JSON object; `null` is accepted as the empty object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(Map<String, Value>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate an arbitrary JSON value as an argument object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(MeshError::InvalidArguments(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse arguments from JSON text
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl TryFrom<Value> for Arguments {
    type Error = MeshError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One block of a capability result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result of `tools/call`
///
/// `is_error` marks a tool-level failure reported by a healthy server; it
/// is still a successful round trip as far as routing is concerned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityResult {
    #[serde(default)]
    pub content: Vec<Content>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CapabilityResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            ..Self::default()
        }
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
            structured_content: None,
        }
    }

    /// Concatenated text blocks
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tool advertised by `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }
}

/// Identity returned by `initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Outgoing JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Incoming JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(Value::from(id)),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(Value::from(id)),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Numeric correlation id, if the peer sent one
    pub fn numeric_id(&self) -> Option<u64> {
        match &self.id {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Split into result or protocol error
    pub fn into_result(self, server_id: &str) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(MeshError::Protocol {
                code: error.code,
                message: error.message,
            });
        }
        self.result
            .ok_or_else(|| MeshError::transport(server_id, "response carried neither result nor error"))
    }
}

/// Parameters of the `initialize` handshake
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// One exclusive request/response channel to a server
///
/// Methods take `&mut self`: the pool guarantees a transport is used by
/// one caller at a time, so implementations need no internal locking.
#[async_trait]
pub trait Transport: Send {
    /// Send a request and wait for its matching response
    async fn request(&mut self, method: &str, params: Value) -> Result<Value>;

    /// Send a notification (no response expected)
    async fn notify(&mut self, method: &str, params: Value) -> Result<()>;

    /// Release the underlying channel
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports for a server address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server_id: &str, address: &ServerAddress) -> Result<Box<dyn Transport>>;
}

/// Connector dispatching on the address kind
///
/// `memory` addresses resolve against an optional [`InMemoryConnector`].
#[derive(Default)]
pub struct DefaultConnector {
    memory: Option<InMemoryConnector>,
    #[cfg(feature = "http")]
    http_client: reqwest::Client,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, memory: InMemoryConnector) -> Self {
        self.memory = Some(memory);
        self
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, server_id: &str, address: &ServerAddress) -> Result<Box<dyn Transport>> {
        match address {
            #[cfg(feature = "stdio")]
            ServerAddress::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let transport =
                    stdio::StdioTransport::spawn(server_id, command, args, env, cwd.as_deref())?;
                Ok(Box::new(transport))
            }
            #[cfg(feature = "http")]
            ServerAddress::Http { url, headers } => {
                let transport =
                    http::HttpTransport::new(server_id, url, headers, self.http_client.clone())?;
                Ok(Box::new(transport))
            }
            ServerAddress::Memory => match &self.memory {
                Some(memory) => memory.connect(server_id, address).await,
                None => Err(MeshError::transport(
                    server_id,
                    "no in-process server registered for memory address",
                )),
            },
            #[allow(unreachable_patterns)]
            other => Err(MeshError::Config(format!(
                "transport '{}' is not enabled in this build",
                other.describe()
            ))),
        }
    }
}
