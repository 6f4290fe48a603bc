//! HTTP transport
//!
//! JSON-RPC 2.0 over HTTP POST. Servers may answer with a plain JSON body
//! or a single-response `text/event-stream`; a session id handed out by the
//! server is echoed on every later request.

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::Result;
use crate::error::MeshError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, trace};

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP POST transport
pub struct HttpTransport {
    server_id: String,
    url: String,
    headers: HeaderMap,
    client: reqwest::Client,
    session_id: Option<String>,
    next_id: u64,
}

impl HttpTransport {
    /// Create a transport sharing `client`'s connection pool
    pub fn new(
        server_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        Ok(Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            headers: build_headers(headers)?,
            client,
            session_id: None,
            next_id: 0,
        })
    }

    fn request_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        if let Some(session) = &self.session_id {
            let value = HeaderValue::from_str(session)
                .map_err(|e| MeshError::transport(&self.server_id, e))?;
            headers.insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        Ok(headers)
    }

    async fn post(&mut self, message: &JsonRpcRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.request_headers()?)
            .json(message)
            .send()
            .await
            .map_err(|e| MeshError::transport(&self.server_id, format!("HTTP request failed: {e}")))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::transport(
                &self.server_id,
                format!("HTTP {status} for {}: {body}", message.method),
            ));
        }

        Ok(response)
    }
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut header_map = HeaderMap::new();
    header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    header_map.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );

    for (key, value) in headers {
        let name = HeaderName::from_str(key)
            .map_err(|e| MeshError::Config(format!("Invalid header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MeshError::Config(format!("Invalid header value for '{key}': {e}")))?;
        header_map.insert(name, value);
    }

    Ok(header_map)
}

/// Pull the response for `id` out of a JSON or event-stream body
fn parse_body(body: &str, event_stream: bool, id: u64) -> Option<JsonRpcResponse> {
    if !event_stream {
        return serde_json::from_str::<JsonRpcResponse>(body)
            .ok()
            .filter(|r| r.numeric_id() == Some(id));
    }

    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .find(|r| r.numeric_id() == Some(id))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;

        trace!(server_id = %self.server_id, id, "POST {}: {}", self.url, method);
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| MeshError::transport(&self.server_id, e))?;

        let response = parse_body(&body, event_stream, id).ok_or_else(|| {
            MeshError::transport(
                &self.server_id,
                format!("no response with id {id} in reply to {method}"),
            )
        })?;
        response.into_result(&self.server_id)
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        self.post(&JsonRpcRequest::notification(method, params))
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session_id.take() else {
            return Ok(());
        };

        debug!(server_id = %self.server_id, "Ending HTTP session");
        // Best effort; servers without session support answer 405.
        let _ = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .send()
            .await;
        Ok(())
    }
}
