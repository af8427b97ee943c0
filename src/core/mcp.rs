use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "aircue";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to connect to MCP server: {0}")]
    Connect(String),

    #[error("MCP connection closed")]
    Closed,

    #[error("MCP request timed out after {0}s")]
    Timeout(u64),

    #[error("MCP protocol violation: {0}")]
    Protocol(String),

    #[error("MCP tool error {code}: {message}")]
    Tool { code: i64, message: String },
}

/// Cheap per-connection handle shared with the reader/writer tasks.
/// The id counter lives here so a fresh connection restarts at 1.
#[derive(Clone)]
struct ConnHandle {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    tx_out: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

struct Inner {
    state: ConnectionState,
    conn: Option<ConnHandle>,
}

/// JSON-RPC 2.0 client over a persistent WebSocket.
///
/// `Ready` is only reached after a successful `initialize` handshake on the
/// current socket. A call that fails because the socket died reconnects and
/// retries exactly once; a second failure propagates.
pub struct McpClient {
    url: String,
    inner: Mutex<Inner>,
}

impl McpClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                conn: None,
            }),
        }
    }

    #[allow(dead_code)]
    pub async fn state(&self) -> ConnectionState {
        let inner = self.inner.lock().await;
        match &inner.conn {
            Some(conn) if conn.closed.load(Ordering::SeqCst) => ConnectionState::Disconnected,
            _ => inner.state,
        }
    }

    pub async fn connect(&self) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        inner.state = ConnectionState::Connecting;
        inner.conn = None;

        info!("Connecting to MCP server at {}", self.url);
        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url)).await {
            Err(_) => {
                inner.state = ConnectionState::Disconnected;
                return Err(McpError::Connect(format!(
                    "connection timeout after {}s",
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
            Ok(Err(e)) => {
                inner.state = ConnectionState::Disconnected;
                return Err(McpError::Connect(e.to_string()));
            }
            Ok(Ok((ws, _))) => ws,
        };

        let (mut sink, mut stream) = ws.split();
        let (tx_out, mut rx_out) = mpsc::channel::<Message>(64);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // Writer owns the sink; keep-alive pings ride the same channel so
        // there is a single frame producer.
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    msg = rx_out.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                debug!("MCP write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = keepalive.tick() => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader correlates responses to pending requests by id. On socket
        // loss it drops every pending sender so callers observe `Closed`.
        let pending_reader = pending.clone();
        let closed_reader = closed.clone();
        let tx_pong = tx_out.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        debug!("MCP RX: {}", text);
                        match serde_json::from_str::<JsonRpcResponse>(&text) {
                            Ok(resp) => {
                                let mut p = pending_reader.lock().await;
                                if let Some(tx) = p.remove(&resp.id) {
                                    let _ = tx.send(resp);
                                } else {
                                    warn!("MCP response for unknown request id {}", resp.id);
                                }
                            }
                            Err(_) => warn!("Unparsed MCP frame: {}", text),
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = tx_pong.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MCP socket error: {}", e);
                        break;
                    }
                }
            }
            closed_reader.store(true, Ordering::SeqCst);
            pending_reader.lock().await.clear();
            debug!("MCP connection to {} closed", url);
        });

        let handle = ConnHandle {
            next_id: Arc::new(AtomicU64::new(1)),
            pending,
            tx_out,
            closed,
        };

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {}
        });
        let resp = match Self::request_on(&handle, "initialize", Some(params)).await {
            Ok(resp) => resp,
            Err(e) => {
                inner.state = ConnectionState::Disconnected;
                return Err(McpError::Connect(format!("initialize failed: {}", e)));
            }
        };
        if let Some(err) = resp.error {
            inner.state = ConnectionState::Disconnected;
            return Err(McpError::Protocol(format!("initialize rejected: {}", err)));
        }
        debug!("MCP initialized: {:?}", resp.result);

        inner.conn = Some(handle);
        inner.state = ConnectionState::Ready;
        info!("MCP session ready at {}", self.url);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        debug!("Closing MCP session ({})", inner.state.as_str());
        if let Some(conn) = inner.conn.take() {
            let _ = conn.tx_out.send(Message::Close(None)).await;
        }
        inner.state = ConnectionState::Disconnected;
    }

    /// One request/response exchange on a specific connection.
    async fn request_on(
        conn: &ConnHandle,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = conn.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_string(&req).map_err(|e| McpError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut p = conn.pending.lock().await;
            p.insert(id, tx);
        }

        debug!("MCP TX: {}", payload);
        if conn.tx_out.send(Message::Text(payload)).await.is_err() {
            conn.pending.lock().await.remove(&id);
            return Err(McpError::Closed);
        }

        match tokio::time::timeout(MESSAGE_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                conn.pending.lock().await.remove(&id);
                Err(McpError::Timeout(MESSAGE_TIMEOUT.as_secs()))
            }
        }
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let conn = {
            let inner = self.inner.lock().await;
            match &inner.conn {
                Some(conn) if !conn.closed.load(Ordering::SeqCst) => conn.clone(),
                _ => return Err(McpError::Closed),
            }
        };

        let resp = Self::request_on(&conn, method, params).await?;
        if let Some(err) = resp.error {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(McpError::Tool { code, message });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        let result = match self.call("tools/call", Some(params.clone())).await {
            Err(McpError::Closed) => {
                info!("MCP connection lost during '{}', reconnecting and retrying once", name);
                self.connect().await?;
                self.call("tools/call", Some(params)).await
            }
            other => other,
        }?;

        Ok(extract_tool_result(name, result))
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.call("tools/list", None).await?;
        Ok(parse_tools(&result))
    }
}

fn parse_tools(result: &Value) -> Vec<McpTool> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Pulls the payload out of a `result.content` array. The server wraps tool
/// output either in a `toolResult` item or in a `text` item holding JSON;
/// anything else is warned about and treated as an empty result.
fn extract_tool_result(tool: &str, result: Value) -> Value {
    if let Some(items) = result.get("content").and_then(|c| c.as_array()) {
        for item in items {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("toolResult") => {
                    return item
                        .get("result")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                }
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(|t| t.as_str())
                        && let Ok(parsed) = serde_json::from_str::<Value>(text)
                    {
                        return parsed;
                    }
                }
                _ => {}
            }
        }
    }
    warn!("Tool '{}' returned an unexpected response shape", tool);
    serde_json::json!({})
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::any;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockServer {
        connections: AtomicUsize,
        // Connections (1-based) that hang up instead of answering tools/call.
        drop_call_on: Vec<usize>,
        seen_ids: std::sync::Mutex<Vec<Vec<u64>>>,
    }

    async fn ws_handler(
        ws: WebSocketUpgrade,
        State(state): State<Arc<MockServer>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |socket| serve_session(socket, state))
    }

    async fn serve_session(mut socket: WebSocket, state: Arc<MockServer>) {
        let conn_no = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
        state.seen_ids.lock().unwrap().push(Vec::new());

        while let Some(Ok(msg)) = socket.recv().await {
            let WsMessage::Text(text) = msg else { continue };
            let req: Value = serde_json::from_str(&text).unwrap();
            let id = req["id"].as_u64().unwrap();
            if let Some(ids) = state.seen_ids.lock().unwrap().last_mut() {
                ids.push(id);
            }

            let reply = match req["method"].as_str().unwrap() {
                "initialize" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"protocolVersion": PROTOCOL_VERSION, "capabilities": {}}
                }),
                "tools/list" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [
                        {"name": "get_brand_sound_fragments", "description": null, "inputSchema": {}}
                    ]}
                }),
                "tools/call" => {
                    if state.drop_call_on.contains(&conn_no) {
                        return;
                    }
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"content": [
                            {"type": "toolResult", "result": {"echo": req["params"]["name"]}}
                        ]}
                    })
                }
                other => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("unknown method {other}")}
                }),
            };
            if socket
                .send(WsMessage::Text(reply.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn spawn_mock(drop_call_on: Vec<usize>) -> (String, Arc<MockServer>) {
        let state = Arc::new(MockServer {
            drop_call_on,
            ..Default::default()
        });
        let app = Router::new()
            .route("/", any(ws_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{}", addr), state)
    }

    #[tokio::test]
    async fn connect_reaches_ready_after_handshake() {
        let (url, _state) = spawn_mock(vec![]).await;
        let client = McpClient::new(url);
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        client.connect().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Ready);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_brand_sound_fragments");
    }

    #[tokio::test]
    async fn connect_refused_is_typed_error() {
        let client = McpClient::new("ws://127.0.0.1:1");
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::Connect(_)), "got {err:?}");
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn call_tool_reconnects_once_and_retries() {
        let (url, state) = spawn_mock(vec![1]).await;
        let client = McpClient::new(url);
        client.connect().await.unwrap();

        let result = client
            .call_tool("get_brand_sound_fragments", json!({"brand": "aizoo"}))
            .await
            .unwrap();
        assert_eq!(result["echo"], "get_brand_sound_fragments");
        assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_connection_failure_propagates() {
        let (url, state) = spawn_mock(vec![1, 2]).await;
        let client = McpClient::new(url);
        client.connect().await.unwrap();

        let err = client
            .call_tool("get_brand_sound_fragments", json!({"brand": "aizoo"}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed), "got {err:?}");
        // One reconnect, no further retries.
        assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_ids_restart_per_connection() {
        let (url, state) = spawn_mock(vec![1]).await;
        let client = McpClient::new(url);
        client.connect().await.unwrap();
        client
            .call_tool("get_brand_sound_fragments", json!({}))
            .await
            .unwrap();

        let ids = state.seen_ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        // Both connections began their id space at 1 (initialize).
        assert_eq!(ids[0][0], 1);
        assert_eq!(ids[1][0], 1);
        for conn_ids in ids.iter() {
            for pair in conn_ids.windows(2) {
                assert!(pair[0] < pair[1], "ids must increase within a connection");
            }
        }
    }

    #[tokio::test]
    async fn tool_error_is_not_retried() {
        let (url, state) = spawn_mock(vec![]).await;
        let client = McpClient::new(url);
        client.connect().await.unwrap();

        // The mock answers unknown methods with a JSON-RPC error; route one
        // through call() via a bogus tools/call name is not possible, so
        // exercise the mapping directly.
        let err = client.call("nosuch/method", None).await.unwrap_err();
        assert!(matches!(err, McpError::Tool { code: -32601, .. }), "got {err:?}");
        assert_eq!(state.connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extract_picks_tool_result_item() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "not json"},
                {"type": "toolResult", "result": {"fragments": [1, 2]}}
            ]
        });
        let out = extract_tool_result("t", raw);
        assert_eq!(out["fragments"][0], 1);
    }

    #[test]
    fn extract_accepts_json_in_text_item() {
        let raw = json!({
            "content": [{"type": "text", "text": "{\"success\": true}"}]
        });
        let out = extract_tool_result("t", raw);
        assert_eq!(out["success"], true);
    }

    #[test]
    fn extract_warns_and_returns_empty_on_unknown_shape() {
        let out = extract_tool_result("t", json!({"content": []}));
        assert_eq!(out, json!({}));
        let out = extract_tool_result("t", json!({}));
        assert_eq!(out, json!({}));
        let out = extract_tool_result("t", Value::Null);
        assert_eq!(out, json!({}));
    }
}
