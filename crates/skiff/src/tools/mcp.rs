//! Tools served by external MCP servers.
//!
//! Each configured server is spawned as a child process and spoken to with newline-delimited
//! JSON-RPC 2.0 over its stdin and stdout. Every tool the server lists becomes an [`McpTool`]
//! that forwards calls to the shared [`McpClient`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::Tool;
use crate::errors::{McpError, McpResult};
use crate::models::tool::ToolResult;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Time a server gets to answer `initialize` and `tools/list`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The `mcp.json` file: `{"mcpServers": {"<name>": {...}}}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    pub fn from_json(raw: &str) -> McpResult<Self> {
        serde_json::from_str(raw).map_err(|e| McpError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
}

/// A tool as listed by `tools/list`
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({})
}

/// Result of `tools/call`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text items joined by newlines; other items are rendered as JSON
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Waiters keyed by request id. `None` once the server's stdout has closed.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<McpResult<Value>>>>>>;

/// Connection to one MCP server process. Dropping it kills the server.
pub struct McpClient {
    server: String,
    writer: AsyncMutex<BufWriter<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    _child: Mutex<Child>,
    reader: JoinHandle<()>,
}

impl McpClient {
    /// Spawn the server and complete the `initialize` handshake
    pub async fn connect(name: &str, config: &McpServerConfig) -> McpResult<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| McpError::Spawn {
            server: name.to_string(),
            message: e.to_string(),
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Transport {
                server: name.to_string(),
                message: "failed to capture server stdio".into(),
            });
        };

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_responses(name.to_string(), stdout, pending.clone()));

        let client = Self {
            server: name.to_string(),
            writer: AsyncMutex::new(BufWriter::new(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            _child: Mutex::new(child),
            reader,
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, client.initialize())
            .await
            .map_err(|_| McpError::Timeout(name.to_string()))??;
        Ok(client)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn initialize(&self) -> McpResult<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.request("initialize", params).await?;
        self.notify("notifications/initialized", json!({})).await
    }

    pub async fn list_tools(&self) -> McpResult<Vec<McpToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| McpError::InvalidResponse(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        serde_json::from_value(result).map_err(|e| McpError::InvalidResponse(e.to_string()))
    }

    async fn request(&self, method: &str, params: Value) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            let Some(pending) = pending.as_mut() else {
                return Err(McpError::Terminated(self.server.clone()));
            };
            pending.insert(id, tx);
        }

        tracing::debug!(server = %self.server, id, method, "sending MCP request");
        let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = self.write(&payload).await {
            if let Some(pending) = self.pending.lock().unwrap().as_mut() {
                pending.remove(&id);
            }
            return Err(e);
        }

        rx.await
            .unwrap_or_else(|_| Err(McpError::Terminated(self.server.clone())))
    }

    async fn notify(&self, method: &str, params: Value) -> McpResult<()> {
        self.write(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
    }

    async fn write(&self, payload: &Value) -> McpResult<()> {
        let mut line = payload.to_string();
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        written.await.map_err(|e| McpError::Transport {
            server: self.server.clone(),
            message: e.to_string(),
        })
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(server: String, stdout: ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(server = %server, line, error = %e, "skipping non-JSON line");
                continue;
            }
        };
        if let Some(method) = message.get("method").and_then(Value::as_str) {
            tracing::debug!(server = %server, method, "ignoring message from server");
            continue;
        }
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            continue;
        };

        let sender = pending
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|pending| pending.remove(&id));
        match sender {
            Some(sender) => {
                let _ = sender.send(response_result(&message));
            }
            None => tracing::debug!(server = %server, id, "response for unknown request"),
        }
    }

    tracing::debug!(server = %server, "MCP server closed its output");
    // Dropping the senders fails every outstanding request
    pending.lock().unwrap().take();
}

fn response_result(message: &Value) -> McpResult<Value> {
    if let Some(error) = message.get("error") {
        return Err(McpError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// A tool that lives on an MCP server
pub struct McpTool {
    info: McpToolInfo,
    description: String,
    client: Arc<McpClient>,
}

impl McpTool {
    pub fn new(info: McpToolInfo, client: Arc<McpClient>) -> Self {
        let description = info.description.clone().unwrap_or_default();
        Self {
            info,
            description,
            client,
        }
    }

    pub fn server(&self) -> &str {
        self.client.server()
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        match self.client.call_tool(&self.info.name, arguments).await {
            Ok(result) if result.is_error => {
                ToolResult::failure("Tool returned error").with_content(result.text())
            }
            Ok(result) => ToolResult::success(result.text()),
            Err(e) => ToolResult::failure(format!("MCP tool execution failed: {}", e)),
        }
    }
}

/// Connect to every enabled server in the config file and collect their tools.
///
/// A missing file yields no tools. Servers that fail to start or answer are skipped with a
/// warning so one broken server does not take the others down.
pub async fn load_mcp_tools(config_path: impl AsRef<Path>) -> McpResult<Vec<Box<dyn Tool>>> {
    let config_path = config_path.as_ref();
    if !config_path.exists() {
        tracing::info!(path = %config_path.display(), "MCP config not found");
        return Ok(Vec::new());
    }
    let raw = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| McpError::Config(format!("{}: {}", config_path.display(), e)))?;
    let config = McpConfig::from_json(&raw)?;

    let mut tools: Vec<Box<dyn Tool>> = Vec::new();
    for (name, server) in &config.servers {
        if server.disabled {
            tracing::info!(server = %name, "skipping disabled MCP server");
            continue;
        }
        if server.command.is_empty() {
            tracing::warn!(server = %name, "MCP server has no command");
            continue;
        }

        match connect_and_list(name, server).await {
            Ok(server_tools) => {
                tracing::info!(server = %name, count = server_tools.len(), "connected to MCP server");
                tools.extend(server_tools);
            }
            Err(e) => tracing::warn!(server = %name, error = %e, "failed to load MCP server"),
        }
    }
    Ok(tools)
}

async fn connect_and_list(name: &str, config: &McpServerConfig) -> McpResult<Vec<Box<dyn Tool>>> {
    let client = Arc::new(McpClient::connect(name, config).await?);
    let listed = tokio::time::timeout(HANDSHAKE_TIMEOUT, client.list_tools())
        .await
        .map_err(|_| McpError::Timeout(name.to_string()))??;

    Ok(listed
        .into_iter()
        .map(|info| Box::new(McpTool::new(info, client.clone())) as Box<dyn Tool>)
        .collect())
}
