// MCP server: request dispatch and the stdio loop

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::tools::{describe_error, KtalkTools, DEFAULT_QUALITY};

use super::protocol::{
    error_response, success_response, text_result, RpcError, PROTOCOL_VERSION, SERVER_NAME,
};

const INSTRUCTIONS: &str = "KTalk meeting recordings and transcripts via kts-ktalk-api-proxy. \
    Call the 'login' tool first if you get a 401 error. \
    Use list_recordings to find recording keys, get_recording_info to see available \
    qualities, then get_transcript or download_recording to save files locally.";

#[derive(Debug, Deserialize)]
struct LoginArgs {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListRecordingsArgs {
    room_name: Option<String>,
    from_date: Option<String>,
    to_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordingInfoArgs {
    recording_key: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptArgs {
    recording_key: String,
    output_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadArgs {
    recording_key: String,
    quality_name: Option<String>,
    output_dir: Option<String>,
}

/// MCP request handler over the KTalk tools
pub struct McpServer {
    tools: KtalkTools,
}

impl McpServer {
    pub fn new(tools: KtalkTools) -> Self {
        Self { tools }
    }

    /// Serve newline-delimited JSON-RPC until the reader hits EOF.
    ///
    /// Messages are handled one at a time, in arrival order.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            for response in self.handle_line(&line).await {
                let mut payload = serde_json::to_string(&response).unwrap_or_else(|e| {
                    let id = response.get("id").cloned().unwrap_or(Value::Null);
                    error_response(id, RpcError::internal(e.to_string())).to_string()
                });
                payload.push('\n');
                writer.write_all(payload.as_bytes()).await?;
                writer.flush().await?;
            }
        }

        tracing::info!("Input closed, MCP server stopping");
        Ok(())
    }

    /// Handle one raw line; returns the responses to write (none for notifications)
    pub async fn handle_line(&self, line: &str) -> Vec<Value> {
        let incoming: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Unparsable MCP message");
                return vec![error_response(
                    Value::Null,
                    RpcError::parse_error(format!("Parse error: {}", e)),
                )];
            }
        };

        match incoming {
            Value::Array(batch) if batch.is_empty() => vec![error_response(
                Value::Null,
                RpcError::invalid_request("Batch request must not be empty"),
            )],
            Value::Array(batch) => {
                let mut responses = Vec::new();
                for item in batch {
                    responses.extend(self.handle_message(item).await);
                }
                responses
            }
            other => self.handle_message(other).await.into_iter().collect(),
        }
    }

    async fn handle_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        // Responses from the client carry no method; nothing to answer
        let method = obj.get("method").and_then(Value::as_str)?;
        let params = obj.get("params").cloned().unwrap_or(Value::Null);

        match obj.get("id").cloned() {
            Some(id) => {
                tracing::debug!(method = %method, id = %id, "MCP request");
                Some(match self.handle_request(method, params).await {
                    Ok(result) => success_response(id, result),
                    Err(err) => {
                        tracing::warn!(method = %method, code = err.code, error = %err.message, "MCP request failed");
                        error_response(id, err)
                    }
                })
            }
            None => {
                tracing::debug!(method = %method, "MCP notification ignored");
                None
            }
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => self.handle_tools_call(params).await,
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call field 'arguments' must be an object",
                ))
            }
        };

        tracing::info!(tool = %name, "Tool call");

        let outcome = match name {
            "login" => {
                let a: LoginArgs = parse_args(name, args)?;
                self.tools.login(&a.username, &a.password).await
            }
            "list_recordings" => {
                let a: ListRecordingsArgs = parse_args(name, args)?;
                self.tools
                    .list_recordings(
                        a.room_name.as_deref(),
                        a.from_date.as_deref(),
                        a.to_date.as_deref(),
                    )
                    .await
            }
            "get_recording_info" => {
                let a: RecordingInfoArgs = parse_args(name, args)?;
                self.tools.get_recording_info(&a.recording_key).await
            }
            "get_transcript" => {
                let a: TranscriptArgs = parse_args(name, args)?;
                self.tools
                    .get_transcript(&a.recording_key, a.output_dir.as_deref())
                    .await
            }
            "download_recording" => {
                let a: DownloadArgs = parse_args(name, args)?;
                self.tools
                    .download_recording(
                        &a.recording_key,
                        a.quality_name.as_deref(),
                        a.output_dir.as_deref(),
                    )
                    .await
            }
            other => return Err(RpcError::invalid_params(format!("Unknown tool: {}", other))),
        };

        Ok(match outcome {
            Ok(text) => text_result(text, false),
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "Tool call failed");
                text_result(describe_error(&e), true)
            }
        })
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, RpcError> {
    serde_json::from_value(args)
        .map_err(|e| RpcError::invalid_params(format!("Invalid arguments for {}: {}", tool, e)))
}

fn initialize_payload() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "instructions": INSTRUCTIONS
    })
}

fn tool_definitions() -> Vec<Value> {
    let key = json!({
        "type": "string",
        "description": "Recording key (e.g. \"Y3ljMA8KGS72A68L0jp0\")"
    });
    let output_dir = json!({
        "type": "string",
        "description": "Directory to save the file; defaults to KTALK_DOWNLOAD_DIR"
    });

    vec![
        json!({
            "name": "login",
            "description": "Authenticate with Keycloak (password grant). The token is saved \
                locally and refreshed automatically.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "username": { "type": "string", "description": "Keycloak username" },
                    "password": { "type": "string", "description": "Keycloak password" }
                },
                "required": ["username", "password"]
            }
        }),
        json!({
            "name": "list_recordings",
            "description": "List KTalk recordings, optionally filtered by room and date range.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "room_name": { "type": "string", "description": "Room name filter" },
                    "from_date": { "type": "string", "description": "Start date (ISO 8601)" },
                    "to_date": { "type": "string", "description": "End date (ISO 8601)" }
                }
            }
        }),
        json!({
            "name": "get_recording_info",
            "description": "Get recording metadata: title, duration, participants, \
                available download qualities and transcript status.",
            "inputSchema": {
                "type": "object",
                "properties": { "recording_key": key },
                "required": ["recording_key"]
            }
        }),
        json!({
            "name": "get_transcript",
            "description": "Download a recording transcript, format it with timestamps and \
                speaker names, and save it as a .txt file.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "recording_key": key,
                    "output_dir": output_dir
                },
                "required": ["recording_key"]
            }
        }),
        json!({
            "name": "download_recording",
            "description": "Download a recording file to disk. Use get_recording_info first \
                to see available qualities.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "recording_key": key,
                    "quality_name": {
                        "type": "string",
                        "description": "Video quality, e.g. 240p, 480p, 720p, 1080p",
                        "default": DEFAULT_QUALITY
                    },
                    "output_dir": output_dir
                },
                "required": ["recording_key"]
            }
        }),
    ]
}
