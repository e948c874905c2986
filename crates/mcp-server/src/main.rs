use anyhow::{Context, Result};
use relink::{ContactGraph, ContactId, IdentifyRequest, IdentityResolver, RetryConfig};
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use tracing::{debug, info, warn};

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_FIELD_BYTES: usize = 1024;

struct Config {
    db_path: String,
    max_attempts: u32,
}

impl Config {
    fn from_env() -> Result<Self> {
        let db_path = env::var("RELINK_DB_PATH").unwrap_or_else(|_| "./relink.redb".to_string());
        let max_attempts = match env::var("RELINK_MAX_ATTEMPTS") {
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n >= 1)
                .with_context(|| format!("RELINK_MAX_ATTEMPTS must be >= 1, got {raw:?}"))?,
            Err(_) => RetryConfig::default().max_attempts,
        };
        Ok(Self {
            db_path,
            max_attempts,
        })
    }
}

struct AppState {
    resolver: IdentityResolver<ContactGraph>,
}

impl AppState {
    fn open(config: &Config) -> Result<Self> {
        let graph = ContactGraph::open(&config.db_path)?;
        let retry = RetryConfig {
            max_attempts: config.max_attempts,
            ..RetryConfig::default()
        };
        Ok(Self {
            resolver: IdentityResolver::with_retry(graph, retry),
        })
    }
}

fn main() -> Result<()> {
    // A missing .env is fine; the process environment still applies.
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let config = Config::from_env()?;
    let mut state = AppState::open(&config).context("failed to open relink database")?;
    info!(db_path = %config.db_path, "relink-mcp ready");

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing answers -32700 and the loop keeps reading.
                warn!(error = %e, "dropping malformed frame");
                write_message(&mut writer, &parse_error(&e))?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&mut state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    info!("stdin closed, shutting down");
    Ok(())
}

/// Logs go to stderr; stdout carries protocol frames only.
fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("RELINK_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn parse_error(err: &anyhow::Error) -> JsonValue {
    json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": { "code": -32700, "message": format!("Parse error: {err}") }
    })
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &mut AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;
    debug!(method, "request");

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "relink-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    warn!(error = %err, "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err}") }],
                            "structuredContent": { "error": err.to_string() },
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "identify",
            "description": "Resolve an email and/or phone number to its customer cluster, \
                            linking or merging records as needed.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "email": {"type": "string"},
                    "phoneNumber": {"type": ["string", "number"]}
                }
            }
        }),
        json!({
            "name": "contact_cluster",
            "description": "Return the consolidated cluster containing a contact id.",
            "inputSchema": {
                "type": "object",
                "properties": { "contact_id": {"type": "integer", "minimum": 1} },
                "required": ["contact_id"]
            }
        }),
    ]
}

fn call_tool(state: &mut AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "identify" => {
            let req = IdentifyRequest {
                email: text_field(&args, "email")?,
                phone_number: text_field(&args, "phoneNumber")?,
            };
            let resp = state.resolver.identify(req)?;
            let contact = &resp.contact;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "primary contact {} with {} secondary contact(s)",
                        contact.primary_contact_id,
                        contact.secondary_contact_ids.len()
                    )
                }],
                "structuredContent": serde_json::to_value(&resp)?
            }))
        }
        "contact_cluster" => {
            let contact_id = args
                .get("contact_id")
                .and_then(JsonValue::as_u64)
                .context("contact_id is required")?;
            let view = state
                .resolver
                .store()
                .cluster_view(ContactId(contact_id))?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!("contact {contact_id} belongs to primary {}", view.primary_contact_id)
                }],
                "structuredContent": { "contact": view }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

/// Read an optional string argument. Numbers are accepted and rendered as
/// their decimal text, since callers often send phone numbers unquoted.
fn text_field(args: &JsonValue, key: &str) -> Result<Option<String>> {
    let value = match args.get(key) {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(other) => anyhow::bail!("{key} must be a string, got {other}"),
    };
    if value.len() > MAX_FIELD_BYTES {
        anyhow::bail!("{key} exceeds max allowed size ({MAX_FIELD_BYTES} bytes)");
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn temp_state() -> (AppState, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let config = Config {
            db_path: file.path().to_string_lossy().to_string(),
            max_attempts: 2,
        };
        (AppState::open(&config).unwrap(), file)
    }

    fn identify(state: &mut AppState, args: JsonValue) -> Result<JsonValue> {
        call_tool(
            state,
            Some(&json!({ "name": "identify", "arguments": args })),
        )
    }

    #[test]
    fn identify_returns_contact_envelope() {
        let (mut state, _tmp) = temp_state();
        let out = identify(
            &mut state,
            json!({ "email": "a@x.com", "phoneNumber": "111" }),
        )
        .unwrap();

        let contact = &out["structuredContent"]["contact"];
        assert_eq!(contact["primaryContactId"], 1);
        assert_eq!(contact["emails"], json!(["a@x.com"]));
        assert_eq!(contact["phoneNumbers"], json!(["111"]));
        assert_eq!(contact["secondaryContactIds"], json!([]));
    }

    #[test]
    fn identify_accepts_numeric_phone() {
        let (mut state, _tmp) = temp_state();
        let first = identify(&mut state, json!({ "phoneNumber": 123456 })).unwrap();
        let second = identify(&mut state, json!({ "phoneNumber": "123456" })).unwrap();

        assert_eq!(
            first["structuredContent"]["contact"]["phoneNumbers"],
            json!(["123456"])
        );
        assert_eq!(
            first["structuredContent"], second["structuredContent"],
            "numeric and string forms must resolve to the same contact"
        );
    }

    #[test]
    fn identify_without_fields_is_an_error() {
        let (mut state, _tmp) = temp_state();
        let err = identify(&mut state, json!({ "email": null })).unwrap_err();
        assert!(err
            .to_string()
            .contains("At least one of email or phoneNumber is required"));
    }

    #[test]
    fn identify_rejects_oversized_field() {
        let (mut state, _tmp) = temp_state();
        let huge = "a".repeat(MAX_FIELD_BYTES + 1);
        let err = identify(&mut state, json!({ "email": huge })).unwrap_err();
        assert!(err.to_string().contains("email exceeds max"));
    }

    #[test]
    fn identify_rejects_non_string_email() {
        let (mut state, _tmp) = temp_state();
        let err = identify(&mut state, json!({ "email": ["a@x.com"] })).unwrap_err();
        assert!(err.to_string().contains("email must be a string"));
    }

    #[test]
    fn tool_error_carries_message_field() {
        let (mut state, _tmp) = temp_state();
        let resp = handle_request(
            &mut state,
            &json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": { "name": "identify", "arguments": {} }
            }),
        )
        .unwrap();

        assert_eq!(resp["result"]["isError"], true);
        let message = resp["result"]["structuredContent"]["error"]
            .as_str()
            .unwrap();
        assert!(message.contains("At least one of email or phoneNumber is required"));
    }

    #[test]
    fn contact_cluster_reports_merged_view() {
        let (mut state, _tmp) = temp_state();
        identify(&mut state, json!({ "email": "a@x.com" })).unwrap();
        identify(&mut state, json!({ "phoneNumber": "111" })).unwrap();
        identify(
            &mut state,
            json!({ "email": "a@x.com", "phoneNumber": "111" }),
        )
        .unwrap();

        let out = call_tool(
            &mut state,
            Some(&json!({ "name": "contact_cluster", "arguments": { "contact_id": 2 } })),
        )
        .unwrap();
        let contact = &out["structuredContent"]["contact"];
        assert_eq!(contact["primaryContactId"], 1);
        assert_eq!(contact["secondaryContactIds"], json!([2]));
    }

    #[test]
    fn read_message_rejects_oversized_frame() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(raw.into_bytes());
        let err = read_message(&mut cursor).expect_err("oversized frame must fail");
        assert!(err.to_string().contains("exceeds max allowed"));
    }

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{body}", body.len())
    }

    #[test]
    fn malformed_frame_does_not_stall_the_stream() {
        let raw = frame("{bad}") + &frame(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        let mut cursor = Cursor::new(raw.into_bytes());

        let err = read_message(&mut cursor).expect_err("invalid JSON must fail");
        assert!(err.to_string().contains("invalid JSON payload"));
        let resp = parse_error(&err);
        assert_eq!(resp["error"]["code"], -32700);
        assert_eq!(resp["id"], JsonValue::Null);

        let next = read_message(&mut cursor).unwrap().expect("second frame");
        assert_eq!(next["method"], "ping");
        assert!(read_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn ping_returns_empty_result() {
        let (mut state, _tmp) = temp_state();
        let resp = handle_request(
            &mut state,
            &json!({ "jsonrpc": "2.0", "id": 7, "method": "ping" }),
        )
        .unwrap();
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"], json!({}));
        assert!(resp.get("error").is_none());
    }

    #[test]
    fn unknown_method_is_not_found() {
        let (mut state, _tmp) = temp_state();
        let resp = handle_request(
            &mut state,
            &json!({ "jsonrpc": "2.0", "id": 1, "method": "contacts/delete" }),
        )
        .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
    }
}
