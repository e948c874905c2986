use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

fn write_mcp_message(stdin: &mut impl Write, payload: &Value) {
    let body = serde_json::to_vec(payload).unwrap();
    write!(stdin, "Content-Length: {}\r\n\r\n", body.len()).unwrap();
    stdin.write_all(&body).unwrap();
    stdin.flush().unwrap();
}

fn read_mcp_message(stdout: &mut impl BufRead) -> Value {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).unwrap();
        assert!(n > 0, "unexpected EOF");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>().unwrap());
            }
        }
    }
    let len = content_length.expect("missing Content-Length");
    let mut buf = vec![0_u8; len];
    stdout.read_exact(&mut buf).unwrap();
    serde_json::from_slice(&buf).unwrap()
}

#[test]
fn stdio_server_identifies_and_merges() {
    let db = NamedTempFile::new().unwrap();
    let bin = env!("CARGO_BIN_EXE_relink-mcp");
    let mut child = Command::new(bin)
        .env("RELINK_DB_PATH", db.path())
        .env("RELINK_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {}
        }),
    );
    let init = read_mcp_message(&mut stdout);
    assert_eq!(init["id"], 1);
    assert_eq!(init["result"]["serverInfo"]["name"], "relink-mcp");

    let calls = [
        serde_json::json!({ "email": "lorraine@hillvalley.edu" }),
        serde_json::json!({ "phoneNumber": "123456" }),
        serde_json::json!({ "email": "lorraine@hillvalley.edu", "phoneNumber": "123456" }),
    ];
    let mut last = Value::Null;
    for (i, args) in calls.iter().enumerate() {
        let id = i + 2;
        write_mcp_message(
            &mut stdin,
            &serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "tools/call",
                "params": { "name": "identify", "arguments": args }
            }),
        );
        last = read_mcp_message(&mut stdout);
        assert_eq!(last["id"], id);
        assert!(last["result"]["isError"].is_null());
    }

    let contact = &last["result"]["structuredContent"]["contact"];
    assert_eq!(contact["primaryContactId"], 1);
    assert_eq!(
        contact["emails"],
        serde_json::json!(["lorraine@hillvalley.edu"])
    );
    assert_eq!(contact["phoneNumbers"], serde_json::json!(["123456"]));
    assert_eq!(contact["secondaryContactIds"], serde_json::json!([2]));

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "tools/call",
            "params": { "name": "identify", "arguments": {} }
        }),
    );
    let failed = read_mcp_message(&mut stdout);
    assert_eq!(failed["result"]["isError"], true);
    assert!(failed["result"]["structuredContent"]["error"].is_string());

    // Stop child cleanly.
    drop(stdin);
    let _ = child.wait();
}
