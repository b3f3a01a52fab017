//! JSON-RPC 2.0 front for a [`ToolDispatcher`], over line-delimited stdio or HTTP.

use crate::{tool_descriptors, ToolDispatcher};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{BufRead, Read, Write};
use std::net::TcpListener;
use tiny_http::{Header, Method, Response, Server};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const RPC_PATH: &str = "/rpc";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

/// Handles one raw message. `None` means nothing is sent back (notifications).
pub fn handle_message(dispatcher: &ToolDispatcher, raw: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(request) => handle_request(dispatcher, &request),
        Err(err) => Some(error_response(
            Value::Null,
            PARSE_ERROR,
            format!("Parse error: {}", err),
        )),
    }
}

pub fn handle_request(dispatcher: &ToolDispatcher, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned();
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return Some(error_response(
            id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid request: missing method",
        ));
    };
    if method.starts_with("notifications/") {
        tracing::debug!(method, "notification");
        return None;
    }
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": "sheetbench", "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => tool_descriptors()
            .map(|tools| json!({ "tools": tools }))
            .map_err(|err| (INTERNAL_ERROR, err.to_string())),
        "tools/call" => call_tool(dispatcher, &params),
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {}", other))),
    };
    // A request without an id is a notification even for known methods.
    let id = id?;
    Some(match result {
        Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
        Err((code, message)) => error_response(id, code, message),
    })
}

fn call_tool(dispatcher: &ToolDispatcher, params: &Value) -> Result<Value, (i64, String)> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| (INVALID_PARAMS, "Invalid params: missing tool name".to_string()))?;
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    let reply = dispatcher.call(name, &arguments);
    Ok(json!({
        "content": [{ "type": "text", "text": reply.text }],
        "isError": reply.is_error,
    }))
}

/// Reads one request per line until EOF; blank lines are skipped.
pub fn serve_stdio<R: BufRead, W: Write>(
    dispatcher: &ToolDispatcher,
    reader: R,
    mut writer: W,
) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_message(dispatcher, &line) {
            writeln!(writer, "{}", response)?;
            writer.flush()?;
        }
    }
    tracing::info!("stdin closed");
    Ok(())
}

/// `POST /rpc` with one JSON-RPC message per body.
pub struct HttpRpcServer {
    pub endpoint: String,
    server: Server,
}

impl HttpRpcServer {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let server = Server::from_listener(listener, None).map_err(|e| anyhow!(e.to_string()))?;
        Ok(Self {
            endpoint: format!("http://{}:{}{}", local.ip(), local.port(), RPC_PATH),
            server,
        })
    }

    pub fn serve(&self, dispatcher: &ToolDispatcher) -> Result<()> {
        tracing::info!(endpoint = %self.endpoint, "serving JSON-RPC over HTTP");
        loop {
            self.handle_next(dispatcher)?;
        }
    }

    /// Blocks for one request and answers it.
    pub fn handle_next(&self, dispatcher: &ToolDispatcher) -> Result<()> {
        let mut request = self.server.recv()?;
        if request.method() != &Method::Post || request.url() != RPC_PATH {
            let _ = request.respond(Response::from_string("not found").with_status_code(404));
            return Ok(());
        }
        let mut body = String::new();
        if let Err(err) = request.as_reader().read_to_string(&mut body) {
            let _ = request.respond(Response::from_string(err.to_string()).with_status_code(400));
            return Ok(());
        }
        let response = match handle_message(dispatcher, &body) {
            Some(value) => {
                let mut response = Response::from_string(value.to_string());
                if let Ok(header) =
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                {
                    response = response.with_header(header);
                }
                response
            }
            None => Response::from_string(String::new()).with_status_code(204),
        };
        if let Err(err) = request.respond(response) {
            tracing::warn!(error = %err, "failed to send HTTP response");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, open};
    use std::io::Cursor;
    use std::net::TcpStream;

    #[test]
    fn initialize_and_ping_reply_with_the_request_id() {
        let (guard, config) = fixture("sheetbench_rpc_init", true);
        let dispatcher = open(&guard, &config);
        let reply = handle_message(
            &dispatcher,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .expect("reply");
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["serverInfo"]["name"], "sheetbench");

        let reply = handle_message(&dispatcher, r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#)
            .expect("reply");
        assert_eq!(reply, json!({ "jsonrpc": "2.0", "id": "p", "result": {} }));
    }

    #[test]
    fn notifications_get_no_reply() {
        let (guard, config) = fixture("sheetbench_rpc_notify", true);
        let dispatcher = open(&guard, &config);
        assert!(handle_message(
            &dispatcher,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        )
        .is_none());
        assert!(handle_message(&dispatcher, r#"{"jsonrpc":"2.0","method":"ping"}"#).is_none());
    }

    #[test]
    fn protocol_errors_use_standard_codes() {
        let (guard, config) = fixture("sheetbench_rpc_errors", true);
        let dispatcher = open(&guard, &config);
        let reply = handle_message(&dispatcher, "{not json").expect("reply");
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert_eq!(reply["id"], Value::Null);

        let reply = handle_message(&dispatcher, r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#)
            .expect("reply");
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);

        let reply = handle_message(
            &dispatcher,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{}}"#,
        )
        .expect("reply");
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);
    }

    #[test]
    fn tools_call_wraps_the_reply_as_text_content() {
        let (guard, config) = fixture("sheetbench_rpc_call", true);
        let dispatcher = open(&guard, &config);
        let reply = handle_request(
            &dispatcher,
            &json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "write_file", "arguments": { "path": "a.txt", "content": "x" } },
            }),
        )
        .expect("reply");
        assert_eq!(
            reply["result"],
            json!({ "content": [{ "type": "text", "text": "Success" }], "isError": false })
        );

        let reply = handle_request(
            &dispatcher,
            &json!({ "jsonrpc": "2.0", "id": 5, "method": "tools/list" }),
        )
        .expect("reply");
        assert_eq!(reply["result"]["tools"].as_array().expect("tools").len(), 7);
    }

    #[test]
    fn stdio_loop_answers_each_request_line() {
        let (guard, config) = fixture("sheetbench_rpc_stdio", true);
        let dispatcher = open(&guard, &config);
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"get_manifest"}}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve_stdio(&dispatcher, Cursor::new(input), &mut output).expect("serve");
        let lines: Vec<Value> = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["id"], 2);
        assert!(lines[1]["result"]["content"][0]["text"]
            .as_str()
            .expect("text")
            .contains("banking"));
    }

    #[test]
    fn http_transport_serves_rpc_posts() {
        let (guard, config) = fixture("sheetbench_rpc_http", true);
        let dispatcher = open(&guard, &config);
        let server = HttpRpcServer::bind("127.0.0.1:0").expect("bind");
        let addr = server
            .endpoint
            .trim_start_matches("http://")
            .trim_end_matches(RPC_PATH)
            .to_string();

        let client = std::thread::spawn(move || {
            let body = r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#;
            let mut stream = TcpStream::connect(&addr).expect("connect");
            write!(
                stream,
                "POST /rpc HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                addr,
                body.len(),
                body
            )
            .expect("send");
            let mut response = String::new();
            stream.read_to_string(&mut response).expect("read");
            response
        });

        server.handle_next(&dispatcher).expect("handle");
        let response = client.join().expect("client thread");
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        let body = response.split("\r\n\r\n").nth(1).expect("body");
        let reply: Value = serde_json::from_str(body).expect("json body");
        assert_eq!(reply, json!({ "jsonrpc": "2.0", "id": 9, "result": {} }));
    }
}
