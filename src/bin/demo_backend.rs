//! Minimal MCP backend speaking newline-delimited JSON-RPC on stdio.
//!
//! Tools are picked with `DEMO_BACKEND_TOOLS` (comma-separated, default
//! `ping,echo`). `DEMO_BACKEND_PAGE_SIZE` splits `tools/list` into pages.
//!
//! Known tools:
//! - `ping`: returns `pong`
//! - `echo`: returns the required `message` argument
//! - `env`: returns the value of the variable named by the `name` argument
//! - `fail`: returns a result flagged with `isError`
//! - `exit`: exits the process without answering
//!
//! Any other name answers with its own name.

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use toolhub::pool::types::{error_codes, PROTOCOL_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let tools: Vec<String> = std::env::var("DEMO_BACKEND_TOOLS")
        .unwrap_or_else(|_| "ping,echo".into())
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let page_size = std::env::var("DEMO_BACKEND_PAGE_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0);

    eprintln!("demo backend up with tools {tools:?}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(response) = handle_line(&line, &tools, page_size) else {
            continue;
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// Answer one request line. Notifications get no answer.
fn handle_line(line: &str, tools: &[String], page_size: Option<usize>) -> Option<Value> {
    let Ok(message) = serde_json::from_str::<Value>(line) else {
        return Some(error(Value::Null, error_codes::PARSE_ERROR, "parse error"));
    };
    let id = message.get("id").cloned()?;
    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return Some(error(id, error_codes::INVALID_REQUEST, "missing method"));
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let response = match method {
        "initialize" => ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "toolhub-demo-backend", "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
        "tools/list" => ok(id, list_tools(tools, page_size, &params)),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            if !tools.iter().any(|t| t == name) {
                error(id, error_codes::INVALID_PARAMS, &format!("unknown tool: {name}"))
            } else if name == "exit" {
                std::process::exit(0);
            } else {
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                ok(id, call_tool(name, &arguments))
            }
        }
        other => error(
            id,
            error_codes::METHOD_NOT_FOUND,
            &format!("method not found: {other}"),
        ),
    };
    Some(response)
}

fn list_tools(tools: &[String], page_size: Option<usize>, params: &Value) -> Value {
    let all: Vec<Value> = tools.iter().map(|t| tool_definition(t)).collect();
    let Some(size) = page_size else {
        return json!({ "tools": all });
    };

    let start = params
        .get("cursor")
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0);
    let end = (start + size).min(all.len());
    let page = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();

    if end < all.len() {
        json!({ "tools": page, "nextCursor": end.to_string() })
    } else {
        json!({ "tools": page })
    }
}

fn tool_definition(name: &str) -> Value {
    match name {
        "echo" => json!({
            "name": "echo",
            "description": "Echo the message back",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }
        }),
        "env" => json!({
            "name": "env",
            "description": "Read an environment variable",
            "inputSchema": {
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }
        }),
        other => json!({
            "name": other,
            "description": format!("demo tool {other}"),
            "inputSchema": {"type": "object"}
        }),
    }
}

fn call_tool(name: &str, arguments: &Value) -> Value {
    match name {
        "ping" => text("pong"),
        "echo" => text(arguments.get("message").and_then(Value::as_str).unwrap_or("")),
        "env" => {
            let var = arguments.get("name").and_then(Value::as_str).unwrap_or("");
            text(&std::env::var(var).unwrap_or_default())
        }
        "fail" => json!({
            "content": [{"type": "text", "text": "demo failure"}],
            "isError": true
        }),
        other => text(other),
    }
}

fn text(s: &str) -> Value {
    json!({ "content": [{"type": "text", "text": s}] })
}

fn ok(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: Value, code: i32, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message} })
}
