// Minimal line-delimited JSON-RPC tool provider for end-to-end tests.
//
// FAKE_TOOLS        comma-separated subset of echo,add,fail,reject,crash,grow
// FAKE_ECHO_PREFIX  prepended to echo output so tests can tell servers apart
//
// Calling `grow` registers a `late` tool and announces it with
// notifications/tools/list_changed before replying.

use serde_json::{Value, json};
use std::env;
use std::io::{self, BufRead, Write};

const ALL_TOOLS: &str = "echo,add,fail,reject,crash,grow";

fn main() {
    let mut enabled: Vec<String> = env::var("FAKE_TOOLS")
        .unwrap_or_else(|_| ALL_TOOLS.to_string())
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    let prefix = env::var("FAKE_ECHO_PREFIX").unwrap_or_default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request["method"].as_str().unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method {
            "initialize" => ok(
                id,
                json!({
                    "protocolVersion": params["protocolVersion"],
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake-mcp-server", "version": "0.0.0" },
                    "instructions": "Fake provider for tests",
                }),
            ),
            "ping" => ok(id, json!({})),
            "tools/list" => ok(id, json!({ "tools": descriptors(&enabled) })),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                let args = &params["arguments"];
                if !enabled.iter().any(|tool| tool == name) {
                    error(id, -32602, &format!("unknown tool {name}"))
                } else {
                    match name {
                        "echo" => ok(
                            id,
                            text(&format!("{prefix}{}", args["text"].as_str().unwrap_or(""))),
                        ),
                        "add" => {
                            let sum = args["a"].as_f64().unwrap_or(0.0)
                                + args["b"].as_f64().unwrap_or(0.0);
                            ok(id, text(&format_number(sum)))
                        }
                        "fail" => ok(
                            id,
                            json!({
                                "isError": true,
                                "content": [{ "type": "text", "text": "tool failed on purpose" }]
                            }),
                        ),
                        "reject" => error(id, -32602, "arguments rejected"),
                        "crash" => std::process::exit(1),
                        "grow" => {
                            if !enabled.iter().any(|tool| tool == "late") {
                                enabled.push("late".to_string());
                            }
                            let changed = json!({
                                "jsonrpc": "2.0",
                                "method": "notifications/tools/list_changed"
                            });
                            if writeln!(stdout, "{changed}").is_err() {
                                break;
                            }
                            ok(id, text("grown"))
                        }
                        "late" => ok(id, text("late")),
                        _ => error(id, -32601, "unreachable"),
                    }
                }
            }
            other => error(id, -32601, &format!("method not found: {other}")),
        };

        if writeln!(stdout, "{reply}").and_then(|_| stdout.flush()).is_err() {
            break;
        }
    }
}

fn descriptors(enabled: &[String]) -> Vec<Value> {
    enabled
        .iter()
        .map(|name| {
            let schema = match name.as_str() {
                "echo" => json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
                "add" => json!({
                    "type": "object",
                    "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                    "required": ["a", "b"]
                }),
                _ => json!({ "type": "object" }),
            };
            json!({ "name": name, "description": format!("{name} tool"), "inputSchema": schema })
        })
        .collect()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn text(content: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": content }] })
}

fn ok(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
