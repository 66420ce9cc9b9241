//! Status surface.
//!
//! Serves the last published `StatusReport` as JSON and turns confirm/cancel
//! requests into operator commands. It never touches the engine directly;
//! commands go through a channel the host loop drains between cycles.
//!
//! Endpoints:
//!   GET  /api/status  - full status report
//!   GET  /api/health  - state, mode and health only
//!   POST /api/confirm - enqueue a confirm
//!   POST /api/cancel  - enqueue a cancel, optional body `{"reason": "..."}`

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::engine::{OperatorCommand, StatusBoard};
use crate::logging::{self, obj, v_str, Domain};

const MAX_BODY: usize = 4096;

/// Reply for one request, plus the command it produced, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: &'static str,
    pub body: String,
    pub command: Option<OperatorCommand>,
}

impl Reply {
    fn json(status: &'static str, body: Value) -> Self {
        Self { status, body: body.to_string(), command: None }
    }
}

/// Routes a parsed request. Pure, so it can be tested without sockets.
pub fn route(method: &str, path: &str, body: &str, board: &StatusBoard) -> Reply {
    match (method, path) {
        ("GET", "/api/status") => {
            let report = board.read();
            match serde_json::to_value(&report) {
                Ok(v) => Reply::json("200 OK", v),
                Err(e) => {
                    Reply::json("500 Internal Server Error", json!({ "error": e.to_string() }))
                }
            }
        }
        ("GET", "/api/health") => {
            let report = board.read();
            Reply::json(
                "200 OK",
                json!({
                    "state": report.state,
                    "mode": report.mode,
                    "health": report.health,
                    "cycles": report.cycles,
                }),
            )
        }
        ("POST", "/api/confirm") => Reply {
            command: Some(OperatorCommand::Confirm),
            ..Reply::json("202 Accepted", json!({ "queued": "confirm" }))
        },
        ("POST", "/api/cancel") => {
            let reason = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("reason").and_then(Value::as_str).map(str::to_string));
            Reply {
                command: Some(OperatorCommand::Cancel(reason)),
                ..Reply::json("202 Accepted", json!({ "queued": "cancel" }))
            }
        }
        _ => Reply::json("404 Not Found", json!({ "error": "not found" })),
    }
}

pub async fn serve(
    addr: &str,
    board: StatusBoard,
    commands: mpsc::Sender<OperatorCommand>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    logging::info(Domain::System, "status_server_listening", obj(&[("addr", v_str(addr))]));
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                logging::warn(
                    Domain::System,
                    "status_accept_failed",
                    obj(&[("err", v_str(&e.to_string()))]),
                );
                continue;
            }
        };
        let board = board.clone();
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, &board, &commands).await {
                logging::debug(
                    Domain::System,
                    "status_request_failed",
                    obj(&[("err", v_str(&e.to_string()))]),
                );
            }
        });
    }
}

async fn handle(
    stream: TcpStream,
    board: &StatusBoard,
    commands: &mpsc::Sender<OperatorCommand>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length.min(MAX_BODY)];
    reader.read_exact(&mut body).await?;
    let body = String::from_utf8_lossy(&body);

    let reply = route(&method, &path, &body, board);
    if let Some(cmd) = reply.command.clone() {
        logging::info(Domain::Operator, "command_queued", obj(&[("command", v_str(cmd.as_str()))]));
        if commands.send(cmd).await.is_err() {
            logging::warn(Domain::Operator, "command_channel_closed", obj(&[]));
        }
    }

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Length: {}\r\n\r\n{}",
        reply.status,
        reply.body.len(),
        reply.body
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serves_the_published_report() {
        let board = StatusBoard::new();
        let reply = route("GET", "/api/status", "", &board);
        assert_eq!(reply.status, "200 OK");
        let v: Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(v["state"], "BOOT");
        assert_eq!(v["mode"], "PAUSED");
        assert!(reply.command.is_none());
    }

    #[test]
    fn test_health_is_a_summary() {
        let board = StatusBoard::new();
        let reply = route("GET", "/api/health", "", &board);
        let v: Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(v["health"], "NO_DATA");
        assert_eq!(v["cycles"], 0);
    }

    #[test]
    fn test_posts_only_enqueue_commands() {
        let board = StatusBoard::new();
        let reply = route("POST", "/api/confirm", "", &board);
        assert_eq!(reply.command, Some(OperatorCommand::Confirm));

        let reply = route("POST", "/api/cancel", r#"{"reason":"too late"}"#, &board);
        assert_eq!(reply.command, Some(OperatorCommand::Cancel(Some("too late".into()))));

        let reply = route("POST", "/api/cancel", "", &board);
        assert_eq!(reply.command, Some(OperatorCommand::Cancel(None)));
    }

    #[test]
    fn test_unknown_routes_are_404() {
        let board = StatusBoard::new();
        assert_eq!(route("GET", "/api/state", "", &board).status, "404 Not Found");
        assert_eq!(route("GET", "/api/confirm", "", &board).status, "404 Not Found");
    }
}
