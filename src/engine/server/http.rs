// Localhost HTTP+JSON endpoint. A deliberately small HTTP/1.1 server
// over TcpListener — the surface is a fixed method set on loopback, not
// a general web server.
//
// Routes:
//   GET  /health             liveness probe
//   GET  /events?session_id= server-sent events, filtered per session
//   POST /api/<method>       dispatch to the shared handler set

use super::{dispatch, error_envelope};
use crate::engine::state::DaemonState;
use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub async fn run_server(state: Arc<DaemonState>, port: u16) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    let actual = listener.local_addr()?;
    info!("[http] Listening on http://{actual}");

    loop {
        if state.shutdown.is_cancelled() {
            break;
        }
        // Accept with a timeout so the stop flag is checked regularly.
        let accept = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        match accept {
            Ok(Ok((stream, _peer))) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream).await {
                        warn!("[http] Connection error: {e}");
                    }
                });
            }
            Ok(Err(e)) => warn!("[http] Accept failed: {e}"),
            Err(_) => {} // timeout — loop to re-check shutdown
        }
    }
    info!("[http] Server stopped");
    Ok(())
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .next()
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Ok(None);
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(Some(Request { method, path, body }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_json(
    stream: &mut TcpStream,
    status: u16,
    body: &serde_json::Value,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await
}

async fn handle_connection(state: Arc<DaemonState>, mut stream: TcpStream) -> std::io::Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", path) if path == "/health" || path.starts_with("/health?") => {
            write_json(&mut stream, 200, &serde_json::json!({"ok": true})).await
        }
        ("GET", path) if path.starts_with("/events") => {
            serve_events(state, stream, path).await
        }
        ("POST", path) if path.starts_with("/api/") => {
            let method = path.trim_start_matches("/api/").to_string();
            let params: serde_json::Value = if request.body.is_empty() {
                serde_json::json!({})
            } else {
                match serde_json::from_slice(&request.body) {
                    Ok(v) => v,
                    Err(e) => {
                        let err = crate::atoms::error::DaemonError::Validation(format!(
                            "invalid JSON body: {e}"
                        ));
                        return write_json(&mut stream, 400, &error_envelope(&err)).await;
                    }
                }
            };
            match dispatch(&state, &method, params).await {
                Ok(result) => write_json(&mut stream, 200, &result).await,
                Err(err) => {
                    write_json(&mut stream, err.http_status(), &error_envelope(&err)).await
                }
            }
        }
        _ => {
            let err = crate::atoms::error::DaemonError::Validation(format!(
                "no route for {} {}",
                request.method, request.path
            ));
            write_json(&mut stream, 404, &error_envelope(&err)).await
        }
    }
}

fn query_param(path: &str, key: &str) -> Option<String> {
    let query = path.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Server-sent event stream, optionally filtered to one session's events
/// (events without a session id are always delivered).
async fn serve_events(
    state: Arc<DaemonState>,
    mut stream: TcpStream,
    path: &str,
) -> std::io::Result<()> {
    let session_filter = query_param(path, "session_id").and_then(|v| v.parse::<i64>().ok());
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n";
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            event = events.recv() => {
                let event = match event {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                if let (Some(filter), Some(event_session)) = (session_filter, event.session_id()) {
                    if filter != event_session {
                        continue;
                    }
                }
                let payload = serde_json::to_string(&event).unwrap_or_default();
                let frame = format!("data: {payload}\n\n");
                if stream.write_all(frame.as_bytes()).await.is_err() {
                    break; // client went away
                }
                let _ = stream.flush().await;
            }
        }
    }
    Ok(())
}

/// Wait for in-flight handlers to finish, bounded by the drain budget.
pub async fn drain_inflight(state: &Arc<DaemonState>, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    while state.inflight_handlers.load(Ordering::SeqCst) > 0
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    async fn start_test_server(state: Arc<DaemonState>) -> u16 {
        // Bind on an ephemeral port, then run the accept loop directly.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                if accept_state.shutdown.is_cancelled() {
                    break;
                }
                if let Ok(Ok((stream, _))) =
                    tokio::time::timeout(Duration::from_secs(1), listener.accept()).await
                {
                    let s = accept_state.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(s, stream).await;
                    });
                }
            }
        });
        port
    }

    async fn raw_request(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let state = Arc::new(DaemonState::for_testing());
        let port = start_test_server(state.clone()).await;

        let ok = raw_request(port, "GET /health HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(ok.starts_with("HTTP/1.1 200"));
        assert!(ok.contains("\"ok\":true"));

        let missing = raw_request(port, "GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404"));
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn api_dispatch_and_error_mapping() {
        let state = Arc::new(DaemonState::for_testing());
        let port = start_test_server(state.clone()).await;

        let body = r#"{"task_type": "embedding", "content": "hi", "priority": "high"}"#;
        let request = format!(
            "POST /api/enqueue_task HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let response = raw_request(port, &request).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("task_id"));

        // Validation errors map to 400 with the error envelope.
        let bad = "POST /api/enqueue_task HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}";
        let response = raw_request(port, bad).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
        assert!(response.contains("\"retryable\":false"));
        state.shutdown.cancel();
    }

    #[test]
    fn query_params_parse() {
        assert_eq!(query_param("/events?session_id=42", "session_id").as_deref(), Some("42"));
        assert_eq!(query_param("/events?a=1&session_id=7", "session_id").as_deref(), Some("7"));
        assert_eq!(query_param("/events", "session_id"), None);
    }
}
