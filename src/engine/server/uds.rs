// Unix-domain JSON-RPC channel used by hooks: line-delimited JSON, one
// request per line, low latency, no TLS. Each request is
// `{"id": …, "method": "…", "params": {…}}`; responses echo the id with
// either `result` or the shared error envelope under `error`.

use super::{dispatch, error_envelope};
use crate::engine::state::DaemonState;
use log::{info, warn};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub async fn run_server(state: Arc<DaemonState>, socket_path: &Path) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!("[uds] Listening on {:?}", socket_path);

    loop {
        if state.shutdown.is_cancelled() {
            break;
        }
        let accept = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        match accept {
            Ok(Ok((stream, _addr))) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream).await {
                        warn!("[uds] Connection error: {e}");
                    }
                });
            }
            Ok(Err(e)) => warn!("[uds] Accept failed: {e}"),
            Err(_) => {}
        }
    }
    info!("[uds] Server stopped");
    Ok(())
}

async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if state.shutdown.is_cancelled() {
            break;
        }
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&state, &line).await;
        let mut payload = serde_json::to_vec(&response).unwrap_or_default();
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
        write_half.flush().await?;
    }
    Ok(())
}

async fn handle_line(state: &Arc<DaemonState>, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return json!({
                "id": null,
                "error": {"code": "validation", "message": format!("invalid JSON: {e}"), "retryable": false},
            })
        }
    };
    let id = request["id"].clone();
    let Some(method) = request["method"].as_str() else {
        return json!({
            "id": id,
            "error": {"code": "validation", "message": "'method' is required", "retryable": false},
        });
    };
    let params = if request["params"].is_object() {
        request["params"].clone()
    } else {
        json!({})
    };

    match dispatch(state, method, params).await {
        Ok(result) => json!({"id": id, "result": result}),
        Err(err) => {
            let mut envelope = error_envelope(&err);
            envelope["id"] = id;
            envelope
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_protocol_round_trip() {
        let state = Arc::new(DaemonState::for_testing());
        let response = handle_line(
            &state,
            r#"{"id": 1, "method": "enqueue_task", "params": {"task_type": "embedding", "content": "x", "priority": "high"}}"#,
        )
        .await;
        assert_eq!(response["id"], 1);
        assert!(response["result"]["task_id"].is_i64());
    }

    #[tokio::test]
    async fn malformed_line_reports_validation() {
        let state = Arc::new(DaemonState::for_testing());
        let response = handle_line(&state, "not json").await;
        assert_eq!(response["error"]["code"], "validation");

        let no_method = handle_line(&state, r#"{"id": 2, "params": {}}"#).await;
        assert_eq!(no_method["id"], 2);
        assert_eq!(no_method["error"]["code"], "validation");
    }

    #[tokio::test]
    async fn errors_carry_id_and_envelope() {
        let state = Arc::new(DaemonState::for_testing());
        let response = handle_line(
            &state,
            r#"{"id": "abc", "method": "get_context", "params": {"session_id": 123456, "prompt": "hi"}}"#,
        )
        .await;
        assert_eq!(response["id"], "abc");
        assert_eq!(response["error"]["code"], "validation");
        assert_eq!(response["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let state = Arc::new(DaemonState::for_testing());

        let server_state = state.clone();
        let server_socket = socket.clone();
        tokio::spawn(async move {
            let _ = run_server(server_state, &server_socket).await;
        });

        // Wait for the socket to appear.
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"id\": 7, \"method\": \"health\", \"params\": {}}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"]["ok"], true);
        state.shutdown.cancel();
    }
}
