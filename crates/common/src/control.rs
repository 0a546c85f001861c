//! Control socket protocol
//!
//! Both daemons expose a Unix socket speaking line-delimited JSON: every
//! request is one line `{"cmd": ..., "id": ..., "args": {...}}`, every
//! response one line `{"id": ..., "result": ...}` or `{"id": ...,
//! "error": ...}`. Unknown commands answer `unknown-command`; arguments
//! that fail to deserialize answer `bad-args`. A malformed line never
//! kills the connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    pub id: Option<u64>,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, error: impl Into<String>) -> Self {
        Response {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown-command")]
    UnknownCommand,
    #[error("bad-args")]
    BadArgs,
    #[error("{0}")]
    Failed(String),
}

impl ControlError {
    pub fn failed(e: impl std::fmt::Display) -> Self {
        ControlError::Failed(e.to_string())
    }
}

/// Decode command arguments, mapping any shape mismatch to `bad-args`.
pub fn decode_args<T: DeserializeOwned>(args: Value) -> Result<T, ControlError> {
    serde_json::from_value(args).map_err(|_| ControlError::BadArgs)
}

/// What a daemon plugs into the socket loop.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, cmd: &str, args: Value) -> Result<Value, ControlError>;
}

/// Serve the control socket until the shutdown flag flips.
///
/// A stale socket file from a previous run is removed before binding.
pub async fn serve(
    socket_path: &Path,
    handler: Arc<dyn ControlHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("control socket listening on {}", socket_path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler, shutdown).await {
                        tracing::debug!("control connection closed: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn serve_connection(
    stream: UnixStream,
    handler: Arc<dyn ControlHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                use tracing::Instrument;
                let span =
                    tracing::debug_span!("control", cmd = %request.cmd, id = ?request.id);
                match handler
                    .handle(&request.cmd, request.args)
                    .instrument(span)
                    .await
                {
                    Ok(result) => Response::ok(request.id, result),
                    Err(e) => Response::err(request.id, e.to_string()),
                }
            }
            Err(_) => Response::err(None, ControlError::BadArgs.to_string()),
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
}

/// One-shot request helper used by tests and the daemons' own tooling.
pub async fn request(
    socket_path: &Path,
    cmd: &str,
    id: u64,
    args: Value,
) -> std::io::Result<Response> {
    let stream = UnixStream::connect(socket_path).await?;
    let (read_half, mut write_half) = stream.into_split();

    let request = Request {
        cmd: cmd.to_string(),
        id: Some(id),
        args,
    };
    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no response"))?;
    serde_json::from_str(&line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Socket path helper so both daemons place sockets the same way.
pub fn socket_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl ControlHandler for Echo {
        async fn handle(&self, cmd: &str, args: Value) -> Result<Value, ControlError> {
            match cmd {
                "echo" => Ok(args),
                "fail" => Err(ControlError::failed("boom")),
                _ => Err(ControlError::UnknownCommand),
            }
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("ctl.sock");
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn({
            let socket = socket.clone();
            async move { serve(&socket, Arc::new(Echo), rx).await }
        });

        // wait for the socket to appear
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = request(&socket, "echo", 1, json!({"x": 1})).await.unwrap();
        assert_eq!(response.id, Some(1));
        assert_eq!(response.result, Some(json!({"x": 1})));

        let response = request(&socket, "nope", 2, json!({})).await.unwrap();
        assert_eq!(response.error.as_deref(), Some("unknown-command"));

        let response = request(&socket, "fail", 3, json!({})).await.unwrap();
        assert_eq!(response.error.as_deref(), Some("boom"));

        tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
