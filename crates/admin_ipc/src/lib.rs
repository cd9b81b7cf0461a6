//! Line-delimited JSON control channel between `ratewatchd` and `ratewatchctl`.
//!
//! Each connection carries exactly one request line and one response line.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ratewatch.sock";
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "payload")]
pub enum AdminRequest {
    Status,
    /// Poll the publisher outside the schedule. The note, when present,
    /// replaces the default context line of the "no change" notification.
    PollNow { note: Option<String> },
}

/// What the daemon reports about its scheduler.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AdminStatus {
    pub run_id: String,
    pub phase: String,
    pub found_today: bool,
    pub found_early: bool,
    pub last_date_of_record: Option<String>,
    pub last_primary: Option<String>,
    /// RFC 3339 instant of the next scheduled wake.
    pub next_wake_at: Option<String>,
    pub pending_appends: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "payload")]
pub enum AdminResponse {
    Status(AdminStatus),
    Ack,
    Error(String),
}

/// Serves admin requests until `cancel` fires, then removes the socket file.
///
/// Handler errors and undecodable lines are answered with
/// [`AdminResponse::Error`]; the connection is never dropped silently.
pub async fn run_server<F>(socket_path: &str, cancel: CancellationToken, handler: F) -> Result<()>
where
    F: Fn(AdminRequest) -> Result<AdminResponse> + Send + Sync + 'static,
{
    clear_stale_socket(Path::new(socket_path))?;
    let listener = UnixListener::bind(socket_path)?;
    let handler = Arc::new(handler);
    info!(socket = socket_path, "admin ipc listening");

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?.0,
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, handler.as_ref()).await {
                warn!(error = ?err, "admin ipc connection failed");
            }
        });
    }

    drop(listener);
    if let Err(err) = std::fs::remove_file(socket_path) {
        debug!(error = ?err, socket = socket_path, "admin socket already gone");
    }
    info!(socket = socket_path, "admin ipc stopped");
    Ok(())
}

fn clear_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "removed stale admin socket");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn serve_connection<F>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(AdminRequest) -> Result<AdminResponse>,
{
    let (read_half, mut write_half) = stream.into_split();
    let Some(line) = read_line(read_half).await? else {
        return Ok(());
    };
    let resp = match serde_json::from_str::<AdminRequest>(&line) {
        Ok(req) => {
            debug!(request = ?req, "admin request");
            handler(req).unwrap_or_else(|err| AdminResponse::Error(err.to_string()))
        }
        Err(err) => AdminResponse::Error(format!("malformed request: {err}")),
    };
    write_half.write_all(encode_line(&resp)?.as_bytes()).await?;
    Ok(())
}

/// Sends one request and waits up to [`REPLY_TIMEOUT`] for the reply.
pub async fn send_request(socket_path: &str, req: &AdminRequest) -> Result<AdminResponse> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|err| anyhow!("cannot reach daemon at {socket_path}: {err}"))?;
    stream.write_all(encode_line(req)?.as_bytes()).await?;
    let (read_half, _) = stream.into_split();
    let line = tokio::time::timeout(REPLY_TIMEOUT, read_line(read_half))
        .await
        .map_err(|_| anyhow!("daemon did not reply within {REPLY_TIMEOUT:?}"))??
        .ok_or_else(|| anyhow!("daemon closed the connection without replying"))?;
    Ok(serde_json::from_str(&line)?)
}

async fn read_line<R>(reader: R) -> Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = String::new();
    if reader.read_line(&mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(buf.trim().to_string()))
}

fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)? + "\n")
}
