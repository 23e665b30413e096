// src/service/rpc.rs

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::service::protocol::{LifecycleReply, LifecycleRequest};
use crate::service::ServiceError;

/// Answers decoded requests
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request
    async fn handle(&self, request: LifecycleRequest) -> LifecycleReply;
}

/// Local socket listener serving lifecycle requests
pub struct RpcServer {
    /// Bound listener
    listener: UnixListener,

    /// Socket path, removed on shutdown
    socket_path: PathBuf,

    /// Longest the caller waits for a reply
    request_timeout: Option<Duration>,
}

impl RpcServer {
    /// Binds `socket_path`, replacing a stale socket left by a previous run
    pub fn bind(socket_path: &Path, request_timeout: Option<Duration>) -> Result<Self, ServiceError> {
        let socket_error = |error: io::Error| ServiceError::Socket {
            path: socket_path.display().to_string(),
            error: error.to_string(),
        };

        if let Ok(meta) = std::fs::symlink_metadata(socket_path) {
            if !meta.file_type().is_socket() {
                return Err(ServiceError::Socket {
                    path: socket_path.display().to_string(),
                    error: "path exists and is not a socket".to_string(),
                });
            }
            if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
                return Err(ServiceError::Socket {
                    path: socket_path.display().to_string(),
                    error: "another agent is already listening".to_string(),
                });
            }
            std::fs::remove_file(socket_path).map_err(socket_error)?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(socket_error)?;
        }

        let listener = UnixListener::bind(socket_path).map_err(socket_error)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).map_err(socket_error)?;

        info!(socket = %socket_path.display(), "RPC socket bound");

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            request_timeout,
        })
    }

    /// Socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until `shutdown` turns true, one task per connection
    pub async fn serve(self, handler: Arc<dyn RequestHandler>, mut shutdown: watch::Receiver<bool>) -> Result<(), ServiceError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = handler.clone();
                            let timeout = self.request_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, timeout).await {
                                    warn!("RPC connection ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept RPC connection: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), "Failed to remove RPC socket: {}", e);
            }
        }
        info!("RPC server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<LifecycleRequest>(&line) {
            Ok(request) => {
                debug!(method = %request.method, "RPC request received");
                dispatch(handler.clone(), request, timeout).await
            }
            Err(e) => LifecycleReply::failure(format!("Malformed request: {}", e)),
        };

        let mut payload = serde_json::to_vec(&reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    Ok(())
}

/// Runs the handler on its own task so a timed out caller never cancels a
/// half-finished volume operation
async fn dispatch(handler: Arc<dyn RequestHandler>, request: LifecycleRequest, timeout: Option<Duration>) -> LifecycleReply {
    let method = request.method;
    let task = tokio::spawn(async move { handler.handle(request).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(%method, "Request exceeded {:?}; it keeps running in the background", limit);
                return LifecycleReply::failure(format!("{} did not finish within {:?}", method, limit));
            }
        },
        None => task.await,
    };

    joined.unwrap_or_else(|e| {
        error!(%method, "Request handler failed: {}", e);
        LifecycleReply::failure(format!("{} handler failed", method))
    })
}

/// Sends one request to the daemon listening on `socket_path`
pub async fn call(socket_path: &Path, request: &LifecycleRequest) -> Result<LifecycleReply, ServiceError> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| ServiceError::Socket {
        path: socket_path.display().to_string(),
        error: e.to_string(),
    })?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_vec(request).map_err(|e| ServiceError::Protocol(e.to_string()))?;
    payload.push(b'\n');
    writer.write_all(&payload).await.map_err(|e| ServiceError::Io(e.to_string()))?;
    writer.shutdown().await.map_err(|e| ServiceError::Io(e.to_string()))?;

    let mut line = String::new();
    BufReader::new(reader)
        .read_line(&mut line)
        .await
        .map_err(|e| ServiceError::Io(e.to_string()))?;
    if line.trim().is_empty() {
        return Err(ServiceError::Protocol("Agent closed the connection without replying".to_string()));
    }

    serde_json::from_str(&line).map_err(|e| ServiceError::Protocol(e.to_string()))
}
