//! Unix socket IPC server side of the crawl daemon protocol.
//!
//! Handles incoming connections and dispatches requests to a handler.
//! The engine itself never runs this; daemon implementations and the
//! integration tests do.

use crate::{IpcError, Request, Response};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Maximum request size (4MB)
const MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

/// Timeout for reading one request off a connection
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Unix socket IPC server
pub struct IpcServer {
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
}

impl IpcServer {
    /// Create a new IPC server bound to the given socket path
    pub async fn new<P: AsRef<Path>>(
        socket_path: P,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, IpcError> {
        let socket_path = socket_path.as_ref();

        // Remove stale socket file if it exists
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }

        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;

        // Set socket permissions (user only - 0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!("IPC server listening on {}", socket_path.display());

        Ok(Self { listener, handler })
    }

    /// Run the server, accepting connections until the task is dropped
    pub async fn run(&self) -> Result<(), IpcError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, handler).await {
                            tracing::debug!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Handle a single connection
    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), IpcError> {
        // Read request with timeout to avoid holding the accept slot
        let request = tokio::time::timeout(READ_TIMEOUT, Self::read_request(&mut stream))
            .await
            .map_err(IpcError::Timeout)?;

        let request = match request {
            Ok(req) => req,
            Err(e) => {
                let response = Response::error(
                    crate::ErrorCode::InvalidRequest,
                    format!("Failed to parse request: {}", e),
                );
                Self::write_response(&mut stream, &response).await?;
                return Err(e);
            }
        };

        tracing::debug!("Received request: {:?}", request);

        let response = handler.handle(request).await;

        Self::write_response(&mut stream, &response).await?;

        Ok(())
    }

    /// Read a request from the stream
    async fn read_request(stream: &mut UnixStream) -> Result<Request, IpcError> {
        // Read length prefix (4 bytes, little-endian)
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_REQUEST_SIZE {
            return Err(IpcError::RequestTooLarge);
        }

        // Read request body
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        // Try MessagePack first, fall back to JSON for easier debugging
        if let Ok(request) = rmp_serde::from_slice(&buf) {
            return Ok(request);
        }

        // Try JSON as fallback (useful for testing with nc/socat)
        if let Ok(request) = serde_json::from_slice(&buf) {
            return Ok(request);
        }

        Err(IpcError::Deserialize(
            rmp_serde::from_slice::<Request>(&buf).unwrap_err(),
        ))
    }

    /// Write a response to the stream
    async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<(), IpcError> {
        let response_bytes = rmp_serde::to_vec(response)?;
        let len_bytes = (response_bytes.len() as u32).to_le_bytes();

        stream.write_all(&len_bytes).await?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        Ok(())
    }
}

/// Trait for handling incoming requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request and return a response
    async fn handle(&self, request: Request) -> Response;
}
