//! IPC client for communicating with the crawl daemon.

use crate::{IpcError, Request, Response, ResponseData};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Request/response timeout; queries can return large listings
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// IPC client for communicating with the crawl daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a client for the given socket path
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Connect to the daemon and return a connected client
    pub async fn connect(&self) -> Result<ConnectedClient, IpcError> {
        if !self.socket_path.exists() {
            return Err(IpcError::DaemonNotRunning);
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| IpcError::ConnectionFailed("Connection timed out".to_string()))??;

        Ok(ConnectedClient { stream })
    }

    /// Send a fire-and-forget request (don't wait for response)
    pub async fn send_async(&self, request: &Request) -> Result<(), IpcError> {
        if !self.socket_path.exists() {
            return Err(IpcError::DaemonNotRunning);
        }

        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_bytes = rmp_serde::to_vec(request)?;
        let len_bytes = (request_bytes.len() as u32).to_le_bytes();

        stream.write_all(&len_bytes).await?;
        stream.write_all(&request_bytes).await?;

        // Don't wait for response
        Ok(())
    }

    /// Check if the daemon socket is present
    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send a request and wait for response (opens new connection)
    pub async fn request(&self, request: Request) -> Result<Response, IpcError> {
        let mut client = self.connect().await?;
        client.send(request).await
    }

    /// Run one crawl query against the daemon.
    pub async fn query(
        &self,
        root: &Path,
        since: Option<String>,
        extensions: Vec<String>,
        compute_hash: bool,
    ) -> Result<crate::QueryResult, IpcError> {
        let response = self
            .request(Request::Query {
                root: root.to_path_buf(),
                since,
                extensions,
                compute_hash,
            })
            .await?;

        match response {
            Response::Ok {
                data: Some(ResponseData::Query { result }),
            } => Ok(result),
            Response::Error { code, message } => Err(IpcError::Daemon { code, message }),
            _ => Err(IpcError::ConnectionFailed(
                "Unexpected response to query".to_string(),
            )),
        }
    }

    /// Get daemon status
    pub async fn get_status(&self) -> Result<ResponseData, IpcError> {
        let response = self.request(Request::Status).await?;

        match response {
            Response::Ok { data: Some(data) } => Ok(data),
            Response::Error { code, message } => Err(IpcError::Daemon { code, message }),
            _ => Err(IpcError::ConnectionFailed(
                "Unexpected response".to_string(),
            )),
        }
    }
}

/// A connected IPC client that can send requests and receive responses
pub struct ConnectedClient {
    stream: UnixStream,
}

impl ConnectedClient {
    /// Send a request and wait for response
    pub async fn send(&mut self, request: Request) -> Result<Response, IpcError> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.do_send(request))
            .await
            .map_err(|_| IpcError::ConnectionFailed("Request timed out".to_string()))?
    }

    async fn do_send(&mut self, request: Request) -> Result<Response, IpcError> {
        // Serialize request
        let request_bytes = rmp_serde::to_vec(&request)?;
        let len_bytes = (request_bytes.len() as u32).to_le_bytes();

        // Send request
        self.stream.write_all(&len_bytes).await?;
        self.stream.write_all(&request_bytes).await?;
        self.stream.flush().await?;

        // Read response length
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        // Read response body
        let mut response_buf = vec![0u8; len];
        self.stream.read_exact(&mut response_buf).await?;

        // Deserialize response
        let response: Response = rmp_serde::from_slice(&response_buf)?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCode, FileDelta, IpcServer, QueryResult, RequestHandler};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct TestHandler;

    #[async_trait]
    impl RequestHandler for TestHandler {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Ping => Response::ok_with(ResponseData::Pong { timestamp: 0 }),
                Request::Query { root, since, .. } => {
                    if root == PathBuf::from("/unwatched") {
                        return Response::error(ErrorCode::UnknownRoot, "not watched");
                    }
                    Response::ok_with(ResponseData::Query {
                        result: QueryResult {
                            clock: "c:1:1".to_string(),
                            is_fresh: since.is_none(),
                            files: vec![FileDelta {
                                path: PathBuf::from("Banana.js"),
                                exists: true,
                                mtime: 30,
                                size: 64,
                                hash: None,
                            }],
                        },
                    })
                }
                Request::Status => Response::ok_with(ResponseData::Status {
                    version: "test".to_string(),
                    uptime_secs: 0,
                    roots_watched: 0,
                    requests_total: 0,
                }),
                _ => Response::ack(),
            }
        }
    }

    async fn start_server(socket_path: &Path) {
        let handler = Arc::new(TestHandler);
        let server = IpcServer::new(socket_path, handler).await.unwrap();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_client_connect_no_daemon() {
        let client = IpcClient::new("/tmp/nonexistent_atlas_socket.sock");
        let result = client.connect().await;
        assert!(matches!(result, Err(IpcError::DaemonNotRunning)));
    }

    #[tokio::test]
    async fn test_client_is_daemon_running() {
        let client = IpcClient::new("/tmp/nonexistent_atlas_socket.sock");
        assert!(!client.is_daemon_running());
    }

    #[tokio::test]
    async fn test_client_connect_and_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        start_server(&socket_path).await;

        let client = IpcClient::new(&socket_path);
        let response = client.request(Request::Ping).await.unwrap();

        assert!(matches!(
            response,
            Response::Ok {
                data: Some(ResponseData::Pong { .. })
            }
        ));
    }

    #[tokio::test]
    async fn test_client_query() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        start_server(&socket_path).await;

        let client = IpcClient::new(&socket_path);
        let result = client
            .query(Path::new("/project/src"), None, vec!["js".to_string()], false)
            .await
            .unwrap();

        assert!(result.is_fresh);
        assert_eq!(result.clock, "c:1:1");
        assert_eq!(result.files.len(), 1);

        // With a checkpoint the scripted handler answers a delta.
        let result = client
            .query(
                Path::new("/project/src"),
                Some("c:1:1".to_string()),
                vec!["js".to_string()],
                false,
            )
            .await
            .unwrap();
        assert!(!result.is_fresh);
    }

    #[tokio::test]
    async fn test_client_query_unknown_root() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        start_server(&socket_path).await;

        let client = IpcClient::new(&socket_path);
        let result = client
            .query(Path::new("/unwatched"), None, vec![], false)
            .await;

        assert!(matches!(
            result,
            Err(IpcError::Daemon {
                code: ErrorCode::UnknownRoot,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_client_get_status() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        start_server(&socket_path).await;

        let client = IpcClient::new(&socket_path);
        let status = client.get_status().await.unwrap();

        assert!(matches!(status, ResponseData::Status { .. }));
    }

    #[tokio::test]
    async fn test_client_send_async_no_daemon() {
        let client = IpcClient::new("/tmp/nonexistent_atlas_socket.sock");
        let result = client.send_async(&Request::Shutdown).await;
        assert!(matches!(result, Err(IpcError::DaemonNotRunning)));
    }
}
