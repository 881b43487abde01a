//! Client side of the control socket, used by the CLI and by tests.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::control::protocol::{
    Request, RequestData, Response, StatusResponse, REQ_GROUP_DISABLE, REQ_GROUP_ENABLE, REQ_PING,
    REQ_RELOAD_CONFIG, REQ_STATUS, REQ_STOP, REQ_TUNNEL_DOWN, REQ_TUNNEL_UP,
};
use crate::error::{BoreError, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send one request and read the response.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| BoreError::DialTimeout(self.socket_path.display().to_string()))?
            .map_err(|e| {
                BoreError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to connect to daemon: {}", e),
                ))
            })?;

        tokio::time::timeout(EXCHANGE_TIMEOUT, Self::exchange(stream, request))
            .await
            .map_err(|_| BoreError::DialTimeout("control exchange".to_string()))?
    }

    async fn exchange(stream: UnixStream, request: Request) -> Result<Response> {
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(serde_json::from_str(&line)?)
    }

    fn expect_success(response: Response) -> Result<()> {
        if response.success {
            Ok(())
        } else {
            Err(BoreError::InvalidRequest(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let response = self
            .send(Request {
                kind: REQ_PING.into(),
                data: None,
            })
            .await?;
        Self::expect_success(response)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let response = self
            .send(Request {
                kind: REQ_STATUS.into(),
                data: None,
            })
            .await?;
        if !response.success {
            return Err(BoreError::InvalidRequest(
                response.error.unwrap_or_else(|| "status failed".to_string()),
            ));
        }
        let data = response
            .data
            .ok_or_else(|| BoreError::InvalidRequest("status response missing data".to_string()))?;
        Ok(serde_json::from_value(data)?)
    }

    /// The daemon exits shortly after acknowledging; a dropped connection
    /// counts as success.
    pub async fn stop(&self) -> Result<()> {
        match self
            .send(Request {
                kind: REQ_STOP.into(),
                data: None,
            })
            .await
        {
            Ok(response) => Self::expect_success(response),
            Err(BoreError::Io(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn tunnel_up(&self, name: &str, host: &str) -> Result<()> {
        let response = self
            .send(Request {
                kind: REQ_TUNNEL_UP.into(),
                data: Some(RequestData {
                    name: name.to_string(),
                    host: Some(host.to_string()),
                }),
            })
            .await?;
        Self::expect_success(response)
    }

    pub async fn tunnel_down(&self, name: &str) -> Result<()> {
        let response = self
            .send(Request {
                kind: REQ_TUNNEL_DOWN.into(),
                data: Some(RequestData {
                    name: name.to_string(),
                    host: None,
                }),
            })
            .await?;
        Self::expect_success(response)
    }

    pub async fn group_enable(&self, name: &str, host: &str) -> Result<()> {
        let response = self
            .send(Request {
                kind: REQ_GROUP_ENABLE.into(),
                data: Some(RequestData {
                    name: name.to_string(),
                    host: Some(host.to_string()),
                }),
            })
            .await?;
        Self::expect_success(response)
    }

    pub async fn group_disable(&self, name: &str) -> Result<()> {
        let response = self
            .send(Request {
                kind: REQ_GROUP_DISABLE.into(),
                data: Some(RequestData {
                    name: name.to_string(),
                    host: None,
                }),
            })
            .await?;
        Self::expect_success(response)
    }

    pub async fn reload_config(&self) -> Result<()> {
        let response = self
            .send(Request {
                kind: REQ_RELOAD_CONFIG.into(),
                data: None,
            })
            .await?;
        Self::expect_success(response)
    }

    /// Whether a daemon is answering on the socket.
    pub async fn is_daemon_running(&self) -> bool {
        self.ping().await.is_ok()
    }
}
