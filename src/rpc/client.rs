//! Client used by the CLI subcommands to talk to a running daemon.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::core::{JobSnapshot, NewTarget, StartOutcome, StatusReport, Target, TargetId};

use super::methods::{CancelResult, DaemonStatus};
use super::protocol::{Request, Response, RpcError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to daemon at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode request: {0}")]
    Serialize(serde_json::Error),

    #[error("failed to parse response: {0}")]
    Parse(serde_json::Error),

    #[error("daemon closed the connection")]
    Closed,

    #[error("{} (code {})", .0.message, .0.code)]
    Rpc(RpcError),
}

impl ClientError {
    /// The JSON-RPC error code, when the daemon answered with an error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

pub struct RpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
        }
    }

    /// Send one request on a fresh connection and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr,
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(method, params, id);
        let mut line = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        line.push('\n');

        let (reader, mut writer) = stream.into_split();
        writer.write_all(line.as_bytes()).await?;

        let mut reader = BufReader::new(reader);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line).await? == 0 {
            return Err(ClientError::Closed);
        }

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(ClientError::Parse)
    }

    pub async fn daemon_status(&self) -> Result<DaemonStatus, ClientError> {
        self.call("daemon.status", None).await
    }

    pub async fn start(&self, target_id: TargetId) -> Result<StartOutcome, ClientError> {
        self.call("crawl.start", Some(json!({ "target_id": target_id })))
            .await
    }

    pub async fn cancel(&self, target_id: TargetId) -> Result<CancelResult, ClientError> {
        self.call("crawl.cancel", Some(json!({ "target_id": target_id })))
            .await
    }

    pub async fn status(
        &self,
        target_id: TargetId,
        lines: Option<usize>,
    ) -> Result<StatusReport, ClientError> {
        self.call(
            "crawl.status",
            Some(json!({ "target_id": target_id, "lines": lines })),
        )
        .await
    }

    pub async fn active(&self, lines: usize) -> Result<Vec<JobSnapshot>, ClientError> {
        self.call("crawl.active", Some(json!({ "lines": lines })))
            .await
    }

    pub async fn reset(&self, target_id: TargetId) -> Result<StartOutcome, ClientError> {
        self.call("crawl.reset", Some(json!({ "target_id": target_id })))
            .await
    }

    pub async fn add_target(&self, new: &NewTarget) -> Result<Target, ClientError> {
        let params = serde_json::to_value(new).map_err(ClientError::Serialize)?;
        self.call("targets.add", Some(params)).await
    }
}
