//! Newline-delimited JSON over TCP. One task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

/// Requests longer than this are answered with a parse error and the
/// connection is closed.
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, handler: MethodHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind RPC listener on {}", addr))?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Open connections are
    /// closed on their next read after shutdown.
    pub async fn listen(&self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        let handler = self.handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, handler, shutdown).await {
                                debug!(%peer, error = %e, "Connection error");
                            }
                            debug!(%peer, "Client disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<MethodHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = shutdown.cancelled() => break,
        };
        if read == 0 {
            break;
        }
        if line.len() > MAX_LINE_BYTES {
            warn!(%peer, bytes = line.len(), "Request too large");
            write_response(&mut writer, &Response::parse_error()).await?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                if let Err(msg) = request.validate() {
                    warn!(%peer, error = msg, "Invalid request");
                    Response::invalid_request(request.id.unwrap_or(serde_json::Value::Null))
                } else if request.is_notification() {
                    debug!(%peer, method = %request.method, "Notification received");
                    handler.handle(request).await;
                    continue;
                } else {
                    debug!(%peer, method = %request.method, "Request");
                    handler.handle(request).await
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "Parse error");
                Response::parse_error()
            }
        };

        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

async fn write_response(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    response: &Response,
) -> Result<()> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}
