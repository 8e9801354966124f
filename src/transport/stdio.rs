//! Line-delimited stdio transport.
//!
//! One complete JSON-RPC message per line on stdin/stdout; logging stays on
//! stderr. Inbound lines multiplex client requests, notifications, and
//! responses to server-initiated requests (no `method`, matching `s-` id).
//! Messages are handled concurrently so a tool awaiting a sampling response
//! never blocks the read loop that must deliver it.

use std::io;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::context::Outbound;
use crate::error::ErrorData;
use crate::model::ServerMessage;
use crate::protocol::{ProtocolHandler, MAX_BODY_BYTES};
use crate::session::SessionId;

const WRITE_CHANNEL_CAPACITY: usize = 64;
// Large enough to buffer sizeable tool calls in one read.
const READ_BUFFER_CAPACITY: usize = 2 * 1024 * 1024;

pub struct StdioTransport<R, W> {
    protocol: Arc<ProtocolHandler>,
    reader: R,
    writer: W,
}

impl StdioTransport<tokio::io::Stdin, tokio::io::Stdout> {
    pub fn new(protocol: Arc<ProtocolHandler>) -> Self {
        Self::with_io(protocol, tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Run over arbitrary byte streams; tests drive this with in-memory
    /// pipes.
    pub fn with_io(protocol: Arc<ProtocolHandler>, reader: R, writer: W) -> Self {
        Self {
            protocol,
            reader,
            writer,
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let Self {
            protocol,
            reader,
            mut writer,
        } = self;

        // Single writer task serializes every outbound line.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(WRITE_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            io::Result::Ok(())
        });

        // Server-initiated frames ride the same stdout as responses.
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(WRITE_CHANNEL_CAPACITY);
        {
            let line_tx = line_tx.clone();
            tokio::spawn(async move {
                while let Some(outbound) = out_rx.recv().await {
                    match serde_json::to_string(outbound.message()) {
                        Ok(line) => {
                            if line_tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to serialize outbound frame");
                        }
                    }
                }
            });
        }

        // One logical session per stdio connection, created at initialize.
        let session: Arc<Mutex<Option<SessionId>>> = Arc::new(Mutex::new(None));

        let mut lines = BufReader::with_capacity(READ_BUFFER_CAPACITY, reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_owned();
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_BODY_BYTES {
                send_error_line(&line_tx, ErrorData::invalid_request("Request body too large"))
                    .await;
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(error) => {
                    tracing::debug!(%error, "invalid JSON on stdin");
                    send_error_line(
                        &line_tx,
                        ErrorData::parse_error(format!("Parse error: {error}")),
                    )
                    .await;
                    continue;
                }
            };

            let protocol = protocol.clone();
            let session = session.clone();
            let line_tx = line_tx.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let current = session.lock().unwrap().clone();
                let handled = protocol
                    .handle_value(value, current, None, Some(out_tx.clone()))
                    .await;
                if let Some(created) = handled.new_session {
                    // Wire the push sink so fan-out notifications reach
                    // stdout too.
                    let _ = protocol.channel(&created).set_push(out_tx.clone());
                    *session.lock().unwrap() = Some(created);
                }
                if let Some(reply) = handled.reply {
                    match serde_json::to_string(&reply) {
                        Ok(line) => {
                            let _ = line_tx.send(line).await;
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to serialize reply");
                        }
                    }
                }
            });
        }

        // EOF: stop feeding the writer and let in-flight work drain.
        drop(line_tx);
        drop(out_tx);
        writer_task
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }
}

async fn send_error_line(line_tx: &mpsc::Sender<String>, error: ErrorData) {
    let message = ServerMessage::error(None, error);
    if let Ok(line) = serde_json::to_string(&message) {
        let _ = line_tx.send(line).await;
    }
}
