//! NDJSON wire protocol between master and workers.
//!
//! Framing is one JSON object per line. Session flow:
//!
//! 1. Worker connects and sends an `auth` message.
//! 2. Master answers `auth_ok` or `auth_err` (a single generic rejection;
//!    unknown user and bad password are indistinguishable).
//! 3. After `auth_ok` the master drives the session with `req` frames; the
//!    worker answers each with a `resp` frame carrying the same `seq`.
//!
//! The encoding itself carries no contract beyond this file; only the
//! operation semantics in [`crate::connection`] matter to the rest of the
//! master.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, InfoCell, WorkerInfo};

/// Transport and remote-invocation errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The transport closed before or during the operation.
    #[error("connection lost")]
    ConnectionLost,

    /// The worker answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// A frame could not be encoded or decoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frames sent by the worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame of a session.
    Auth { username: String, password: String },

    /// Answer to a master request.
    Resp {
        seq: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frames sent by the master.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterFrame {
    AuthOk,
    AuthErr,
    Req {
        seq: u64,
        #[serde(flatten)]
        op: RequestOp,
    },
}

/// Remote operations the master may request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum RequestOp {
    Print { message: String },
    GetWorkerInfo,
    SetBuilderList { builders: Vec<String> },
    StartBuild { builder: String },
    StartCommand {
        command_id: String,
        name: String,
        args: serde_json::Value,
    },
    InterruptCommand { command_id: String, why: String },
    Shutdown,
}

/// An authenticated inbound session, handed to a connection factory. The
/// buffered reader is carried over from the auth exchange so frames a worker
/// pipelined behind its auth line are not lost.
pub struct WireSession {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub peer: SocketAddr,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, ProtocolError>>>>;

/// [`Connection`] over a TCP session speaking the NDJSON protocol.
pub struct TcpConnection {
    worker_name: String,
    peer: SocketAddr,
    seq: AtomicU64,
    pending: PendingMap,
    outbound: mpsc::Sender<String>,
    disconnect_tx: watch::Sender<bool>,
    info: InfoCell,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpConnection {
    /// Take ownership of an authenticated session and spawn its reader and
    /// writer tasks.
    pub fn spawn(session: WireSession, worker_name: String) -> Arc<Self> {
        let WireSession {
            reader,
            writer,
            peer,
        } = session;
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
        let (disconnect_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            worker_name,
            peer,
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            disconnect_tx,
            info: InfoCell::default(),
            tasks: Mutex::new(Vec::new()),
        });

        let reader_task = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.read_loop(reader).await }
        });
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        conn.tasks.lock().unwrap().extend([reader_task, writer_task]);

        conn
    }

    async fn read_loop(self: Arc<Self>, reader: BufReader<OwnedReadHalf>) {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<WorkerFrame>(&line) {
                    Ok(WorkerFrame::Resp {
                        seq,
                        ok,
                        result,
                        error,
                    }) => {
                        let slot = self.pending.lock().unwrap().remove(&seq);
                        let Some(slot) = slot else {
                            trace!(
                                worker = %self.worker_name,
                                seq,
                                "response for unknown or timed-out request"
                            );
                            continue;
                        };
                        let outcome = if ok {
                            Ok(result.unwrap_or(serde_json::Value::Null))
                        } else {
                            Err(ProtocolError::Remote(
                                error.unwrap_or_else(|| "unspecified".to_string()),
                            ))
                        };
                        let _ = slot.send(outcome);
                    }
                    Ok(WorkerFrame::Auth { .. }) => {
                        warn!(worker = %self.worker_name, "unexpected auth frame mid-session");
                    }
                    Err(e) => {
                        warn!(worker = %self.worker_name, error = %e, "undecodable frame, dropping connection");
                        break;
                    }
                },
                Ok(None) => {
                    debug!(worker = %self.worker_name, peer = %self.peer, "worker closed connection");
                    break;
                }
                Err(e) => {
                    debug!(worker = %self.worker_name, error = %e, "read error, dropping connection");
                    break;
                }
            }
        }
        self.mark_disconnected();
    }

    /// Fire the disconnect edge once and fail everything still pending.
    fn mark_disconnected(&self) {
        let newly = self.disconnect_tx.send_if_modified(|lost| {
            if *lost {
                false
            } else {
                *lost = true;
                true
            }
        });
        if newly {
            let pending: Vec<_> = {
                let mut pending = self.pending.lock().unwrap();
                pending.drain().collect()
            };
            for (_, slot) in pending {
                let _ = slot.send(Err(ProtocolError::ConnectionLost));
            }
        }
    }

    async fn request(&self, op: RequestOp) -> Result<serde_json::Value, ProtocolError> {
        if *self.disconnect_tx.borrow() {
            return Err(ProtocolError::ConnectionLost);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&MasterFrame::Req { seq, op })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, tx);

        // The disconnect edge may have fired between the check above and the
        // insert; re-check so the slot cannot outlive the drain.
        if *self.disconnect_tx.borrow() {
            self.pending.lock().unwrap().remove(&seq);
            return Err(ProtocolError::ConnectionLost);
        }

        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().unwrap().remove(&seq);
            return Err(ProtocolError::ConnectionLost);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::ConnectionLost),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn worker_name(&self) -> &str {
        &self.worker_name
    }

    async fn remote_print(&self, message: &str) -> Result<(), ProtocolError> {
        self.request(RequestOp::Print {
            message: message.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn remote_get_worker_info(&self) -> Result<WorkerInfo, ProtocolError> {
        let value = self.request(RequestOp::GetWorkerInfo).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn remote_set_builder_list(&self, builders: Vec<String>) -> Result<(), ProtocolError> {
        self.request(RequestOp::SetBuilderList { builders })
            .await
            .map(|_| ())
    }

    async fn remote_start_build(&self, builder: &str) -> Result<(), ProtocolError> {
        self.request(RequestOp::StartBuild {
            builder: builder.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn remote_start_command(
        &self,
        command_id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        self.request(RequestOp::StartCommand {
            command_id: command_id.to_string(),
            name: name.to_string(),
            args,
        })
        .await
        .map(|_| ())
    }

    async fn remote_interrupt_command(
        &self,
        command_id: &str,
        why: &str,
    ) -> Result<(), ProtocolError> {
        self.request(RequestOp::InterruptCommand {
            command_id: command_id.to_string(),
            why: why.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn remote_shutdown(&self) -> Result<(), ProtocolError> {
        self.request(RequestOp::Shutdown).await.map(|_| ())
    }

    async fn lose_connection(&self) {
        debug!(worker = %self.worker_name, peer = %self.peer, "terminating connection");
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.mark_disconnected();
    }

    fn subscribe_disconnect(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }

    fn set_info(&self, info: WorkerInfo) {
        self.info.set(info);
    }

    fn info(&self) -> Option<WorkerInfo> {
        self.info.get()
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<String>) {
    while let Some(frame) = outbound.recv().await {
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Serialize a frame and append the newline delimiter.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}
