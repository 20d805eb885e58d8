use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::AddressRequiredSnafu;
use crate::ConnectFailedSnafu;
use crate::ConnectTimedOutSnafu;
use crate::DeadlineExceededSnafu;
use crate::Error;
use crate::PROTOCOL_VERSION;
use crate::RPCEnvelope;
use crate::RPCStatus;
use crate::RecvFailedSnafu;
use crate::Result;
use crate::StatusCode;
use crate::WriteFrameSnafu;
use crate::encode_frame;
use crate::read_frame;
use crate::write_raw_frame;
use snafu::prelude::*;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const OUTBOUND_QUEUE_LEN: usize = 64;
const CONNECTION_CLOSED: &str = "connection closed";

type CallOutcome = std::result::Result<Vec<u8>, RPCStatus>;
type PendingRequestsMap = Arc<Mutex<PendingRequests>>;

#[derive(Default)]
struct PendingRequests {
    calls: HashMap<u64, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

impl PendingRequests {
    /// Refuses new calls and fails every call still waiting for a reply.
    fn close(&mut self, reason: &str) {
        self.closed = true;
        if !self.calls.is_empty() {
            tracing::info!("Cleaning up {} pending requests", self.calls.len());
        }
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(RPCStatus::new(StatusCode::Unavailable, reason)));
        }
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// A connection to one RPC server.
///
/// Calls are multiplexed over the connection and matched to responses by
/// sequence number. Frames are written by a dedicated task, so a call whose
/// deadline passes never leaves half a frame on the wire. Dropping the client
/// stops both connection tasks and closes the socket.
pub struct RPCClient {
    address: String,
    outbound: mpsc::Sender<Outbound>,
    pub(crate) next_sequence_number: Mutex<u64>,
    pending_requests: PendingRequestsMap,
    timeout: Option<Duration>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
pub struct RPCClientBuilder {
    address: Option<String>,
    timeout: Option<Duration>,
}

impl RPCClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: String) -> Self {
        self.address = Some(address);
        self
    }

    /// Bounds connection establishment and every call made through the client.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn build(self) -> Result<Arc<RPCClient>> {
        let address = self.address.context(AddressRequiredSnafu)?;
        tracing::info!("Attempting to connect to server at {}", address);
        let connect = TcpStream::connect(address.as_str());
        let stream = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .context(ConnectTimedOutSnafu {
                    address: address.as_str(),
                    timeout,
                })?,
            None => connect.await,
        }
        .context(ConnectFailedSnafu {
            address: address.as_str(),
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }
        tracing::info!("Successfully connected to server at {}", address);

        let (read_half, write_half) = tokio::io::split(stream);
        let pending_requests: PendingRequestsMap = Arc::default();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let reader = tokio::spawn(read_loop(read_half, pending_requests.clone()));
        let writer = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            pending_requests.clone(),
        ));

        Ok(Arc::new(RPCClient {
            address,
            outbound,
            next_sequence_number: Mutex::new(1),
            pending_requests,
            timeout: self.timeout,
            reader,
            writer,
        }))
    }
}

impl RPCClient {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sends one request and waits for its response.
    ///
    /// Fails with an `Unavailable` status once the connection has ended.
    /// When the client has a timeout, only the wait is cut short; a frame that
    /// was already queued is still written in full.
    pub async fn call(&self, service: &str, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let sequence_number = {
            let mut n = self.next_sequence_number.lock().await;
            let result = *n;
            *n += 1;
            result
        };
        tracing::info!(
            "Calling RPC: service={}, method={}, seq={}, payload_size={}",
            service,
            method,
            sequence_number,
            payload.len()
        );
        let frame = encode_frame(&RPCEnvelope {
            version: PROTOCOL_VERSION,
            sequence_number,
            service_name: service.to_string(),
            method_name: method.to_string(),
            status: None,
            payload,
        })?;

        let (tx, rx) = oneshot::channel::<CallOutcome>();
        {
            let mut pending = self.pending_requests.lock().await;
            if pending.closed {
                tracing::warn!("Call seq={} refused: {}", sequence_number, CONNECTION_CLOSED);
                return Err(Error::Status {
                    code: StatusCode::Unavailable,
                    message: CONNECTION_CLOSED.to_string(),
                });
            }
            pending.calls.insert(sequence_number, tx);
        }

        let exchange = async {
            if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
                return Ok(Err(RPCStatus::new(
                    StatusCode::Unavailable,
                    CONNECTION_CLOSED,
                )));
            }
            tracing::info!("Request queued: seq={}", sequence_number);
            rx.await.context(RecvFailedSnafu)
        };
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .context(DeadlineExceededSnafu {
                    sequence_number,
                    timeout,
                })
                .and_then(|outcome| outcome),
            None => exchange.await,
        };

        match outcome {
            Ok(Ok(result)) => {
                tracing::info!(
                    "Response received: seq={}, response_size={}",
                    sequence_number,
                    result.len()
                );
                Ok(result)
            }
            Ok(Err(status)) => {
                self.forget(sequence_number).await;
                Err(Error::Status {
                    code: status.code,
                    message: status.message,
                })
            }
            Err(e) => {
                self.forget(sequence_number).await;
                tracing::warn!("Call seq={} failed: {}", sequence_number, e);
                Err(e)
            }
        }
    }

    async fn forget(&self, sequence_number: u64) {
        self.pending_requests
            .lock()
            .await
            .calls
            .remove(&sequence_number);
    }

    /// Closes the sending side of the connection after every queued frame is
    /// written. Calls made afterwards fail with `Unavailable`.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::debug!("Closing connection to {}", self.address);
        let (done_tx, done_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Shutdown(done_tx)).await.is_err() {
            // The writer already stopped, so the sending side is gone.
            return Ok(());
        }
        done_rx.await.unwrap_or(Ok(()))
    }

    pub async fn pending_calls(&self) -> usize {
        self.pending_requests.lock().await.calls.len()
    }
}

impl Drop for RPCClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop(
    mut write_half: WriteHalf<TcpStream>,
    mut outbound: mpsc::Receiver<Outbound>,
    pending_requests: PendingRequestsMap,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if let Err(e) = write_raw_frame(&mut write_half, &frame).await {
                    tracing::info!("Write loop ending: {}", e);
                    pending_requests.lock().await.close(CONNECTION_CLOSED);
                    return;
                }
            }
            Outbound::Shutdown(done) => {
                pending_requests.lock().await.closed = true;
                let _ = done.send(write_half.shutdown().await.context(WriteFrameSnafu));
                return;
            }
        }
    }
}

async fn read_loop(mut read_half: ReadHalf<TcpStream>, pending_requests: PendingRequestsMap) {
    tracing::debug!("Starting client read loop");
    loop {
        let envelope = match read_frame(&mut read_half).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::info!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::info!("Read loop ending: {}", e);
                break;
            }
        };
        let sequence_number = envelope.sequence_number;
        tracing::debug!(
            "Received response frame: seq={}, service={}, method={}",
            sequence_number,
            envelope.service_name,
            envelope.method_name
        );
        let tx = pending_requests.lock().await.calls.remove(&sequence_number);
        match tx {
            Some(tx) => {
                let outcome = match envelope.status {
                    Some(status) if status.code != StatusCode::Ok => Err(status),
                    _ => Ok(envelope.payload),
                };
                // The caller may already have given up on this call.
                let _ = tx.send(outcome);
            }
            None => tracing::info!("No pending request found for seq={}", sequence_number),
        }
    }

    pending_requests.lock().await.close(CONNECTION_CLOSED);
}
