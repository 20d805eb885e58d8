use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod client;
pub mod server;

pub use agentrpc_codegen::rpc_gen;
#[doc(hidden)]
pub use async_trait::async_trait;
#[doc(hidden)]
pub use serde;

/// Version stamped on every envelope. Requests carrying any other value are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single encoded envelope.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to bind to address {}: {}", address, source))]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to accept connection: {}", source))]
    AcceptFailed { source: std::io::Error },

    #[snafu(display("Client address is required"))]
    AddressRequired,

    #[snafu(display("Failed to connect to {}: {}", address, source))]
    ConnectFailed {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Timed out after {:?} connecting to {}", timeout, address))]
    ConnectTimedOut {
        address: String,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
    },

    #[snafu(display("Failed to read frame: {}", source))]
    ReadFrame { source: std::io::Error },

    #[snafu(display("Failed to write frame: {}", source))]
    WriteFrame { source: std::io::Error },

    #[snafu(display("Frame of {} bytes exceeds the {} byte limit", len, max))]
    FrameTooLarge { len: usize, max: usize },

    #[snafu(display("Failed to serialize: {}", source))]
    SerializeFailed { source: bincode::Error },

    #[snafu(display("Failed to deserialize: {}", source))]
    DeserializeFailed { source: bincode::Error },

    #[snafu(display("Response channel closed before a reply arrived: {}", source))]
    RecvFailed {
        source: tokio::sync::oneshot::error::RecvError,
    },

    #[snafu(display("Call seq={} exceeded its {:?} deadline", sequence_number, timeout))]
    DeadlineExceeded {
        sequence_number: u64,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
    },

    #[snafu(display("Remote call failed with {:?}: {}", code, message))]
    Status { code: StatusCode, message: String },

    #[snafu(display("Service call failed: {}", message))]
    Service { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RPCStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RPCStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

/// One request or response on the wire.
///
/// A response echoes the `sequence_number`, `service_name` and `method_name` of
/// the request it answers. `status` is `None` on requests and on successful
/// responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RPCEnvelope {
    pub version: u8,
    pub sequence_number: u64,
    pub service_name: String,
    pub method_name: String,
    pub status: Option<RPCStatus>,
    pub payload: Vec<u8>,
}

type ServiceName = String;
type MethodName = String;

pub fn encode_payload<T: Serialize>(value: T) -> Result<Vec<u8>> {
    bincode::serialize(&value).context(SerializeFailedSnafu)
}

pub fn decode_payload<T: DeserializeOwned>(payload: Vec<u8>) -> Result<T> {
    bincode::deserialize(&payload).context(DeserializeFailedSnafu)
}

/// Encodes `envelope` as one buffer: a 4-byte big-endian length followed by
/// its bincode encoding.
pub fn encode_frame(envelope: &RPCEnvelope) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; 4];
    bincode::serialize_into(&mut frame, envelope).context(SerializeFailedSnafu)?;
    let len = frame.len() - 4;
    ensure!(
        len <= MAX_FRAME_LEN,
        FrameTooLargeSnafu {
            len,
            max: MAX_FRAME_LEN,
        }
    );
    frame[..4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(frame)
}

/// Writes an already encoded frame with a single `write_all`.
pub async fn write_raw_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await.context(WriteFrameSnafu)?;
    writer.flush().await.context(WriteFrameSnafu)
}

pub async fn write_frame<W>(writer: &mut W, envelope: &RPCEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    write_raw_frame(writer, &frame).await
}

/// Reads one length-prefixed frame. Returns `None` when the peer closed the
/// stream at a frame boundary.
pub async fn read_raw_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context(ReadFrameSnafu),
    }
    let len = u32::from_be_bytes(header) as usize;
    ensure!(
        len <= MAX_FRAME_LEN,
        FrameTooLargeSnafu {
            len,
            max: MAX_FRAME_LEN,
        }
    );
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await.context(ReadFrameSnafu)?;
    Ok(Some(frame))
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Option<RPCEnvelope>>
where
    R: AsyncRead + Unpin,
{
    match read_raw_frame(reader).await? {
        Some(frame) => Ok(Some(
            bincode::deserialize(&frame).context(DeserializeFailedSnafu)?,
        )),
        None => Ok(None),
    }
}
