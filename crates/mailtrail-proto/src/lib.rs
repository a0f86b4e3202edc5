use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 4] = *b"MTRL";
pub const ACK: &[u8; 3] = b"OK\n";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FATAL: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Body is a [`QueueBatch`] JSON document.
    EventBatch,
    /// Body is a [`BatchResponse`] JSON document.
    BatchResult,
    /// Empty body, answered with [`ACK`].
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub kind: FrameKind,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

/// One delivery from the upstream queue. Only the id and the opaque body are
/// read; other transport attributes are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    pub body: String,
}

impl QueueMessage {
    pub fn new(
        message_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self { message_id: message_id.into(), body: body.into() }
    }
}

/// The unit of one pipeline invocation, in queue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBatch {
    #[serde(rename = "Records", alias = "records", default)]
    pub records: Vec<QueueMessage>,
}

impl QueueBatch {
    pub fn new(records: Vec<QueueMessage>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_item_failures: Vec<BatchItemFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResponse {
    pub fn ok() -> Self {
        Self { status_code: STATUS_OK, batch_item_failures: Vec::new(), error: None }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            status_code: STATUS_FATAL,
            batch_item_failures: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status_code: STATUS_BAD_REQUEST,
            batch_item_failures: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("invalid ack")]
    InvalidAck,
    #[error("header too large: {0} bytes")]
    HeaderTooLarge(u32),
    #[error("body too large: {0} bytes")]
    BodyTooLarge(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json encode error: {0}")]
    Encode(String),
    #[error("json decode error: {0}")]
    Decode(String),
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(value).map_err(|err| ProtoError::Encode(err.to_string()))
}

pub fn decode_header_json(bytes: &[u8]) -> Result<Header, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::Decode(format!("header: {err}")))
}

pub fn decode_batch_json(bytes: &[u8]) -> Result<QueueBatch, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::Decode(format!("batch: {err}")))
}

pub fn decode_response_json(bytes: &[u8]) -> Result<BatchResponse, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::Decode(format!("response: {err}")))
}

fn frame_lengths(
    header: &[u8],
    body: &[u8],
) -> Result<(u32, u64), ProtoError> {
    let header_len = u32::try_from(header.len())
        .map_err(|_| ProtoError::HeaderTooLarge(u32::MAX))?;
    let body_len = u64::try_from(body.len())
        .map_err(|_| ProtoError::BodyTooLarge(u64::MAX))?;
    Ok((header_len, body_len))
}

fn check_lengths(
    header_len: u32,
    body_len: u64,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(), ProtoError> {
    if header_len > max_header_len {
        return Err(ProtoError::HeaderTooLarge(header_len));
    }
    if body_len > max_body_len {
        return Err(ProtoError::BodyTooLarge(body_len));
    }
    Ok(())
}

pub fn write_frame_sync<W: Write>(
    writer: &mut W,
    header: &[u8],
    body: &[u8],
) -> Result<(), ProtoError> {
    let (header_len, body_len) = frame_lengths(header, body)?;

    writer.write_all(&MAGIC)?;
    writer.write_all(&header_len.to_be_bytes())?;
    writer.write_all(&body_len.to_be_bytes())?;
    writer.write_all(header)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame_sync<R: Read>(
    reader: &mut R,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(Vec<u8>, Vec<u8>), ProtoError> {
    let mut magic = [0_u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic);
    }

    let mut header_len_buf = [0_u8; 4];
    reader.read_exact(&mut header_len_buf)?;
    let mut body_len_buf = [0_u8; 8];
    reader.read_exact(&mut body_len_buf)?;

    let header_len = u32::from_be_bytes(header_len_buf);
    let body_len = u64::from_be_bytes(body_len_buf);
    check_lengths(header_len, body_len, max_header_len, max_body_len)?;

    let mut header = vec![0_u8; header_len as usize];
    reader.read_exact(&mut header)?;

    let mut body = vec![0_u8; body_len as usize];
    reader.read_exact(&mut body)?;

    Ok((header, body))
}

#[cfg(feature = "tokio")]
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &[u8],
    body: &[u8],
) -> Result<(), ProtoError> {
    let (header_len, body_len) = frame_lengths(header, body)?;

    writer.write_all(&MAGIC).await?;
    writer.write_all(&header_len.to_be_bytes()).await?;
    writer.write_all(&body_len.to_be_bytes()).await?;
    writer.write_all(header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(Vec<u8>, Vec<u8>), ProtoError> {
    let mut magic = [0_u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic);
    }

    let mut header_len_buf = [0_u8; 4];
    reader.read_exact(&mut header_len_buf).await?;
    let mut body_len_buf = [0_u8; 8];
    reader.read_exact(&mut body_len_buf).await?;

    let header_len = u32::from_be_bytes(header_len_buf);
    let body_len = u64::from_be_bytes(body_len_buf);
    check_lengths(header_len, body_len, max_header_len, max_body_len)?;

    let mut header = vec![0_u8; header_len as usize];
    reader.read_exact(&mut header).await?;

    let mut body = vec![0_u8; body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok((header, body))
}

pub fn read_ack_sync<R: Read>(reader: &mut R) -> Result<(), ProtoError> {
    let mut ack = [0_u8; 3];
    reader.read_exact(&mut ack)?;
    if ack == *ACK { Ok(()) } else { Err(ProtoError::InvalidAck) }
}
