//! Control-plane wire protocol.
//!
//! A connection opens with a 4-byte magic number, then a handshake frame,
//! then a request/response loop. Every frame is `u32` LE length + `i64` LE
//! token + a JSON body. Responses echo the request token; server-initiated
//! notifications (release requests, forced close) use the reserved token
//! `NOTIFY_TOKEN` so the client can tell them apart mid-stream.

use crate::broker::BrokerStats;
use crate::error::Error;
use crate::pool::Handle;
use crate::session::SessionId;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic number opening every connection ("mbrk").
pub const PROTOCOL_MAGIC: u32 = 0x6d62_726b;

/// Token reserved for server-to-client notifications.
pub const NOTIFY_TOKEN: i64 = -1;

/// Control frames are small; anything bigger is a broken peer.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024; // 1 MB

/// First frame sent by a client after the magic number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub process_identity: String,
    /// Requested soft quota in bytes; 0 means "no preference" (the server
    /// applies its configured default, or unlimited).
    pub requested_quota: u64,
}

/// Server reply to the handshake frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub success: bool,
    pub session_id: Option<SessionId>,
    pub server_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client-to-server requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Heartbeat,
    Allocate { size: u64, alignment: u64 },
    Release { handle: Handle },
    ReleaseFinal { handle: Handle },
    /// Voluntary acknowledgment of a `ReleaseRequest` notification.
    ReclaimAck { handle: Handle },
    Stats,
    /// Prometheus text exposition, for scrape agents riding the control
    /// channel.
    Metrics,
    Close,
}

/// Server-to-client responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Granted { handle: Handle },
    Stats { stats: BrokerStats },
    Metrics { text: String },
    Error { code: ErrorCode, message: String },
}

/// Asynchronous server-to-client notifications, sent with `NOTIFY_TOKEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Please release this Reserved range within `deadline_ms`; after the
    /// deadline the broker reclaims it regardless.
    ReleaseRequest { handle: Handle, deadline_ms: u64 },
    /// The server closed this session (heartbeat timeout, shutdown).
    SessionClosed { reason: String },
}

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    Unauthorized,
    NotOwner,
    Exhausted,
    QuotaExceeded,
    SessionDead,
    Internal,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Unauthorized(_) => ErrorCode::Unauthorized,
            Error::NotOwner(_) => ErrorCode::NotOwner,
            Error::Exhausted(_) => ErrorCode::Exhausted,
            Error::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            Error::SessionDead(_) => ErrorCode::SessionDead,
            Error::Network(_) | Error::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl Response {
    pub fn from_error(err: &Error) -> Self {
        Response::Error {
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }
}

/// One decoded frame: token plus raw JSON body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub token: i64,
    pub body: serde_json::Value,
}

/// Read one frame from the stream.
pub async fn read_frame<T>(stream: &mut T) -> Result<Frame>
where
    T: AsyncRead + Unpin,
{
    eprintln!("DBG read_frame: awaiting size");
    let size = stream.read_u32_le().await?;
    eprintln!("DBG read_frame: size={size}");
    if size == 0 {
        return Err(anyhow!("empty frame"));
    }
    if size > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "frame too large: {} bytes (max: {})",
            size,
            MAX_MESSAGE_SIZE
        ));
    }

    let token = stream.read_i64_le().await?;
    eprintln!("DBG read_frame: token={token}");
    let mut buffer = vec![0u8; size as usize];
    stream.read_exact(&mut buffer).await?;
    eprintln!("DBG read_frame: body read ({} bytes)", buffer.len());
    let body: serde_json::Value = serde_json::from_slice(&buffer)?;
    Ok(Frame { token, body })
}

/// Write one frame to the stream.
pub async fn write_frame<T, B>(stream: &mut T, token: i64, body: &B) -> Result<()>
where
    T: AsyncWrite + Unpin,
    B: Serialize,
{
    let payload = serde_json::to_vec(body)?;
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(anyhow!("frame too large: {} bytes", payload.len()));
    }
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_i64_le(token).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Server side of the connection preamble: validate the magic number and
/// decode the handshake frame. Returns the request and its token so the
/// reply can echo it.
pub async fn accept_handshake<T>(stream: &mut T) -> Result<(HandshakeRequest, i64)>
where
    T: AsyncRead + Unpin,
{
    let magic = stream.read_u32_le().await?;
    if magic != PROTOCOL_MAGIC {
        return Err(anyhow!("bad protocol magic: 0x{:08x}", magic));
    }
    let frame = read_frame(stream).await?;
    let request: HandshakeRequest = serde_json::from_value(frame.body)?;
    Ok((request, frame.token))
}

/// Client side of the connection preamble.
pub async fn connect_handshake<T>(
    stream: &mut T,
    process_identity: &str,
    requested_quota: u64,
) -> Result<SessionId>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u32_le(PROTOCOL_MAGIC).await?;
    let request = HandshakeRequest {
        process_identity: process_identity.to_string(),
        requested_quota,
    };
    write_frame(stream, 0, &request).await?;

    let frame = read_frame(stream).await?;
    let reply: HandshakeReply = serde_json::from_value(frame.body)?;
    if !reply.success {
        return Err(anyhow!(
            "handshake rejected: {}",
            reply.error.unwrap_or_else(|| "unknown".to_string())
        ));
    }
    reply
        .session_id
        .ok_or_else(|| anyhow!("handshake reply missing session id"))
}
