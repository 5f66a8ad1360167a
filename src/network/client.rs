//! Client side of the control channel.
//!
//! A thin typed wrapper over the wire protocol, enough for the
//! framework-integration shim (and the integration tests) to drive the
//! broker. Notifications that arrive interleaved with responses are
//! buffered and drained through [`BrokerClient::next_notification`].

use super::protocol::{
    self, ErrorCode, Frame, Notification, Request, Response, NOTIFY_TOKEN,
};
use crate::broker::BrokerStats;
use crate::pool::Handle;
use crate::session::SessionId;
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;

/// A connected, handshaken control-channel client.
pub struct BrokerClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    session_id: SessionId,
    next_token: i64,
    pending_notifications: VecDeque<Notification>,
}

impl BrokerClient {
    /// Connect and perform the handshake. `requested_quota` of 0 accepts
    /// the server's default.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        process_identity: &str,
        requested_quota: u64,
    ) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let session_id =
            protocol::connect_handshake(&mut stream, process_identity, requested_quota).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            session_id,
            next_token: 1,
            pending_notifications: VecDeque::new(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Send one request and wait for its response, stashing any
    /// notifications that arrive in between.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        let token = self.next_token;
        self.next_token += 1;
        eprintln!("DBG client writing token={} req={:?}", token, std::mem::discriminant(request));
        protocol::write_frame(&mut self.writer, token, request).await?;
        eprintln!("DBG client wrote token={}", token);

        loop {
            eprintln!("DBG client awaiting response for token={token}");
            let frame = protocol::read_frame(&mut self.reader).await?;
            eprintln!("DBG client got response frame token={}", frame.token);
            if frame.token == NOTIFY_TOKEN {
                self.stash_notification(frame)?;
                continue;
            }
            if frame.token != token {
                return Err(anyhow!(
                    "response token mismatch: sent {}, got {}",
                    token,
                    frame.token
                ));
            }
            return Ok(serde_json::from_value(frame.body)?);
        }
    }

    fn stash_notification(&mut self, frame: Frame) -> Result<()> {
        let note: Notification = serde_json::from_value(frame.body)?;
        self.pending_notifications.push_back(note);
        Ok(())
    }

    /// Next buffered or incoming notification, or `None` on timeout.
    pub async fn next_notification(&mut self, wait: Duration) -> Result<Option<Notification>> {
        if let Some(note) = self.pending_notifications.pop_front() {
            return Ok(Some(note));
        }
        match tokio::time::timeout(wait, protocol::read_frame(&mut self.reader)).await {
            Ok(Ok(frame)) if frame.token == NOTIFY_TOKEN => {
                Ok(Some(serde_json::from_value(frame.body)?))
            }
            Ok(Ok(frame)) => Err(anyhow!("unexpected frame with token {}", frame.token)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub async fn heartbeat(&mut self) -> Result<Response> {
        self.call(&Request::Heartbeat).await
    }

    /// Allocate and unwrap to a handle, or the wire error code.
    pub async fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<std::result::Result<Handle, (ErrorCode, String)>> {
        match self.call(&Request::Allocate { size, alignment }).await? {
            Response::Granted { handle } => Ok(Ok(handle)),
            Response::Error { code, message } => Ok(Err((code, message))),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn release(&mut self, handle: Handle) -> Result<Response> {
        self.call(&Request::Release { handle }).await
    }

    pub async fn release_final(&mut self, handle: Handle) -> Result<Response> {
        self.call(&Request::ReleaseFinal { handle }).await
    }

    pub async fn reclaim_ack(&mut self, handle: Handle) -> Result<Response> {
        self.call(&Request::ReclaimAck { handle }).await
    }

    pub async fn stats(&mut self) -> Result<BrokerStats> {
        match self.call(&Request::Stats).await? {
            Response::Stats { stats } => Ok(stats),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn metrics(&mut self) -> Result<String> {
        match self.call(&Request::Metrics).await? {
            Response::Metrics { text } => Ok(text),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    pub async fn close(&mut self) -> Result<Response> {
        self.call(&Request::Close).await
    }
}
