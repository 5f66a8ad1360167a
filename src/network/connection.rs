//! Control-channel connection lifecycle.
//!
//! One task per client connection: magic + handshake, then a loop serving
//! two sources at once, decoded request frames from the socket and
//! broker-initiated notifications (release requests, forced close). A
//! dedicated reader task feeds frames through a channel so the select
//! loop never cancels a half-read frame.

use super::protocol::{
    self, HandshakeReply, Notification, Request, Response, NOTIFY_TOKEN,
};
use crate::broker::Broker;
use crate::error::Result as BrokerResult;
use crate::session::SessionId;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

fn ack_or_err(result: BrokerResult<()>) -> Response {
    match result {
        Ok(()) => Response::Ack,
        Err(e) => Response::from_error(&e),
    }
}

/// Connection handler for control-channel TCP streams.
pub struct ConnectionHandler {
    broker: Arc<Broker>,
}

impl ConnectionHandler {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Handle a new TCP connection for its whole lifetime.
    pub async fn handle(&self, stream: TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr()?;
        info!("new connection from {}", peer_addr);
        let (mut reader, mut writer) = stream.into_split();

        let (handshake, token) = match protocol::accept_handshake(&mut reader).await {
            Ok(h) => h,
            Err(e) => {
                error!("handshake failed from {}: {}", peer_addr, e);
                return Err(e);
            }
        };

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let session = match self.broker.handshake(
            &handshake.process_identity,
            handshake.requested_quota,
            notify_tx,
        ) {
            Ok(session) => session,
            Err(e) => {
                let reply = HandshakeReply {
                    success: false,
                    session_id: None,
                    server_version: crate::VERSION.to_string(),
                    error: Some(e.to_string()),
                };
                protocol::write_frame(&mut writer, token, &reply).await?;
                return Err(e.into());
            }
        };
        let session_id = session.id;
        protocol::write_frame(
            &mut writer,
            token,
            &HandshakeReply {
                success: true,
                session_id: Some(session_id),
                server_version: crate::VERSION.to_string(),
                error: None,
            },
        )
        .await?;
        info!(
            session = %session_id,
            identity = %handshake.process_identity,
            "handshake complete"
        );

        // Reader task: frames must be decoded outside the select loop,
        // reading half a frame and cancelling would desync the stream.
        let (frame_tx, mut frame_rx) = mpsc::channel::<protocol::Frame>(16);
        let reader_task = tokio::spawn(async move {
            loop {
                match protocol::read_frame(&mut reader).await {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("read loop ended: {}", e);
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let request: Request = match serde_json::from_value(frame.body) {
                        Ok(request) => request,
                        Err(e) => {
                            let response = Response::Error {
                                code: protocol::ErrorCode::InvalidArgument,
                                message: format!("malformed request: {e}"),
                            };
                            protocol::write_frame(&mut writer, frame.token, &response).await?;
                            continue;
                        }
                    };
                    let (response, done) = self.dispatch(session_id, request).await;
                    if let Err(e) = protocol::write_frame(&mut writer, frame.token, &response).await {
                        error!("failed to write response: {}", e);
                        break;
                    }
                    if done {
                        break;
                    }
                }
                note = notify_rx.recv() => {
                    let Some(note) = note else { break };
                    let closing = matches!(note, Notification::SessionClosed { .. });
                    if let Err(e) = protocol::write_frame(&mut writer, NOTIFY_TOKEN, &note).await {
                        error!("failed to push notification: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            }
        }

        reader_task.abort();
        // No-op when the session already left via Close or the sweeper.
        self.broker.disconnect(session_id).await;
        info!("connection closed from {}", peer_addr);
        Ok(())
    }

    async fn dispatch(&self, session_id: SessionId, request: Request) -> (Response, bool) {
        match request {
            Request::Heartbeat => (ack_or_err(self.broker.heartbeat(session_id)), false),
            Request::Allocate { size, alignment } => {
                match self.broker.allocate(session_id, size, alignment).await {
                    Ok(handle) => (Response::Granted { handle }, false),
                    Err(e) => (Response::from_error(&e), false),
                }
            }
            Request::Release { handle } => {
                (ack_or_err(self.broker.release(session_id, handle).await), false)
            }
            Request::ReleaseFinal { handle } => (
                ack_or_err(self.broker.release_final(session_id, handle).await),
                false,
            ),
            Request::ReclaimAck { handle } => {
                (ack_or_err(self.broker.reclaim_ack(session_id, handle)), false)
            }
            Request::Stats => (
                Response::Stats {
                    stats: self.broker.stats(),
                },
                false,
            ),
            Request::Metrics => {
                let response = match crate::metrics::export_metrics() {
                    Ok(text) => Response::Metrics { text },
                    Err(e) => Response::Error {
                        code: protocol::ErrorCode::Internal,
                        message: format!("metrics encoding failed: {e}"),
                    },
                };
                (response, false)
            }
            Request::Close => (ack_or_err(self.broker.close_session(session_id).await), true),
        }
    }
}
