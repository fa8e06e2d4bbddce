//! Per-connection handler.
//!
//! Each accepted socket gets one task that:
//! - performs the HELLO/WELCOME handshake
//! - attaches to the daemon actor, superseding any previous connection
//! - pumps actor output to the socket and client frames to the actor
//!
//! Protocol violations end only this connection.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tether_protocol::{FrameCodec, FrameType, Message, ProtocolError, ProtocolVersion, VersionError};

use super::commands::{ClientInput, ConnectionId};
use super::handle::DaemonHandle;
use crate::pty::TermSize;

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No HELLO within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Expected HELLO, got {0}")]
    NotHello(FrameType),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

type Transport = Framed<UnixStream, FrameCodec>;

/// Serves one client connection until it closes, is superseded, or the
/// daemon stops.
pub(crate) async fn run_connection(stream: UnixStream, handle: DaemonHandle, handshake_timeout: Duration) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    if let Err(e) = handshake(&mut framed, handshake_timeout).await {
        warn!(error = %e, "handshake failed, closing connection");
        return;
    }

    let attachment = match handle.attach().await {
        Ok(a) => a,
        Err(e) => {
            debug!(error = %e, "daemon stopped before attach");
            return;
        }
    };
    let conn_id = attachment.conn_id;
    let superseded = attachment.superseded;
    let mut outbound = attachment.outbound;

    loop {
        tokio::select! {
            _ = superseded.cancelled() => {
                info!(conn_id, "connection superseded by a newer client");
                break;
            }

            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = framed.send(msg).await {
                        log_send_error(conn_id, &e);
                        break;
                    }
                }
                None => {
                    debug!(conn_id, "daemon closing connection");
                    break;
                }
            },

            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = dispatch(&mut framed, &handle, conn_id, frame).await {
                        debug!(conn_id, error = %e, "connection ended");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(conn_id, error = %e, "protocol error, closing connection");
                    break;
                }
                None => {
                    debug!(conn_id, "client closed connection");
                    break;
                }
            },
        }
    }

    let _ = handle.detach(conn_id).await;
}

async fn handshake(framed: &mut Transport, limit: Duration) -> Result<(), ConnectionError> {
    let frame = match timeout(limit, framed.next()).await {
        Err(_) => return Err(ConnectionError::HandshakeTimeout(limit)),
        Ok(None) => return Err(ConnectionError::Closed),
        Ok(Some(frame)) => frame?,
    };

    match Message::from_frame(frame)? {
        Message::Hello(hello) => {
            ProtocolVersion::CURRENT.negotiate(&hello.protocol_version)?;
            debug!(client_version = %hello.protocol_version, "handshake accepted");
            Ok(())
        }
        other => Err(ConnectionError::NotHello(other.frame_type())),
    }
}

/// Handles one inbound frame. Only transport failures are returned.
async fn dispatch(
    framed: &mut Transport,
    handle: &DaemonHandle,
    conn_id: ConnectionId,
    frame: tether_protocol::Frame,
) -> Result<(), ConnectionError> {
    let frame_type = frame.frame_type;
    let msg = match Message::from_frame(frame) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn_id, frame_type = %frame_type, error = %e, "dropping malformed frame");
            return Ok(());
        }
    };

    let input = match msg {
        Message::Ping(payload) => {
            framed.send(Message::Pong(payload)).await?;
            return Ok(());
        }
        Message::Data(data) => ClientInput::Data(data),
        Message::Resize(r) => ClientInput::Resize(TermSize::new(r.cols, r.rows)),
        Message::Signal(req) => match req.validate() {
            Ok(signal) => ClientInput::Signal(signal),
            Err(e) => {
                warn!(conn_id, error = %e, "rejecting signal");
                return Ok(());
            }
        },
        Message::Spawn(spec) => ClientInput::Spawn(spec),
        other => {
            debug!(conn_id, frame_type = %other.frame_type(), "ignoring unexpected frame");
            return Ok(());
        }
    };

    handle
        .input(conn_id, input)
        .await
        .map_err(|_| ConnectionError::Closed)
}

fn log_send_error(conn_id: ConnectionId, e: &ProtocolError) {
    match e {
        ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!(conn_id, "client went away (broken pipe)");
        }
        _ => debug!(conn_id, error = %e, "failed to write frame"),
    }
}
