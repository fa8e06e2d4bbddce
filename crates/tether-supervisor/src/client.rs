//! Connection to one session daemon.
//!
//! [`SessionClient::connect`] performs the handshake:
//!
//! 1. send HELLO
//! 2. await WELCOME and check the protocol version
//! 3. await the REPLAY that follows and keep it
//!
//! After that a writer task drains an ordered outbound queue onto the socket
//! and a reader task turns inbound frames into [`ClientEvent`]s. Either side
//! failing closes the whole connection; the reader always reports
//! [`ClientEvent::Close`] last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_protocol::{
    FrameCodec, FrameType, Hello, Message, ProtocolError, ProtocolVersion, Resize, Signal,
    SignalRequest, Spawn, Welcome,
};

use crate::error::ClientError;

/// What the daemon told us about itself during the handshake.
pub type WelcomeInfo = Welcome;

type Transport = Framed<UnixStream, FrameCodec>;

/// Events reported by a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Live pty output
    Data(Bytes),
    /// The foreground process ended
    Exit { code: Option<i32>, signal: Option<i32> },
    /// Answer to [`SessionClient::ping`]
    Pong(Bytes),
    /// The connection failed; a [`ClientEvent::Close`] follows
    Error(String),
    /// The connection is gone. Always the last event.
    Close,
}

/// A handshaken connection to a daemon.
///
/// Dropping the client closes the connection.
#[derive(Debug)]
pub struct SessionClient {
    socket_path: PathBuf,
    outbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
    replay: Bytes,
}

impl SessionClient {
    /// Connects to `path` and completes the handshake within `limit`.
    pub async fn connect(
        path: &Path,
        limit: Duration,
    ) -> Result<(Self, WelcomeInfo, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let stream = timeout(limit, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::Timeout(limit))?
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;

        let mut framed = Framed::new(stream, FrameCodec::new());
        let (welcome, replay) = timeout(limit, handshake(&mut framed))
            .await
            .map_err(|_| ClientError::Timeout(limit))??;

        debug!(
            socket = %path.display(),
            daemon_pid = welcome.pid,
            protocol_version = %welcome.protocol_version,
            replay_bytes = replay.len(),
            "connected to session daemon"
        );

        let (sink, stream) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(sink, outbound_rx, closed.clone()));
        tokio::spawn(read_loop(stream, events_tx, closed.clone()));

        let client = Self {
            socket_path: path.to_path_buf(),
            outbound: outbound_tx,
            closed,
            replay,
        };
        Ok((client, welcome, events_rx))
    }

    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send(Message::Data(data.into()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(Message::Resize(Resize { cols, rows }))
    }

    pub fn signal(&self, signal: Signal) -> Result<(), ClientError> {
        self.send(Message::Signal(SignalRequest::new(signal)))
    }

    /// Asks the daemon to replace its foreground process.
    pub fn spawn(&self, spec: Spawn) -> Result<(), ClientError> {
        self.send(Message::Spawn(spec))
    }

    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send(Message::Ping(payload.into()))
    }

    /// The REPLAY payload received while connecting.
    pub fn replay_data(&self) -> &Bytes {
        &self.replay
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Closes the connection. Queued frames may be dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn send(&self, msg: Message) -> Result<(), ClientError> {
        if self.closed.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        self.outbound.send(msg).map_err(|_| ClientError::NotConnected)
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn handshake(framed: &mut Transport) -> Result<(WelcomeInfo, Bytes), ClientError> {
    framed.send(Message::Hello(Hello::default())).await?;

    let welcome = match next_message(framed).await? {
        Message::Welcome(welcome) => welcome,
        other => {
            return Err(ClientError::UnexpectedFrame {
                expected: FrameType::Welcome,
                got: other.frame_type(),
            })
        }
    };
    if !ProtocolVersion::CURRENT.is_compatible_with(&welcome.protocol_version) {
        return Err(ClientError::VersionMismatch {
            ours: ProtocolVersion::CURRENT,
            theirs: welcome.protocol_version,
        });
    }

    let replay = match next_message(framed).await? {
        Message::Replay(replay) => replay,
        other => {
            return Err(ClientError::UnexpectedFrame {
                expected: FrameType::Replay,
                got: other.frame_type(),
            })
        }
    };

    Ok((welcome, replay))
}

async fn next_message(framed: &mut Transport) -> Result<Message, ClientError> {
    match framed.next().await {
        Some(frame) => Ok(Message::from_frame(frame?)?),
        None => Err(ClientError::HandshakeClosed),
    }
}

async fn write_loop(
    mut sink: SplitSink<Transport, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        log_send_error(&e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Transport>,
    events: mpsc::UnboundedSender<ClientEvent>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    let frame_type = frame.frame_type;
                    let event = match Message::from_frame(frame) {
                        Ok(Message::Data(data)) => ClientEvent::Data(data),
                        Ok(Message::Exit(exit)) => ClientEvent::Exit {
                            code: exit.code,
                            signal: exit.signal,
                        },
                        Ok(Message::Pong(payload)) => ClientEvent::Pong(payload),
                        Ok(other) => {
                            debug!(frame_type = %other.frame_type(), "ignoring unexpected frame");
                            continue;
                        }
                        Err(e) => {
                            warn!(frame_type = %frame_type, error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    if events.send(event).is_err() {
                        debug!("event receiver dropped, closing connection");
                        break;
                    }
                }
                Some(Err(e)) => {
                    if is_broken_pipe(&e) {
                        debug!("daemon went away (broken pipe)");
                    } else {
                        let _ = events.send(ClientEvent::Error(e.to_string()));
                    }
                    break;
                }
                None => {
                    debug!("daemon closed connection");
                    break;
                }
            },
        }
    }
    closed.cancel();
    let _ = events.send(ClientEvent::Close);
}

fn is_broken_pipe(e: &ProtocolError) -> bool {
    matches!(
        e,
        ProtocolError::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
        )
    )
}

fn log_send_error(e: &ProtocolError) {
    if is_broken_pipe(e) {
        debug!("daemon went away (broken pipe)");
    } else {
        debug!(error = %e, "failed to write frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn fake_daemon(
        path: &Path,
        welcome_version: ProtocolVersion,
    ) -> tokio::task::JoinHandle<Transport> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let hello = framed.next().await.unwrap().unwrap();
            assert!(matches!(Message::from_frame(hello).unwrap(), Message::Hello(_)));
            framed
                .send(Message::Welcome(Welcome {
                    protocol_version: welcome_version,
                    pid: 7,
                    start_time: 99,
                    child_pid: Some(8),
                    cols: 80,
                    rows: 24,
                }))
                .await
                .unwrap();
            framed.send(Message::Replay(Bytes::from_static(b"history"))).await.unwrap();
            framed
        })
    }

    #[tokio::test]
    async fn test_connect_keeps_replay_and_forwards_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.sock");
        let server = fake_daemon(&path, ProtocolVersion::CURRENT).await;

        let (client, welcome, mut events) =
            SessionClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(welcome.pid, 7);
        assert_eq!(client.replay_data().as_ref(), b"history");

        let mut server = server.await.unwrap();
        server.send(Message::Data(Bytes::from_static(b"live"))).await.unwrap();
        server
            .send(Message::Exit(tether_protocol::Exit {
                code: Some(3),
                signal: None,
            }))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(ClientEvent::Data(Bytes::from_static(b"live"))));
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::Exit {
                code: Some(3),
                signal: None
            })
        );

        client.write(Bytes::from_static(b"ls\n")).unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(
            Message::from_frame(frame).unwrap(),
            Message::Data(Bytes::from_static(b"ls\n"))
        );

        drop(server);
        assert_eq!(events.recv().await, Some(ClientEvent::Close));
        assert!(!client.is_connected());
        assert!(matches!(client.write(Bytes::new()), Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_incompatible_daemon_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let _server = fake_daemon(&path, ProtocolVersion::new(2, 0)).await;

        let err = SessionClient::connect(&path, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ClientError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionClient::connect(&dir.path().join("none.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_close_reports_close_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.sock");
        let _server = fake_daemon(&path, ProtocolVersion::CURRENT).await;

        let (client, _welcome, mut events) =
            SessionClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        client.close();
        assert_eq!(events.recv().await, Some(ClientEvent::Close));
        assert!(matches!(client.ping(Bytes::new()), Err(ClientError::NotConnected)));
    }
}
