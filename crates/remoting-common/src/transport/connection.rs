//! A single framed TCP connection.
//!
//! [`Connection::spawn`] takes ownership of a connected socket and drives it
//! with two tasks: a reader that decodes frames and a writer that drains an
//! outbound queue. The owner talks to it through a cloneable
//! [`ConnectionHandle`] and observes it through a stream of
//! [`ConnectionEvent`]s.
//!
//! # Heartbeats
//!
//! - When nothing has been written for `write_idle`, a [`Ping`] is sent.
//! - When nothing has been read for `read_idle` (pings included), the peer is
//!   treated as dead and the connection is closed.
//! - A server-side connection echoes every ping it receives; a client-side
//!   connection logs the round-trip time of the echo.
//!
//! # Closing
//!
//! Packets queued before [`ConnectionHandle::close`] are still written,
//! bounded by [`CLOSE_FLUSH_TIMEOUT`]. A server-side connection that fails to
//! read a frame queues an [`ErrorPacket`] for the peer before it closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::protocol::error::{RemotingError, Result};
use crate::protocol::{ErrorPacket, HandshakeMetadata, Packet, Ping};
use crate::transport::codec::{read_frame, write_frame};

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long a closing connection keeps writing what was already queued
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle windows driving the heartbeat. `None` disables the check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleConfig {
    pub read_idle: Option<Duration>,
    pub write_idle: Option<Duration>,
}

impl IdleConfig {
    /// Client side: ping at half the heartbeat window, give up after the full window.
    pub fn client(heartbeat_timeout: Duration) -> Self {
        IdleConfig {
            read_idle: Some(heartbeat_timeout),
            write_idle: Some(heartbeat_timeout / 2),
        }
    }

    /// Server side: only watch for silent peers.
    pub fn server(heartbeat_timeout: Duration) -> Self {
        IdleConfig {
            read_idle: Some(heartbeat_timeout),
            write_idle: None,
        }
    }
}

/// Which end of the link this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Server,
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An application packet arrived
    Received(Packet),
    /// A decode failure, an I/O failure, or an `Error` packet from the peer
    Error(RemotingError),
    /// Nothing was read within the read-idle window; the connection is closing
    IdleRead,
    /// Nothing was written within the write-idle window; a ping was queued
    IdleWrite,
    /// The connection is closed. Always the last event.
    Closed,
}

struct Shared {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Packet>,
    closed: watch::Sender<bool>,
    connected: AtomicBool,
    handshake: Mutex<Option<HandshakeMetadata>>,
}

/// Cheap, cloneable reference to a live (or formerly live) connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Process-unique id, stable for the lifetime of the connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queues a packet for writing.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::ClientDisconnected`] once the connection is
    /// closed.
    pub fn send(&self, packet: impl Into<Packet>) -> Result<()> {
        if !self.is_connected() {
            return Err(RemotingError::disconnected(self.shared.remote_addr));
        }
        self.shared
            .outbound
            .send(packet.into())
            .map_err(|_| RemotingError::disconnected(self.shared.remote_addr))
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.closed.send_replace(true);
    }

    /// Handshake metadata the peer declared, if any.
    pub fn handshake(&self) -> Option<HandshakeMetadata> {
        *self
            .shared
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_handshake(&self, metadata: HandshakeMetadata) {
        *self
            .shared
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(metadata);
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn same(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Entry point for driving a socket.
pub struct Connection;

impl Connection {
    /// Starts driving `stream` and returns a handle plus its event stream.
    pub fn spawn(
        stream: TcpStream,
        idle: IdleConfig,
        role: ConnectionRole,
    ) -> Result<(ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                remote_addr,
                local_addr,
                outbound: outbound_tx,
                closed: closed_tx,
                connected: AtomicBool::new(true),
                handshake: Mutex::new(None),
            }),
        };

        let (reader, writer) = stream.into_split();
        tokio::spawn(drive(handle.clone(), reader, writer, outbound_rx, events_tx, idle, role));

        Ok((handle, events_rx))
    }
}

async fn drive(
    handle: ConnectionHandle,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Packet>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    idle: IdleConfig,
    role: ConnectionRole,
) {
    let writer_task = tokio::spawn(write_loop(
        handle.clone(),
        writer,
        outbound,
        events.clone(),
        idle.write_idle,
    ));

    read_loop(&handle, reader, &events, idle.read_idle, role).await;

    handle.close();
    let _ = writer_task.await;
    tracing::debug!(remote = %handle.remote_addr(), id = handle.id(), "Connection closed");
    let _ = events.send(ConnectionEvent::Closed);
}

async fn read_loop(
    handle: &ConnectionHandle,
    mut reader: OwnedReadHalf,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    read_idle: Option<Duration>,
    role: ConnectionRole,
) {
    let mut closed = handle.shared.closed.subscribe();
    let remote = handle.remote_addr();

    loop {
        let frame = tokio::select! {
            _ = closed.wait_for(|c| *c) => return,
            frame = read_with_idle(&mut reader, read_idle) => frame,
        };

        match frame {
            Ok(Some(Packet::Ping(ping))) => match role {
                ConnectionRole::Server => {
                    let _ = handle.send(ping);
                }
                ConnectionRole::Client => {
                    tracing::debug!(remote = %remote, rtt_ms = ping.elapsed_millis(), "Heartbeat round trip");
                }
            },
            Ok(Some(Packet::Error(err))) => match role {
                ConnectionRole::Client => {
                    let _ = events.send(ConnectionEvent::Error(RemotingError::Remote(err.message)));
                }
                ConnectionRole::Server => {
                    tracing::warn!(remote = %remote, message = %err.message, "Peer reported error");
                }
            },
            Ok(Some(packet)) => {
                tracing::debug!(remote = %remote, kind = packet.kind(), "Received packet");
                if events.send(ConnectionEvent::Received(packet)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!(remote = %remote, "Connection closed by peer");
                return;
            }
            Err(ReadFailure::Idle) => {
                tracing::warn!(remote = %remote, "No data read within idle window, closing");
                let _ = events.send(ConnectionEvent::IdleRead);
                return;
            }
            Err(ReadFailure::Remoting(e)) => {
                if !handle.is_connected() {
                    return;
                }
                tracing::debug!(remote = %remote, error = %e, "Read failed, closing");
                if role == ConnectionRole::Server {
                    let _ = handle.send(ErrorPacket {
                        message: format!("server error: {}", e),
                    });
                }
                let _ = events.send(ConnectionEvent::Error(e));
                return;
            }
        }
    }
}

enum ReadFailure {
    Idle,
    Remoting(RemotingError),
}

async fn read_with_idle(
    reader: &mut OwnedReadHalf,
    read_idle: Option<Duration>,
) -> std::result::Result<Option<Packet>, ReadFailure> {
    match read_idle {
        Some(window) => match tokio::time::timeout(window, read_frame(reader)).await {
            Ok(frame) => frame.map_err(ReadFailure::Remoting),
            Err(_) => Err(ReadFailure::Idle),
        },
        None => read_frame(reader).await.map_err(ReadFailure::Remoting),
    }
}

async fn write_loop(
    handle: ConnectionHandle,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    write_idle: Option<Duration>,
) {
    let mut closed = handle.shared.closed.subscribe();
    let remote = handle.remote_addr();

    let flush = loop {
        let next = tokio::select! {
            _ = closed.wait_for(|c| *c) => break true,
            next = recv_with_idle(&mut outbound, write_idle) => next,
        };

        let packet = match next {
            Some(Some(packet)) => packet,
            Some(None) => break false,
            None => {
                let _ = events.send(ConnectionEvent::IdleWrite);
                Packet::from(Ping::now())
            }
        };

        if let Err(e) = write_frame(&mut writer, &packet).await {
            tracing::debug!(remote = %remote, error = %e, "Write failed, closing");
            let _ = events.send(ConnectionEvent::Error(e));
            handle.close();
            break false;
        }
    };

    if flush {
        flush_queued(&mut writer, &mut outbound, remote).await;
    }
}

/// Writes what was queued before the close, then stops.
async fn flush_queued(
    writer: &mut OwnedWriteHalf,
    outbound: &mut mpsc::UnboundedReceiver<Packet>,
    remote: SocketAddr,
) {
    let drain = async {
        let mut written = 0usize;
        while let Ok(packet) = outbound.try_recv() {
            write_frame(&mut *writer, &packet).await?;
            written += 1;
        }
        Ok::<usize, RemotingError>(written)
    };

    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, drain).await {
        Ok(Ok(0)) => {}
        Ok(Ok(written)) => tracing::debug!(remote = %remote, written, "Flushed queued packets on close"),
        Ok(Err(e)) => tracing::debug!(remote = %remote, error = %e, "Flush on close failed"),
        Err(_) => tracing::warn!(remote = %remote, "Flush on close timed out"),
    }
}

/// `None` means the idle window elapsed; `Some(None)` means the queue closed.
async fn recv_with_idle(
    outbound: &mut mpsc::UnboundedReceiver<Packet>,
    write_idle: Option<Duration>,
) -> Option<Option<Packet>> {
    match write_idle {
        Some(window) => tokio::time::timeout(window, outbound.recv()).await.ok(),
        None => Some(outbound.recv().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorPacket, MethodCall};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair(
        client_idle: IdleConfig,
        server_idle: IdleConfig,
    ) -> (
        (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>),
        (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = Connection::spawn(client.unwrap(), client_idle, ConnectionRole::Client).unwrap();
        let server = Connection::spawn(accepted.unwrap().0, server_idle, ConnectionRole::Server).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let ((client, _client_events), (_server, mut server_events)) =
            pair(IdleConfig::default(), IdleConfig::default()).await;

        client.send(MethodCall::new(1, "echo", vec![json!("hi")])).unwrap();

        match server_events.recv().await.unwrap() {
            ConnectionEvent::Received(Packet::MethodCall(call)) => {
                assert_eq!(call.method_name, "echo");
                assert_eq!(call.parameters, vec![json!("hi")]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_observed_by_both_sides() {
        let ((client, mut client_events), (server, mut server_events)) =
            pair(IdleConfig::default(), IdleConfig::default()).await;

        client.close();

        assert!(matches!(client_events.recv().await, Some(ConnectionEvent::Closed)));
        assert!(matches!(server_events.recv().await, Some(ConnectionEvent::Closed)));
        assert!(!client.is_connected());
        assert!(!server.is_connected());
        assert!(client.send(Ping::now()).unwrap_err().is_disconnected());
    }

    #[tokio::test]
    async fn test_server_echoes_pings_so_client_stays_alive() {
        let heartbeat = Duration::from_millis(200);
        let ((client, mut client_events), (server, _server_events)) =
            pair(IdleConfig::client(heartbeat), IdleConfig::server(heartbeat)).await;

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert!(client.is_connected());
        assert!(server.is_connected());
        // Only write-idle notifications are expected while pings flow
        while let Ok(event) = client_events.try_recv() {
            assert!(matches!(event, ConnectionEvent::IdleWrite), "unexpected {:?}", event);
        }
    }

    #[tokio::test]
    async fn test_read_idle_closes_silent_peer() {
        let ((client, _client_events), (_server, mut server_events)) =
            pair(IdleConfig::default(), IdleConfig::server(Duration::from_millis(100))).await;

        assert!(matches!(server_events.recv().await, Some(ConnectionEvent::IdleRead)));
        assert!(matches!(server_events.recv().await, Some(ConnectionEvent::Closed)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_decode_failure_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = raw.unwrap();
        let (server, mut events) =
            Connection::spawn(accepted.unwrap().0, IdleConfig::default(), ConnectionRole::Server).unwrap();

        let garbage = b"not json";
        raw.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(garbage).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Error(RemotingError::Decode(_)))
        ));
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Closed)));
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_error_packet_surfaces_on_client_without_closing() {
        let ((client, mut client_events), (server, _server_events)) =
            pair(IdleConfig::default(), IdleConfig::default()).await;

        server
            .send(ErrorPacket {
                message: "server error: boom".into(),
            })
            .unwrap();

        match client_events.recv().await.unwrap() {
            ConnectionEvent::Error(RemotingError::Remote(message)) => {
                assert_eq!(message, "server error: boom");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_packets_queued_before_close_are_delivered() {
        let ((_client, mut client_events), (server, _server_events)) =
            pair(IdleConfig::default(), IdleConfig::default()).await;

        server.send(MethodCall::new(1, "last", vec![])).unwrap();
        server
            .send(ErrorPacket {
                message: "server error: going away".into(),
            })
            .unwrap();
        server.close();

        match client_events.recv().await.unwrap() {
            ConnectionEvent::Received(Packet::MethodCall(call)) => assert_eq!(call.method_name, "last"),
            other => panic!("unexpected event: {:?}", other),
        }
        match client_events.recv().await.unwrap() {
            ConnectionEvent::Error(RemotingError::Remote(message)) => {
                assert_eq!(message, "server error: going away");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(client_events.recv().await, Some(ConnectionEvent::Closed)));
    }

    #[tokio::test]
    async fn test_decode_failure_reports_error_to_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = raw.unwrap();
        let (_server, _events) =
            Connection::spawn(accepted.unwrap().0, IdleConfig::default(), ConnectionRole::Server).unwrap();

        let garbage = b"{\"kind\": 1}";
        raw.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(garbage).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut raw))
            .await
            .unwrap()
            .unwrap();
        match reply {
            Some(Packet::Error(err)) => assert!(err.message.starts_with("server error:"), "{}", err.message),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(read_frame(&mut raw).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshake_slot() {
        let ((_client, _ce), (server, _se)) = pair(IdleConfig::default(), IdleConfig::default()).await;
        assert!(server.handshake().is_none());
        server.set_handshake(HandshakeMetadata { event_version: 3 });
        assert_eq!(server.clone().handshake(), Some(HandshakeMetadata { event_version: 3 }));
    }
}
