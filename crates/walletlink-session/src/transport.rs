//! Transport -- loopback accept/dial and reflector-routed connections.
//!
//! Every variant yields one framed, ordered byte stream (`Connection`). The
//! reflector path sends the relay session id as the first frame and waits for
//! a `paired` reply before handing the stream to the handshake.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use walletlink_protocol::{
    AssociationDescriptor, FrameCodec, ProtocolError, RelayReply, RelaySessionId, Role,
    TransportScheme,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),
    #[error("relay rejected session: {0}")]
    RelayRejected(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// How a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Local,
    Relay,
}

/// A live, framed stream to the counterpart.
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    peer_addr: SocketAddr,
    kind: ConnectionKind,
}

impl Connection {
    pub fn new(stream: TcpStream, kind: ConnectionKind) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            peer_addr,
            kind,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub async fn send_frame(&mut self, frame: Bytes) -> Result<(), ProtocolError> {
        self.framed.send(frame).await
    }

    /// Next frame, or `None` once the peer has closed the stream.
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        self.framed.next().await.transpose()
    }

    pub async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(message)?;
        self.send_frame(Bytes::from(payload)).await
    }

    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.recv_frame().await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }

    /// Split into independently owned read and write halves.
    ///
    /// Bytes already buffered by the reader carry over to the read half.
    pub fn into_split(
        self,
    ) -> (
        FramedRead<OwnedReadHalf, FrameCodec>,
        FramedWrite<OwnedWriteHalf, FrameCodec>,
    ) {
        let parts = self.framed.into_parts();
        let (read, write) = parts.io.into_split();
        let mut reader = FramedRead::new(read, parts.codec);
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        (reader, FramedWrite::new(write, parts.codec))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("kind", &self.kind)
            .finish()
    }
}

// ============================================================================
// Local (loopback)
// ============================================================================

/// Loopback listener on the wallet side.
pub struct LocalTransport {
    listener: TcpListener,
    port: u16,
}

impl LocalTransport {
    /// Bind 127.0.0.1:`port`. Port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let port = listener.local_addr()?.port();
        tracing::debug!(port, "loopback listener bound");
        Ok(Self { listener, port })
    }

    /// The port to publish in the association descriptor.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Wait for one inbound connection. The listener stays bound.
    pub async fn accept_next(&self) -> Result<Connection, TransportError> {
        let (stream, remote) = self.listener.accept().await?;
        tracing::info!(%remote, port = self.port, "accepted loopback connection");
        Ok(Connection::new(stream, ConnectionKind::Local)?)
    }

    /// Accept exactly one connection, then release the listener.
    pub async fn accept(self, timeout: Duration) -> Result<Connection, TransportError> {
        match tokio::time::timeout(timeout, self.accept_next()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(port = self.port, "no inbound connection before timeout");
                Err(TransportError::Timeout(timeout))
            }
        }
    }
}

async fn dial_local(port: u16) -> Result<Connection, TransportError> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
    tracing::info!(port, "connected to loopback wallet");
    Ok(Connection::new(stream, ConnectionKind::Local)?)
}

// ============================================================================
// Relay (reflector)
// ============================================================================

/// Outbound connection through a reflector, routed by session id.
#[derive(Debug, Clone)]
pub struct RelayTransport {
    host_authority: String,
    session_id: RelaySessionId,
}

impl RelayTransport {
    pub fn new(host_authority: impl Into<String>, session_id: RelaySessionId) -> Self {
        Self {
            host_authority: host_authority.into(),
            session_id,
        }
    }

    pub fn host_authority(&self) -> &str {
        &self.host_authority
    }

    pub fn session_id(&self) -> &RelaySessionId {
        &self.session_id
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(self.host_authority.as_str())
            .await
            .map_err(|e| TransportError::RelayUnreachable(format!("{}: {e}", self.host_authority)))?;
        let mut conn = Connection::new(stream, ConnectionKind::Relay)?;

        conn.send_frame(Bytes::copy_from_slice(self.session_id.as_bytes()))
            .await
            .map_err(|e| TransportError::RelayUnreachable(e.to_string()))?;

        match conn.recv_json::<RelayReply>().await? {
            Some(RelayReply::Paired) => {
                tracing::info!(
                    relay = %self.host_authority,
                    session = %hex::encode(self.session_id.as_bytes()),
                    "paired through reflector"
                );
                Ok(conn)
            }
            Some(RelayReply::Rejected { reason }) => {
                tracing::warn!(relay = %self.host_authority, %reason, "reflector rejected session");
                Err(TransportError::RelayRejected(reason))
            }
            None => Err(TransportError::RelayRejected(
                "reflector closed the connection before pairing".into(),
            )),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One way of reaching the counterpart.
pub enum Transport {
    /// Wallet side: accept one connection on a bound loopback listener.
    LocalAccept(LocalTransport),
    /// dApp side: dial the wallet's loopback port.
    LocalDial { port: u16 },
    /// Either side: route through a reflector.
    Relay(RelayTransport),
}

impl Transport {
    /// The outbound transport a descriptor describes.
    pub fn for_descriptor(descriptor: &AssociationDescriptor) -> Result<Self, TransportError> {
        let invalid = || ProtocolError::MalformedDescriptor("endpoint fields missing".into());
        match descriptor.transport_scheme() {
            TransportScheme::Local => Ok(Transport::LocalDial {
                port: descriptor.local_port().ok_or_else(invalid)?,
            }),
            TransportScheme::Relay => Ok(Transport::Relay(RelayTransport::new(
                descriptor.relay_host_authority().ok_or_else(invalid)?,
                descriptor.relay_session_id().ok_or_else(invalid)?.clone(),
            ))),
        }
    }

    pub fn scheme(&self) -> TransportScheme {
        match self {
            Transport::LocalAccept(_) | Transport::LocalDial { .. } => TransportScheme::Local,
            Transport::Relay(_) => TransportScheme::Relay,
        }
    }

    /// Handshake role implied by a loopback transport. The accepting side
    /// responds. Relay connections carry no role; the association key
    /// holder initiates.
    pub fn local_role(&self) -> Option<Role> {
        match self {
            Transport::LocalAccept(_) => Some(Role::Responder),
            Transport::LocalDial { .. } => Some(Role::Initiator),
            Transport::Relay(_) => None,
        }
    }

    /// Establish the connection within `timeout`. Any partially opened
    /// socket is dropped on failure.
    pub async fn connect_or_accept(self, timeout: Duration) -> Result<Connection, TransportError> {
        match self {
            Transport::LocalAccept(local) => local.accept(timeout).await,
            Transport::LocalDial { port } => tokio::time::timeout(timeout, dial_local(port))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?,
            Transport::Relay(relay) => tokio::time::timeout(timeout, relay.connect())
                .await
                .map_err(|_| TransportError::Timeout(timeout))?,
        }
    }
}
