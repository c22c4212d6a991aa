//! Wallet endpoint -- the responder side of an association.
//!
//! A loopback endpoint runs an accept loop guarded by a [`SessionGate`]: one
//! session at a time, later arrivals get a `busy` hello and are dropped.
//! Relay joins go through the same gate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use walletlink_protocol::{
    AssociationDescriptor, HandshakeMessage, ProtocolError, ProtocolVersion, TransportScheme,
};

use crate::channel::EncryptedChannel;
use crate::handshake::{HandshakeEngine, HandshakeOutcome};
use crate::rpc::{RequestHandler, RpcEngine};
use crate::scenario::{ScenarioConfig, ScenarioError};
use crate::session_state::{SessionGate, SessionId, SessionLease, SessionState};
use crate::transport::{Connection, LocalTransport, Transport, TransportError};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// An established wallet-side session. Dropping it closes the channel.
pub struct WalletSession {
    id: SessionId,
    engine: Arc<RpcEngine>,
}

impl WalletSession {
    fn establish(
        conn: Connection,
        outcome: HandshakeOutcome,
        handler: RequestHandler,
        id: SessionId,
    ) -> Result<Self, ScenarioError> {
        let channel = Arc::new(EncryptedChannel::new(conn, outcome.keys, outcome.version)?);
        let engine = Arc::new(RpcEngine::start(channel, Some(handler)));
        Ok(Self { id, engine })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn version(&self) -> ProtocolVersion {
        self.engine.channel().version()
    }

    pub fn channel(&self) -> &Arc<EncryptedChannel> {
        self.engine.channel()
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Resolves when the channel closes from either side.
    pub async fn closed(&self) {
        self.engine.channel().closed().await
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.engine.shutdown();
    }
}

impl std::fmt::Debug for WalletSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSession")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ServeContext {
    association_public_key: Vec<u8>,
    handler: RequestHandler,
    config: ScenarioConfig,
    gate: Arc<SessionGate>,
}

/// Loopback listener plus the gate it admits sessions through.
pub struct WalletEndpoint {
    transport: LocalTransport,
    gate: Arc<SessionGate>,
}

impl WalletEndpoint {
    /// Bind 127.0.0.1:`port` (0 = ephemeral) with a fresh gate.
    pub async fn bind_local(port: u16) -> Result<Self, TransportError> {
        Self::bind_local_with_gate(port, SessionGate::new()).await
    }

    /// Bind with a gate shared with other entry points (e.g. relay joins).
    pub async fn bind_local_with_gate(
        port: u16,
        gate: Arc<SessionGate>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            transport: LocalTransport::bind(port).await?,
            gate,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.transport.local_port()
    }

    pub fn gate(&self) -> Arc<SessionGate> {
        self.gate.clone()
    }

    /// Start accepting. Sessions authenticated against `descriptor` are
    /// delivered through [`WalletServer::next_session`].
    pub fn serve(
        self,
        descriptor: &AssociationDescriptor,
        handler: RequestHandler,
        config: ScenarioConfig,
    ) -> WalletServer {
        let port = self.transport.local_port();
        if descriptor.local_port().is_some_and(|p| p != port) {
            tracing::warn!(
                port,
                descriptor_port = ?descriptor.local_port(),
                "descriptor port differs from the bound port"
            );
        }

        let ctx = Arc::new(ServeContext {
            association_public_key: descriptor.association_public_key().to_vec(),
            handler,
            config,
            gate: self.gate.clone(),
        });
        let (session_tx, session_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(self.transport, ctx, session_tx, shutdown_rx));

        tracing::info!(port, "wallet endpoint serving");
        WalletServer {
            port,
            gate: self.gate,
            sessions: Mutex::new(session_rx),
            shutdown,
            accept_task,
        }
    }

    /// Wallet side of a relayed association.
    pub async fn join_relay(
        descriptor: &AssociationDescriptor,
        handler: RequestHandler,
        config: &ScenarioConfig,
        gate: &Arc<SessionGate>,
    ) -> Result<WalletSession, ScenarioError> {
        if descriptor.transport_scheme() != TransportScheme::Relay {
            return Err(ScenarioError::WrongTransport {
                expected: TransportScheme::Relay,
            });
        }
        let lease = gate.try_begin()?;

        let mut conn = Transport::for_descriptor(descriptor)?
            .connect_or_accept(config.connect_timeout)
            .await?;
        let outcome = HandshakeEngine::responder(
            descriptor.association_public_key(),
            config.supported_versions.clone(),
        )
        .run(&mut conn, config.handshake_timeout)
        .await?;

        lease.activate();
        let session = WalletSession::establish(conn, outcome, handler, lease.session_id())?;
        let channel = session.channel().clone();
        tokio::spawn(async move {
            channel.closed().await;
            release(lease);
        });
        Ok(session)
    }
}

/// A serving loopback endpoint.
pub struct WalletServer {
    port: u16,
    gate: Arc<SessionGate>,
    sessions: Mutex<mpsc::Receiver<WalletSession>>,
    shutdown: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl WalletServer {
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> SessionState {
        self.gate.state()
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    /// Wait for the next authenticated session.
    pub async fn next_session(&self, timeout: Duration) -> Result<WalletSession, ScenarioError> {
        let mut sessions = self.sessions.lock().await;
        match tokio::time::timeout(timeout, sessions.recv()).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(ScenarioError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout).into()),
        }
    }

    /// Stop accepting and close any live session. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.accept_task.abort();
    }
}

impl Drop for WalletServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    transport: LocalTransport,
    ctx: Arc<ServeContext>,
    sessions: mpsc::Sender<WalletSession>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = transport.accept_next() => {
                match accepted {
                    Ok(conn) => {
                        tokio::spawn(handle_inbound(
                            conn,
                            ctx.clone(),
                            sessions.clone(),
                            shutdown.resubscribe(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal, stopping accept loop");
                break;
            }
        }
    }
}

async fn handle_inbound(
    mut conn: Connection,
    ctx: Arc<ServeContext>,
    sessions: mpsc::Sender<WalletSession>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let remote = conn.peer_addr();
    let lease = match ctx.gate.try_begin() {
        Ok(lease) => lease,
        Err(busy) => {
            tracing::info!(%remote, state = %busy.state, "refusing connection: session busy");
            let refusal = async {
                conn.send_json(&HandshakeMessage::Busy).await?;
                // Drain the initiator's hello so closing does not reset the stream.
                while conn.recv_frame().await?.is_some() {}
                Ok::<_, ProtocolError>(())
            };
            let _ = tokio::time::timeout(ctx.config.handshake_timeout, refusal).await;
            return;
        }
    };

    let engine = HandshakeEngine::responder(
        &ctx.association_public_key,
        ctx.config.supported_versions.clone(),
    );
    let outcome = match engine.run(&mut conn, ctx.config.handshake_timeout).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(%remote, "handshake failed: {e}");
            return;
        }
    };

    lease.activate();
    let session = match WalletSession::establish(conn, outcome, ctx.handler.clone(), lease.session_id()) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%remote, "failed to open channel: {e}");
            return;
        }
    };
    let channel = session.channel().clone();
    if sessions.send(session).await.is_err() {
        return;
    }

    tokio::select! {
        _ = channel.closed() => {}
        _ = shutdown.recv() => channel.close(),
    }
    release(lease);
}

fn release(lease: SessionLease) {
    lease.begin_close();
    tracing::info!(session = lease.session_id(), "session ended");
}
