//! Scenario -- the dApp-side lifecycle of one association.
//!
//! `start()` runs transport, handshake, channel and RPC setup in order and
//! hands back a [`WalletClient`]. A failure at any stage drops everything
//! built so far. `close()` is idempotent and fails outstanding calls.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use walletlink_crypto::AssociationKeypair;
use walletlink_protocol::{
    AssociationDescriptor, ProtocolError, ProtocolVersion, RelaySessionId, TransportScheme,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_RPC_TIMEOUT_SECS,
    SUPPORTED_VERSIONS,
};

use crate::channel::{ChannelError, EncryptedChannel};
use crate::client::WalletClient;
use crate::handshake::{HandshakeEngine, HandshakeError};
use crate::rpc::RpcEngine;
use crate::session_state::SessionBusy;
use crate::transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Busy(#[from] SessionBusy),
    #[error("expected a {} descriptor", .expected.as_str())]
    WrongTransport { expected: TransportScheme },
    #[error("association keypair does not match the descriptor")]
    KeyMismatch,
    #[error("scenario already started")]
    AlreadyStarted,
    #[error("scenario closed")]
    Closed,
}

/// Timeouts and versions for one session.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub supported_versions: Vec<ProtocolVersion>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
        }
    }
}

/// Opaque token from the host process, carried but never read.
#[derive(Clone, PartialEq, Eq)]
pub struct HostToken(Vec<u8>);

impl HostToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for HostToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostToken({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Wallet on the same device, reached over loopback.
    Local,
    /// Wallet reached through a reflector.
    Remote,
}

enum Lifecycle {
    NotStarted,
    /// Connect and handshake in flight. Dropping the sender cancels them.
    Starting(oneshot::Sender<()>),
    Running(Arc<RpcEngine>),
    Closed,
}

pub struct Scenario {
    descriptor: AssociationDescriptor,
    keypair: Arc<AssociationKeypair>,
    config: ScenarioConfig,
    host_token: Option<HostToken>,
    lifecycle: Mutex<Lifecycle>,
}

impl Scenario {
    /// Associate with a wallet listening on loopback `port`.
    pub fn local(
        keypair: Arc<AssociationKeypair>,
        port: u16,
        config: ScenarioConfig,
    ) -> Result<Self, ScenarioError> {
        let descriptor = AssociationDescriptor::local(
            keypair.public_key().to_vec(),
            config.supported_versions.clone(),
            port,
        )?;
        Ok(Self::build(descriptor, keypair, config))
    }

    /// Associate through the reflector at `host_authority`.
    pub fn remote(
        keypair: Arc<AssociationKeypair>,
        host_authority: &str,
        session_id: RelaySessionId,
        config: ScenarioConfig,
    ) -> Result<Self, ScenarioError> {
        let descriptor = AssociationDescriptor::relay(
            keypair.public_key().to_vec(),
            config.supported_versions.clone(),
            host_authority,
            session_id,
        )?;
        Ok(Self::build(descriptor, keypair, config))
    }

    /// Scenario for an existing descriptor. The keypair must be the
    /// descriptor's association key.
    pub fn from_descriptor(
        descriptor: AssociationDescriptor,
        keypair: Arc<AssociationKeypair>,
        config: ScenarioConfig,
    ) -> Result<Self, ScenarioError> {
        if descriptor.association_public_key() != keypair.public_key() {
            return Err(ScenarioError::KeyMismatch);
        }
        Ok(Self::build(descriptor, keypair, config))
    }

    pub fn from_uri(
        uri: &str,
        keypair: Arc<AssociationKeypair>,
        config: ScenarioConfig,
    ) -> Result<Self, ScenarioError> {
        Self::from_descriptor(AssociationDescriptor::parse(uri)?, keypair, config)
    }

    fn build(
        descriptor: AssociationDescriptor,
        keypair: Arc<AssociationKeypair>,
        config: ScenarioConfig,
    ) -> Self {
        Self {
            descriptor,
            keypair,
            config,
            host_token: None,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn with_host_token(mut self, token: HostToken) -> Self {
        self.host_token = Some(token);
        self
    }

    pub fn host_token(&self) -> Option<&HostToken> {
        self.host_token.as_ref()
    }

    pub fn kind(&self) -> ScenarioKind {
        match self.descriptor.transport_scheme() {
            TransportScheme::Local => ScenarioKind::Local,
            TransportScheme::Relay => ScenarioKind::Remote,
        }
    }

    pub fn descriptor(&self) -> &AssociationDescriptor {
        &self.descriptor
    }

    /// The descriptor URI to hand to the wallet out of band.
    pub fn association_uri(&self) -> String {
        self.descriptor.serialize()
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect, handshake, and start the RPC engine.
    ///
    /// A concurrent [`Scenario::close`] aborts a start in progress, which
    /// then fails with [`ScenarioError::Closed`].
    pub async fn start(&self) -> Result<WalletClient, ScenarioError> {
        let (cancel_tx, mut cancelled) = oneshot::channel();
        {
            let mut lifecycle = self.lifecycle();
            match *lifecycle {
                Lifecycle::NotStarted => {}
                Lifecycle::Starting(_) | Lifecycle::Running(_) => {
                    return Err(ScenarioError::AlreadyStarted)
                }
                Lifecycle::Closed => return Err(ScenarioError::Closed),
            }
            *lifecycle = Lifecycle::Starting(cancel_tx);
        }

        let established = tokio::select! {
            result = self.establish() => result,
            _ = &mut cancelled => {
                tracing::debug!(association = %self.keypair.fingerprint(), "start cancelled by close");
                return Err(ScenarioError::Closed);
            }
        };

        let mut lifecycle = self.lifecycle();
        let still_starting = matches!(*lifecycle, Lifecycle::Starting(_));
        match established {
            Ok(rpc) if still_starting => {
                *lifecycle = Lifecycle::Running(rpc.clone());
                drop(lifecycle);
                tracing::info!(
                    kind = ?self.kind(),
                    association = %self.keypair.fingerprint(),
                    version = %rpc.channel().version(),
                    "scenario started"
                );
                Ok(WalletClient::new(rpc, self.config.rpc_timeout))
            }
            Ok(rpc) => {
                rpc.shutdown();
                Err(ScenarioError::Closed)
            }
            Err(e) => {
                if still_starting {
                    *lifecycle = Lifecycle::NotStarted;
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Arc<RpcEngine>, ScenarioError> {
        let transport = Transport::for_descriptor(&self.descriptor)?;
        let mut conn = transport
            .connect_or_accept(self.config.connect_timeout)
            .await?;

        let engine = HandshakeEngine::initiator(
            self.keypair.clone(),
            self.descriptor.supported_versions().to_vec(),
        );
        let outcome = engine.run(&mut conn, self.config.handshake_timeout).await?;

        let channel = Arc::new(EncryptedChannel::new(conn, outcome.keys, outcome.version)?);
        Ok(Arc::new(RpcEngine::start(channel, None)))
    }

    /// Close the session, or abort a start in progress. Safe to call any
    /// number of times.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Closed);
        match previous {
            Lifecycle::Running(rpc) => {
                rpc.shutdown();
                tracing::info!(association = %self.keypair.fingerprint(), "scenario closed");
            }
            Lifecycle::Starting(cancel) => {
                let _ = cancel.send(());
                tracing::info!(association = %self.keypair.fingerprint(), "scenario closed while starting");
            }
            Lifecycle::NotStarted | Lifecycle::Closed => {}
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }
}
