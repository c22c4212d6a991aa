//! Handshake -- one hello each way, ephemeral ECDH, association-bound KDF.
//!
//! The initiator (association key holder) speaks first and signs its
//! ephemeral key with the association keypair. The responder verifies the
//! signature before answering, so an unauthenticated initiator learns
//! nothing but a closed stream.

use std::sync::Arc;
use std::time::Duration;

use walletlink_crypto::{
    verify_association_signature, AssociationKeypair, CryptoError, DerivationContext,
    EphemeralKeyPair, SessionKeyMaterial,
};
use walletlink_protocol::{
    negotiate_version, HandshakeMessage, Hello, ProtocolError, ProtocolVersion, Role,
    ASSOCIATION_KEY_LEN,
};

use crate::transport::Connection;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("no common protocol version (ours {ours:?}, theirs {theirs:?})")]
    VersionMismatch {
        ours: Vec<ProtocolVersion>,
        theirs: Vec<ProtocolVersion>,
    },
    #[error("handshake integrity failure: {0}")]
    IntegrityFailure(String),
    #[error("wallet endpoint is busy with another session")]
    SessionBusy,
    #[error("peer closed the connection during the handshake")]
    ConnectionClosed,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub keys: SessionKeyMaterial,
    pub version: ProtocolVersion,
}

enum Identity {
    Initiator(Arc<AssociationKeypair>),
    Responder { association_public_key: Vec<u8> },
}

pub struct HandshakeEngine {
    identity: Identity,
    versions: Vec<ProtocolVersion>,
}

impl HandshakeEngine {
    /// dApp side: holds the association keypair.
    pub fn initiator(keypair: Arc<AssociationKeypair>, versions: Vec<ProtocolVersion>) -> Self {
        Self {
            identity: Identity::Initiator(keypair),
            versions,
        }
    }

    /// Wallet side: knows the association public key from the descriptor.
    pub fn responder(association_public_key: &[u8], versions: Vec<ProtocolVersion>) -> Self {
        Self {
            identity: Identity::Responder {
                association_public_key: association_public_key.to_vec(),
            },
            versions,
        }
    }

    pub fn role(&self) -> Role {
        match self.identity {
            Identity::Initiator(_) => Role::Initiator,
            Identity::Responder { .. } => Role::Responder,
        }
    }

    fn association_public_key(&self) -> &[u8] {
        match &self.identity {
            Identity::Initiator(keypair) => keypair.public_key(),
            Identity::Responder {
                association_public_key,
            } => association_public_key,
        }
    }

    /// Run the exchange over `conn`, bounded by `timeout` as a whole.
    pub async fn run(
        &self,
        conn: &mut Connection,
        timeout: Duration,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let outcome = tokio::time::timeout(timeout, self.exchange(conn))
            .await
            .map_err(|_| HandshakeError::Timeout(timeout))??;

        tracing::info!(
            role = self.role().as_str(),
            version = %outcome.version,
            peer = %conn.peer_addr(),
            "handshake complete"
        );
        Ok(outcome)
    }

    async fn exchange(&self, conn: &mut Connection) -> Result<HandshakeOutcome, HandshakeError> {
        let ephemeral = EphemeralKeyPair::generate()?;
        let ours = self.hello(&ephemeral)?;

        let theirs = match &self.identity {
            Identity::Initiator(_) => {
                conn.send_json(&HandshakeMessage::Hello(ours)).await?;
                read_hello(conn).await?
            }
            Identity::Responder {
                association_public_key,
            } => {
                let theirs = read_hello(conn).await?;
                let signature = theirs.association_signature.as_deref().ok_or_else(|| {
                    HandshakeError::IntegrityFailure("initiator hello is not signed".into())
                })?;
                verify_association_signature(association_public_key, &theirs.ephemeral_key, signature)
                    .map_err(|_| {
                        HandshakeError::IntegrityFailure(
                            "initiator hello signature does not match the association key".into(),
                        )
                    })?;
                // Answer before negotiating so a mismatch is visible on both sides.
                conn.send_json(&HandshakeMessage::Hello(ours)).await?;
                theirs
            }
        };

        let version = negotiate_version(&self.versions, &theirs.versions).ok_or_else(|| {
            HandshakeError::VersionMismatch {
                ours: self.versions.clone(),
                theirs: theirs.versions.clone(),
            }
        })?;

        let own_public = ephemeral.public_key().to_vec();
        let (initiator_ephemeral, responder_ephemeral) = match self.role() {
            Role::Initiator => (own_public.as_slice(), theirs.ephemeral_key.as_slice()),
            Role::Responder => (theirs.ephemeral_key.as_slice(), own_public.as_slice()),
        };
        let context = DerivationContext {
            association_public_key: self.association_public_key(),
            initiator_ephemeral,
            responder_ephemeral,
            version: version.0,
        };
        let keys = ephemeral
            .derive(&theirs.ephemeral_key, &context, self.role())
            .map_err(|e| match e {
                CryptoError::Agreement => {
                    HandshakeError::IntegrityFailure("peer ephemeral key rejected".into())
                }
                other => HandshakeError::Crypto(other),
            })?;

        Ok(HandshakeOutcome { keys, version })
    }

    fn hello(&self, ephemeral: &EphemeralKeyPair) -> Result<Hello, HandshakeError> {
        let association_signature = match &self.identity {
            Identity::Initiator(keypair) => Some(keypair.sign(ephemeral.public_key())?),
            Identity::Responder { .. } => None,
        };
        Ok(Hello {
            ephemeral_key: ephemeral.public_key().to_vec(),
            versions: self.versions.clone(),
            association_signature,
        })
    }
}

/// Read the peer's hello, mapping refusals and malformed input.
async fn read_hello(conn: &mut Connection) -> Result<Hello, HandshakeError> {
    let message = match conn.recv_json::<HandshakeMessage>().await {
        Ok(Some(message)) => message,
        Ok(None) => return Err(HandshakeError::ConnectionClosed),
        Err(ProtocolError::Json(e)) => {
            return Err(HandshakeError::IntegrityFailure(format!("malformed hello: {e}")))
        }
        Err(ProtocolError::FrameTooLarge { size, .. }) => {
            return Err(HandshakeError::IntegrityFailure(format!(
                "oversized hello ({size} bytes)"
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let hello = match message {
        HandshakeMessage::Hello(hello) => hello,
        HandshakeMessage::Busy => return Err(HandshakeError::SessionBusy),
    };

    if hello.ephemeral_key.len() != ASSOCIATION_KEY_LEN || hello.ephemeral_key[0] != 0x04 {
        return Err(HandshakeError::IntegrityFailure(
            "peer ephemeral key is not an uncompressed P-256 point".into(),
        ));
    }
    if hello.versions.is_empty() {
        return Err(HandshakeError::IntegrityFailure(
            "peer advertised no protocol versions".into(),
        ));
    }
    Ok(hello)
}
