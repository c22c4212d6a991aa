//! Ephemeral ECDH P-256 agreement and session key derivation.
//!
//! `shared_secret = HKDF-SHA256(salt = association public key,
//!                              ikm  = ECDH(ephemeral, peer ephemeral),
//!                              info = label || initiator eph || responder eph || version)`
//!
//! The ephemeral private key is consumed by the agreement and the raw ECDH
//! output never leaves the derivation closure.

use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256};
use ring::hkdf;
use ring::rand::SystemRandom;
use walletlink_protocol::Role;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// HKDF info label, prefixed to the transcript.
const HKDF_LABEL: &[u8] = b"walletlink session v1";

/// Derived secret length (AES-256 key).
pub const SHARED_SECRET_LEN: usize = 32;

/// Key material for one channel. Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    shared_secret: [u8; SHARED_SECRET_LEN],
    /// Starting send counter. The channel copies it once at construction
    /// and tracks the live value itself; this field is never advanced.
    pub send_sequence: u32,
    /// Starting receive counter, copied the same way.
    pub receive_sequence: u32,
    #[zeroize(skip)]
    pub role: Role,
}

impl SessionKeyMaterial {
    /// Material from an already-derived secret. Sequences start at zero.
    pub fn from_secret(shared_secret: [u8; SHARED_SECRET_LEN], role: Role) -> Self {
        Self {
            shared_secret,
            send_sequence: 0,
            receive_sequence: 0,
            role,
        }
    }

    pub fn shared_secret(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.shared_secret
    }
}

impl std::fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("role", &self.role)
            .field("send_sequence", &self.send_sequence)
            .field("receive_sequence", &self.receive_sequence)
            .finish_non_exhaustive()
    }
}

/// Inputs that bind the derived secret to this association and transcript.
#[derive(Debug, Clone, Copy)]
pub struct DerivationContext<'a> {
    pub association_public_key: &'a [u8],
    pub initiator_ephemeral: &'a [u8],
    pub responder_ephemeral: &'a [u8],
    pub version: u32,
}

struct SecretLen(usize);

impl hkdf::KeyType for SecretLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// One-shot ephemeral keypair for a single handshake.
pub struct EphemeralKeyPair {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

impl EphemeralKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| CryptoError::KeyGeneration)?;
        let public = private
            .compute_public_key()
            .map_err(|_| CryptoError::KeyGeneration)?
            .as_ref()
            .to_vec();
        Ok(Self { private, public })
    }

    /// Uncompressed public point to send in the hello.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Agree with the peer's ephemeral key and derive this side's key material.
    pub fn derive(
        self,
        peer_public_key: &[u8],
        context: &DerivationContext<'_>,
        role: Role,
    ) -> Result<SessionKeyMaterial, CryptoError> {
        let peer = UnparsedPublicKey::new(&ECDH_P256, peer_public_key);
        agreement::agree_ephemeral(self.private, &peer, |agreed: &[u8]| -> Result<SessionKeyMaterial, CryptoError> {
            let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, context.association_public_key);
            let prk = salt.extract(agreed);
            let version = context.version.to_be_bytes();
            let info: [&[u8]; 4] = [
                HKDF_LABEL,
                context.initiator_ephemeral,
                context.responder_ephemeral,
                &version,
            ];
            let okm = prk
                .expand(&info, SecretLen(SHARED_SECRET_LEN))
                .map_err(|_| CryptoError::KeyDerivation)?;

            let mut material = SessionKeyMaterial::from_secret([0u8; SHARED_SECRET_LEN], role);
            okm.fill(&mut material.shared_secret)
                .map_err(|_| CryptoError::KeyDerivation)?;
            Ok(material)
        })
        .map_err(|_| CryptoError::Agreement)?
    }
}
