//! WalletLink Crypto -- association identity, ephemeral agreement, envelope AEAD.
//!
//! - Identity: ECDSA P-256 (fixed-length signatures)
//! - Agreement: ephemeral ECDH P-256, HKDF-SHA256 salted with the association key
//! - Envelopes: AES-256-GCM, 12-byte deterministic nonce, 16-byte auth tag
//!
//! Nonce = sender role byte || 7 zero bytes || sequence (u32 big-endian).
//! Each direction has its own nonce space, and a sequence number is used at
//! most once per direction, so a (key, nonce) pair never repeats.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use sha2::{Digest, Sha256};
use walletlink_protocol::{Envelope, Role, AUTH_TAG_LEN};

pub mod agreement;
pub mod identity;

// Re-exports
pub use agreement::{DerivationContext, EphemeralKeyPair, SessionKeyMaterial, SHARED_SECRET_LEN};
pub use identity::{verify_association_signature, AssociationKeypair};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
    #[error("ephemeral key generation failed")]
    KeyGeneration,
    #[error("key agreement failed")]
    Agreement,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("association signature invalid")]
    InvalidSignature,
    #[error("identity error: {0}")]
    Identity(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope sealing/opening for one side of a channel.
pub struct SessionCipher {
    key: LessSafeKey,
    role: Role,
}

impl SessionCipher {
    pub fn new(material: &SessionKeyMaterial) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, material.shared_secret())
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            role: material.role,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Encrypt an outgoing payload under `sequence`.
    ///
    /// The caller owns sequence bookkeeping and must never reuse a value.
    pub fn seal(&self, sequence: u32, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let mut in_out = plaintext.to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(
                nonce_for(self.role, sequence),
                Aad::from(Envelope::aad(sequence)),
                &mut in_out,
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut auth_tag = [0u8; AUTH_TAG_LEN];
        auth_tag.copy_from_slice(tag.as_ref());

        Ok(Envelope {
            sequence,
            ciphertext: in_out,
            auth_tag,
        })
    }

    /// Verify and decrypt an envelope sent by the peer.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        // ring expects ciphertext + auth_tag concatenated
        let mut in_out = Vec::with_capacity(envelope.ciphertext.len() + AUTH_TAG_LEN);
        in_out.extend_from_slice(&envelope.ciphertext);
        in_out.extend_from_slice(&envelope.auth_tag);

        let plaintext = self
            .key
            .open_in_place(
                nonce_for(self.role.peer(), envelope.sequence),
                Aad::from(Envelope::aad(envelope.sequence)),
                &mut in_out,
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(plaintext.to_vec())
    }
}

fn nonce_for(sender: Role, sequence: u32) -> Nonce {
    Nonce::assume_unique_for_key(nonce_bytes(sender, sequence))
}

fn nonce_bytes(sender: Role, sequence: u32) -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[0] = match sender {
        Role::Initiator => 0x01,
        Role::Responder => 0x02,
    };
    bytes[NONCE_LEN - 4..].copy_from_slice(&sequence.to_be_bytes());
    bytes
}

/// First 8 bytes of SHA-256(public key), hex. Used in logs and the CLI.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}
