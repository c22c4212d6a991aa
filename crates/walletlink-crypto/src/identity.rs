//! ECDSA P-256 association identity -- keypair generation, loading, signing.
//!
//! The dApp owns one association keypair per association. Its public half is
//! published in the descriptor; the private half signs the dApp's ephemeral
//! handshake key so the wallet can tell it is talking to the descriptor owner.

use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use std::path::Path;

use crate::CryptoError;

/// Association identity wrapping an ECDSA P-256 keypair.
pub struct AssociationKeypair {
    keypair: EcdsaKeyPair,
    pkcs8_doc: Vec<u8>,
    rng: SystemRandom,
}

impl AssociationKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| CryptoError::Identity(e.to_string()))?;
        Self::from_pkcs8_bytes(pkcs8.as_ref().to_vec())
    }

    /// Load keypair from PKCS#8 DER file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let pkcs8_bytes = std::fs::read(path)?;
        Self::from_pkcs8_bytes(pkcs8_bytes)
    }

    /// Load or create keypair at path. New key files are owner-only on unix.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::from_file(path);
        }

        let keypair = Self::generate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &keypair.pkcs8_doc)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(keypair)
    }

    pub fn from_pkcs8_bytes(pkcs8_bytes: Vec<u8>) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let keypair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8_bytes, &rng)
                .map_err(|e| CryptoError::Identity(e.to_string()))?;

        Ok(Self {
            keypair,
            pkcs8_doc: pkcs8_bytes,
            rng,
        })
    }

    /// Uncompressed public point (65 bytes), as published in descriptors.
    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key().as_ref()
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        crate::key_fingerprint(self.public_key())
    }

    /// Fixed-length (r || s) signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sig = self
            .keypair
            .sign(&self.rng, message)
            .map_err(|_| CryptoError::Identity("signing failed".into()))?;
        Ok(sig.as_ref().to_vec())
    }
}

impl std::fmt::Debug for AssociationKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationKeypair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by [`AssociationKeypair::sign`].
pub fn verify_association_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, public_key)
        .verify(message, signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
