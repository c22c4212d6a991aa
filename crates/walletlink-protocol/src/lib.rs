//! WalletLink Protocol -- association descriptors, wire types, frame codec.
//!
//! Ordered byte stream between dApp and wallet (loopback or via reflector).
//! 4-byte big-endian length prefix per frame. Handshake and RPC payloads are
//! serde JSON; encrypted traffic is a binary envelope inside the frame.

pub mod association;
pub mod codec;
pub mod envelope;
pub mod messages;
pub mod version;

pub use association::{AssociationDescriptor, AssociationEndpoint, RelaySessionId, TransportScheme};
pub use codec::FrameCodec;
pub use envelope::Envelope;
pub use messages::*;
pub use version::{negotiate_version, ProtocolVersion, SUPPORTED_VERSIONS};

/// URI scheme of an association descriptor.
pub const DESCRIPTOR_SCHEME: &str = "walletlink";

/// Length of an uncompressed P-256 association public key.
pub const ASSOCIATION_KEY_LEN: usize = 65;

/// Maximum frame payload: 4 MB (a batch of signed transactions fits comfortably).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// AEAD tag length carried at the end of every envelope.
pub const AUTH_TAG_LEN: usize = 16;

/// Default per-call RPC timeout in seconds.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

/// Default transport connect/accept timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default handshake timeout in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Which side of the handshake this endpoint plays.
///
/// The association key holder (the dApp) always initiates. The side that
/// accepts the transport connection is the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed association descriptor: {0}")]
    MalformedDescriptor(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
