//! WalletLink Session -- association lifecycle between a dApp and a wallet.
//!
//! Layers, bottom-up:
//!   transport      loopback accept/dial, reflector routing
//!   handshake      ephemeral ECDH bound to the association key
//!   channel        sequenced AEAD envelopes, fail-closed
//!   rpc            correlated calls with per-call deadlines
//!   scenario       dApp-side start/close over all of the above
//!   endpoint       wallet-side accept loop behind a single-session gate
//!   reflector      relay that pairs two connections by session id

pub mod channel;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod handshake;
pub mod reflector;
pub mod rpc;
pub mod scenario;
pub mod session_state;
pub mod transport;

pub use channel::{ChannelError, EncryptedChannel};
pub use client::WalletClient;
pub use config::WalletLinkConfig;
pub use endpoint::{WalletEndpoint, WalletServer, WalletSession};
pub use handshake::{HandshakeEngine, HandshakeError, HandshakeOutcome};
pub use reflector::{Reflector, ReflectorConfig};
pub use rpc::{handler_fn, PendingCall, RequestHandler, RpcEngine, RpcError};
pub use scenario::{HostToken, Scenario, ScenarioConfig, ScenarioError, ScenarioKind};
pub use session_state::{SessionBusy, SessionGate, SessionId, SessionLease, SessionState};
pub use transport::{Connection, LocalTransport, RelayTransport, Transport, TransportError};

use std::path::PathBuf;

/// Expand a leading `~/` to $HOME.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
