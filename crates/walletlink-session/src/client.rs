//! Typed dApp-side handle over a running RPC engine.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use walletlink_protocol::{
    AuthorizeRequest, AuthorizeResult, DeauthorizeRequest, ProtocolVersion, METHOD_AUTHORIZE,
    METHOD_DEAUTHORIZE,
};

use crate::rpc::{PendingCall, RpcEngine, RpcError};

/// Handle returned by a started scenario. Cheap to clone; all clones share
/// one channel.
#[derive(Clone)]
pub struct WalletClient {
    engine: Arc<RpcEngine>,
    default_timeout: Duration,
}

impl WalletClient {
    pub fn new(engine: Arc<RpcEngine>, default_timeout: Duration) -> Self {
        Self {
            engine,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Negotiated protocol version of the underlying channel.
    pub fn version(&self) -> ProtocolVersion {
        self.engine.channel().version()
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    /// Raw call with an explicit timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.engine.call(method, params, timeout).await
    }

    /// Start a call that can be awaited or cancelled later.
    pub async fn begin(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<PendingCall, RpcError> {
        self.engine.begin(method, params, timeout).await
    }

    /// Call with typed params and result under the default timeout.
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, params, self.default_timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<AuthorizeResult, RpcError> {
        self.call_typed(METHOD_AUTHORIZE, request).await
    }

    pub async fn deauthorize(&self, auth_token: &str) -> Result<(), RpcError> {
        let request = DeauthorizeRequest {
            auth_token: auth_token.to_string(),
        };
        let _: Value = self.call_typed(METHOD_DEAUTHORIZE, &request).await?;
        Ok(())
    }
}

impl std::fmt::Debug for WalletClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletClient")
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
