//! Test harness for in-process dApp/wallet sessions over real sockets.
//!
//! Provides a demo wallet request handler, a loopback pair builder and a
//! reflector-backed relay setup, all in the same tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use walletlink_crypto::AssociationKeypair;
use walletlink_protocol::{
    AuthorizeRequest, AuthorizeResult, AuthorizedAccount, IdentityDescriptor, RpcErrorObject,
    RpcRequest, METHOD_AUTHORIZE, METHOD_DEAUTHORIZE, SUPPORTED_VERSIONS,
};
use walletlink_session::{
    handler_fn, Reflector, ReflectorConfig, RequestHandler, Scenario, ScenarioConfig,
    WalletClient, WalletEndpoint, WalletServer, WalletSession,
};

/// Upper bound for any single step in these tests.
pub const STEP: Duration = Duration::from_secs(5);

pub const TEST_AUTH_TOKEN: &str = "auth-token-1";

pub fn test_config() -> ScenarioConfig {
    ScenarioConfig {
        connect_timeout: STEP,
        handshake_timeout: STEP,
        rpc_timeout: Duration::from_secs(30),
        supported_versions: SUPPORTED_VERSIONS.to_vec(),
    }
}

pub fn keypair() -> Arc<AssociationKeypair> {
    Arc::new(AssociationKeypair::generate().unwrap())
}

pub fn authorize_request() -> AuthorizeRequest {
    AuthorizeRequest {
        identity: IdentityDescriptor {
            uri: Some("https://dapp.example".into()),
            icon: Some("favicon.ico".into()),
            name: Some("Example dApp".into()),
        },
        chain: Some("devnet".into()),
        auth_token: None,
    }
}

/// Wallet behaviour used by every test:
///   authorize   -> one account, fixed token
///   deauthorize -> null
///   echo        -> params back
///   sleep       -> waits params.ms, then answers
///   hang        -> never answers
pub fn demo_wallet() -> RequestHandler {
    handler_fn(demo_wallet_call)
}

async fn demo_wallet_call(request: RpcRequest) -> Result<Value, RpcErrorObject> {
    match request.method.as_str() {
        METHOD_AUTHORIZE => {
            let req: AuthorizeRequest = serde_json::from_value(request.params)
                .map_err(|e| RpcErrorObject::new(RpcErrorObject::INVALID_PARAMS, e.to_string()))?;
            if req.identity.name.is_none() {
                return Err(RpcErrorObject::new(
                    RpcErrorObject::AUTHORIZATION_FAILED,
                    "identity name required",
                ));
            }
            let result = AuthorizeResult {
                auth_token: TEST_AUTH_TOKEN.into(),
                accounts: vec![AuthorizedAccount {
                    address: vec![0xA5; 32],
                    label: Some("main".into()),
                }],
                wallet_uri_base: None,
            };
            serde_json::to_value(result)
                .map_err(|e| RpcErrorObject::new(RpcErrorObject::INTERNAL_ERROR, e.to_string()))
        }
        METHOD_DEAUTHORIZE => Ok(Value::Null),
        "echo" => Ok(request.params),
        "sleep" => {
            let ms = request.params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        }
        "hang" => std::future::pending().await,
        other => Err(RpcErrorObject::method_not_found(other)),
    }
}

/// Wallet serving on an ephemeral loopback port, plus the dApp scenario
/// that targets it.
pub struct LocalSetup {
    pub keypair: Arc<AssociationKeypair>,
    pub scenario: Scenario,
    pub server: WalletServer,
}

pub async fn local_setup() -> LocalSetup {
    local_setup_with(test_config()).await
}

pub async fn local_setup_with(config: ScenarioConfig) -> LocalSetup {
    let keypair = keypair();
    let endpoint = WalletEndpoint::bind_local(0).await.unwrap();
    let scenario = Scenario::local(keypair.clone(), endpoint.local_port(), config.clone()).unwrap();
    let server = endpoint.serve(scenario.descriptor(), demo_wallet(), config);
    LocalSetup {
        keypair,
        scenario,
        server,
    }
}

/// A second scenario for the same wallet port.
pub fn another_scenario(setup: &LocalSetup, keypair: Arc<AssociationKeypair>) -> Scenario {
    Scenario::local(keypair, setup.server.local_port(), test_config()).unwrap()
}

/// Start the scenario and collect the wallet-side session.
pub async fn connect(setup: &LocalSetup) -> (WalletClient, WalletSession) {
    let client = setup.scenario.start().await.unwrap();
    let session = setup.server.next_session(STEP).await.unwrap();
    (client, session)
}

pub async fn reflector(config: ReflectorConfig) -> Reflector {
    Reflector::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap()
}
