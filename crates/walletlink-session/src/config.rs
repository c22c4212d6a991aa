//! Configuration types for walletlink.
//! Parsed from ~/.walletlink/config.toml.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use walletlink_protocol::{
    ProtocolVersion, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_RPC_TIMEOUT_SECS, SUPPORTED_VERSIONS,
};

use crate::reflector::ReflectorConfig;
use crate::scenario::ScenarioConfig;

/// Upper bound for any configured timeout or TTL: one day.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WalletLinkConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reflector: ReflectorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_association_key")]
    pub association_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_versions")]
    pub supported_versions: Vec<u32>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            association_key: default_association_key(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            supported_versions: default_versions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,
    #[serde(default = "default_token_timeout")]
    pub token_timeout_secs: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub accept_unregistered: bool,
}

impl Default for ReflectorSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            pairing_timeout_secs: default_pairing_timeout(),
            token_timeout_secs: default_token_timeout(),
            session_ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            accept_unregistered: false,
        }
    }
}

// Default value functions
fn default_association_key() -> String {
    "~/.walletlink/association.key".into()
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}
fn default_rpc_timeout() -> u64 {
    DEFAULT_RPC_TIMEOUT_SECS
}
fn default_versions() -> Vec<u32> {
    SUPPORTED_VERSIONS.iter().map(|v| v.0).collect()
}
fn default_listen_addr() -> String {
    "0.0.0.0:9480".into()
}
fn default_pairing_timeout() -> u64 {
    30
}
fn default_token_timeout() -> u64 {
    5
}
fn default_session_ttl() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}

impl WalletLinkConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: WalletLinkConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session.supported_versions.is_empty() {
            anyhow::bail!("session.supported_versions must list at least one version");
        }
        let timeouts = [
            ("session.connect_timeout_secs", self.session.connect_timeout_secs),
            ("session.handshake_timeout_secs", self.session.handshake_timeout_secs),
            ("session.rpc_timeout_secs", self.session.rpc_timeout_secs),
            ("reflector.pairing_timeout_secs", self.reflector.pairing_timeout_secs),
            ("reflector.token_timeout_secs", self.reflector.token_timeout_secs),
            ("reflector.session_ttl_secs", self.reflector.session_ttl_secs),
            ("reflector.sweep_interval_secs", self.reflector.sweep_interval_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                anyhow::bail!("{name} must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}");
            }
        }
        self.reflector_listen_addr()?;
        Ok(())
    }

    pub fn reflector_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.reflector
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid reflector.listen_addr {:?}: {e}", self.reflector.listen_addr))
    }

    pub fn scenario_config(&self) -> ScenarioConfig {
        ScenarioConfig {
            connect_timeout: Duration::from_secs(self.session.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout_secs),
            rpc_timeout: Duration::from_secs(self.session.rpc_timeout_secs),
            supported_versions: self
                .session
                .supported_versions
                .iter()
                .copied()
                .map(ProtocolVersion)
                .collect(),
        }
    }

    pub fn reflector_config(&self) -> ReflectorConfig {
        ReflectorConfig {
            pairing_timeout: Duration::from_secs(self.reflector.pairing_timeout_secs),
            token_timeout: Duration::from_secs(self.reflector.token_timeout_secs),
            session_ttl: Duration::from_secs(self.reflector.session_ttl_secs),
            sweep_interval: Duration::from_secs(self.reflector.sweep_interval_secs),
            accept_unregistered: self.reflector.accept_unregistered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = WalletLinkConfig::default();
        assert_eq!(cfg.session.rpc_timeout_secs, 30);
        assert_eq!(cfg.session.supported_versions, vec![2, 1]);
        assert!(!cfg.reflector.accept_unregistered);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[session]
association_key = "/tmp/assoc.key"
rpc_timeout_secs = 5
supported_versions = [1]

[reflector]
listen_addr = "127.0.0.1:9999"
accept_unregistered = true
"#;

        let cfg: WalletLinkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.session.association_key, "/tmp/assoc.key");
        assert_eq!(cfg.session.handshake_timeout_secs, 10);

        let scenario = cfg.scenario_config();
        assert_eq!(scenario.rpc_timeout, Duration::from_secs(5));
        assert_eq!(scenario.supported_versions, vec![ProtocolVersion::V1]);

        let reflector = cfg.reflector_config();
        assert!(reflector.accept_unregistered);
        assert_eq!(reflector.pairing_timeout, Duration::from_secs(30));
        assert_eq!(
            cfg.reflector_listen_addr().unwrap(),
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_empty_versions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nsupported_versions = []\n").unwrap();
        assert!(WalletLinkConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nrpc_timeout_secs = 9223372036854775807\n").unwrap();
        let err = WalletLinkConfig::load_or_default(&path).unwrap_err();
        assert!(err.to_string().contains("session.rpc_timeout_secs"));

        let mut cfg = WalletLinkConfig::default();
        cfg.session.rpc_timeout_secs = MAX_TIMEOUT_SECS;
        cfg.validate().unwrap();
        cfg.reflector.pairing_timeout_secs = MAX_TIMEOUT_SECS + 1;
        assert!(cfg.validate().is_err());
        cfg.reflector.pairing_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WalletLinkConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.session.connect_timeout_secs, 30);
    }

    #[test]
    fn test_serialise_default() {
        let cfg = WalletLinkConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("pairing_timeout_secs"));
    }
}
