//! Association descriptors -- the out-of-band URI that tells a wallet how to
//! reach a dApp session and which identity key to authenticate.
//!
//! ```text
//! walletlink:/v1/associate/local?association=<b64url key>&port=<u16>&v=2&v=1
//! walletlink:/v1/associate/remote?association=<b64url key>&reflector=<host>&id=<b64url id>&v=2
//! ```
//!
//! Parsing is pure: no I/O, no crypto beyond checking the key shape.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

use crate::version::ProtocolVersion;
use crate::{ProtocolError, ASSOCIATION_KEY_LEN, DESCRIPTOR_SCHEME};

const PATH_LOCAL: &str = "/v1/associate/local";
const PATH_REMOTE: &str = "/v1/associate/remote";

/// Length of reflector-issued session ids.
pub const RELAY_SESSION_ID_LEN: usize = 16;

/// Opaque routing token a reflector uses to pair two connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelaySessionId(Vec<u8>);

impl RelaySessionId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Fresh random id.
    pub fn random() -> Self {
        let mut bytes = vec![0u8; RELAY_SESSION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_base64url(s: &str) -> Result<Self, ProtocolError> {
        let bytes = decode_b64url(s)
            .map_err(|e| malformed(format!("relay session id is not base64url: {e}")))?;
        if bytes.is_empty() {
            return Err(malformed("relay session id is empty"));
        }
        Ok(Self(bytes))
    }
}

impl From<&str> for RelaySessionId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for RelaySessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64url())
    }
}

/// How the two parties reach each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScheme {
    Local,
    Relay,
}

impl TransportScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportScheme::Local => "local",
            TransportScheme::Relay => "relay",
        }
    }
}

/// Scheme-specific addressing. Relay fields exist only on the relay variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEndpoint {
    /// Wallet listens on this loopback port.
    Local { port: u16 },
    /// Both parties meet at a reflector under a shared session id.
    Relay {
        host_authority: String,
        session_id: RelaySessionId,
    },
}

/// Parsed association descriptor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDescriptor {
    association_public_key: Vec<u8>,
    supported_versions: Vec<ProtocolVersion>,
    endpoint: AssociationEndpoint,
}

impl AssociationDescriptor {
    /// Descriptor for a wallet listening on a loopback port.
    pub fn local(
        association_public_key: Vec<u8>,
        supported_versions: Vec<ProtocolVersion>,
        port: u16,
    ) -> Result<Self, ProtocolError> {
        Self::build(
            association_public_key,
            supported_versions,
            AssociationEndpoint::Local { port },
        )
    }

    /// Descriptor for a session relayed through a reflector.
    pub fn relay(
        association_public_key: Vec<u8>,
        supported_versions: Vec<ProtocolVersion>,
        host_authority: impl Into<String>,
        session_id: RelaySessionId,
    ) -> Result<Self, ProtocolError> {
        Self::build(
            association_public_key,
            supported_versions,
            AssociationEndpoint::Relay {
                host_authority: host_authority.into(),
                session_id,
            },
        )
    }

    fn build(
        association_public_key: Vec<u8>,
        supported_versions: Vec<ProtocolVersion>,
        endpoint: AssociationEndpoint,
    ) -> Result<Self, ProtocolError> {
        validate_association_key(&association_public_key)?;
        if supported_versions.is_empty() {
            return Err(malformed("no protocol versions"));
        }
        match &endpoint {
            AssociationEndpoint::Local { port } => {
                if *port == 0 {
                    return Err(malformed("local port must be non-zero"));
                }
            }
            AssociationEndpoint::Relay {
                host_authority,
                session_id,
            } => {
                validate_authority(host_authority)?;
                if session_id.as_bytes().is_empty() {
                    return Err(malformed("relay session id is empty"));
                }
            }
        }
        Ok(Self {
            association_public_key,
            supported_versions,
            endpoint,
        })
    }

    /// Parse a descriptor URI.
    pub fn parse(uri: &str) -> Result<Self, ProtocolError> {
        let rest = uri
            .strip_prefix(DESCRIPTOR_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| malformed("unrecognized URI scheme"))?;

        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let scheme = match path {
            PATH_LOCAL => TransportScheme::Local,
            PATH_REMOTE => TransportScheme::Relay,
            other => return Err(malformed(format!("unrecognized transport path {other:?}"))),
        };

        let mut association = None;
        let mut port = None;
        let mut reflector = None;
        let mut id = None;
        let mut versions = Vec::new();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| malformed(format!("query parameter without value: {pair:?}")))?;
            match key {
                "association" => set_once(&mut association, key, value)?,
                "port" => set_once(&mut port, key, value)?,
                "reflector" => set_once(&mut reflector, key, value)?,
                "id" => set_once(&mut id, key, value)?,
                "v" => {
                    let v: u32 = value
                        .parse()
                        .map_err(|_| malformed(format!("invalid protocol version {value:?}")))?;
                    versions.push(ProtocolVersion(v));
                }
                // Unknown parameters are ignored so newer dApps stay parseable.
                _ => {}
            }
        }

        let key_b64 = association.ok_or_else(|| malformed("missing association public key"))?;
        let key = decode_b64url(key_b64)
            .map_err(|e| malformed(format!("association key is not base64url: {e}")))?;

        let endpoint = match scheme {
            TransportScheme::Local => {
                if reflector.is_some() || id.is_some() {
                    return Err(malformed("relay fields present on a local association"));
                }
                let port = port.ok_or_else(|| malformed("local association without port"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| malformed(format!("invalid port {port:?}")))?;
                AssociationEndpoint::Local { port }
            }
            TransportScheme::Relay => {
                if port.is_some() {
                    return Err(malformed("port present on a relay association"));
                }
                match (reflector, id) {
                    (Some(host), Some(id)) => AssociationEndpoint::Relay {
                        host_authority: host.to_string(),
                        session_id: RelaySessionId::from_base64url(id)?,
                    },
                    _ => {
                        return Err(malformed(
                            "relay association needs both reflector and id",
                        ))
                    }
                }
            }
        };

        Self::build(key, versions, endpoint)
    }

    /// Canonical URI form. `parse(serialize(d)) == d`.
    pub fn serialize(&self) -> String {
        let key = URL_SAFE_NO_PAD.encode(&self.association_public_key);
        let mut out = match &self.endpoint {
            AssociationEndpoint::Local { port } => {
                format!("{DESCRIPTOR_SCHEME}:{PATH_LOCAL}?association={key}&port={port}")
            }
            AssociationEndpoint::Relay {
                host_authority,
                session_id,
            } => format!(
                "{DESCRIPTOR_SCHEME}:{PATH_REMOTE}?association={key}&reflector={host_authority}&id={}",
                session_id.to_base64url()
            ),
        };
        for v in &self.supported_versions {
            out.push_str(&format!("&v={}", v.0));
        }
        out
    }

    pub fn association_public_key(&self) -> &[u8] {
        &self.association_public_key
    }

    pub fn supported_versions(&self) -> &[ProtocolVersion] {
        &self.supported_versions
    }

    pub fn endpoint(&self) -> &AssociationEndpoint {
        &self.endpoint
    }

    pub fn transport_scheme(&self) -> TransportScheme {
        match self.endpoint {
            AssociationEndpoint::Local { .. } => TransportScheme::Local,
            AssociationEndpoint::Relay { .. } => TransportScheme::Relay,
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        match self.endpoint {
            AssociationEndpoint::Local { port } => Some(port),
            AssociationEndpoint::Relay { .. } => None,
        }
    }

    pub fn relay_host_authority(&self) -> Option<&str> {
        match &self.endpoint {
            AssociationEndpoint::Relay { host_authority, .. } => Some(host_authority.as_str()),
            AssociationEndpoint::Local { .. } => None,
        }
    }

    pub fn relay_session_id(&self) -> Option<&RelaySessionId> {
        match &self.endpoint {
            AssociationEndpoint::Relay { session_id, .. } => Some(session_id),
            AssociationEndpoint::Local { .. } => None,
        }
    }
}

impl FromStr for AssociationDescriptor {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AssociationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedDescriptor(msg.into())
}

fn set_once<'a>(slot: &mut Option<&'a str>, key: &str, value: &'a str) -> Result<(), ProtocolError> {
    if slot.replace(value).is_some() {
        return Err(malformed(format!("duplicate parameter {key:?}")));
    }
    Ok(())
}

/// Accept padded or unpadded base64url.
fn decode_b64url(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))
}

/// Association keys are uncompressed P-256 points.
fn validate_association_key(key: &[u8]) -> Result<(), ProtocolError> {
    if key.len() != ASSOCIATION_KEY_LEN {
        return Err(malformed(format!(
            "association key is {} bytes, expected {ASSOCIATION_KEY_LEN}",
            key.len()
        )));
    }
    if key[0] != 0x04 {
        return Err(malformed("association key is not an uncompressed point"));
    }
    Ok(())
}

fn validate_authority(host: &str) -> Result<(), ProtocolError> {
    if host.is_empty() {
        return Err(malformed("empty reflector authority"));
    }
    if host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '&' | '='))
    {
        return Err(malformed(format!("invalid reflector authority {host:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> Vec<u8> {
        let mut key = vec![0x04];
        key.extend((1..=64u8).collect::<Vec<_>>());
        key
    }

    fn b64(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    #[test]
    fn test_parse_local() {
        let uri = format!(
            "walletlink:/v1/associate/local?association={}&port=49152&v=2&v=1",
            b64(&test_key())
        );
        let d = AssociationDescriptor::parse(&uri).unwrap();
        assert_eq!(d.transport_scheme(), TransportScheme::Local);
        assert_eq!(d.local_port(), Some(49152));
        assert_eq!(d.association_public_key(), &test_key()[..]);
        assert_eq!(
            d.supported_versions(),
            &[ProtocolVersion(2), ProtocolVersion(1)]
        );
        assert!(d.relay_host_authority().is_none());
        assert!(d.relay_session_id().is_none());
    }

    #[test]
    fn test_parse_remote() {
        let uri = format!(
            "walletlink:/v1/associate/remote?association={}&reflector=reflector.example.com:8443&id={}&v=1",
            b64(&test_key()),
            b64(b"abc123")
        );
        let d: AssociationDescriptor = uri.parse().unwrap();
        assert_eq!(d.transport_scheme(), TransportScheme::Relay);
        assert_eq!(d.relay_host_authority(), Some("reflector.example.com:8443"));
        assert_eq!(d.relay_session_id(), Some(&RelaySessionId::from("abc123")));
        assert_eq!(d.local_port(), None);
    }

    #[test]
    fn test_serialize_is_canonical() {
        let d = AssociationDescriptor::local(test_key(), vec![ProtocolVersion(2)], 8080).unwrap();
        let s = d.serialize();
        assert!(s.starts_with("walletlink:/v1/associate/local?association="));
        assert!(s.ends_with("&port=8080&v=2"));
        assert_eq!(d.to_string(), s);
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = AssociationDescriptor::parse("walletlink:/v1/associate/local?port=1&v=1");
        assert!(matches!(err, Err(ProtocolError::MalformedDescriptor(_))));
    }

    #[test]
    fn test_short_key_rejected() {
        let uri = format!(
            "walletlink:/v1/associate/local?association={}&port=1&v=1",
            b64(&[0x04; 33])
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());
    }

    #[test]
    fn test_compressed_key_rejected() {
        let mut key = test_key();
        key[0] = 0x02;
        assert!(AssociationDescriptor::local(key, vec![ProtocolVersion(1)], 1).is_err());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let uri = format!(
            "https:/v1/associate/local?association={}&port=1&v=1",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());

        let uri = format!(
            "walletlink:/v1/associate/bluetooth?association={}&v=1",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());
    }

    #[test]
    fn test_relay_fields_inconsistent_with_scheme() {
        // Relay id on a local association
        let uri = format!(
            "walletlink:/v1/associate/local?association={}&port=1&id=YWJj&v=1",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());

        // Reflector without id
        let uri = format!(
            "walletlink:/v1/associate/remote?association={}&reflector=host&v=1",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());

        // Id without reflector
        let uri = format!(
            "walletlink:/v1/associate/remote?association={}&id=YWJj&v=1",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());
    }

    #[test]
    fn test_versions_required() {
        let uri = format!(
            "walletlink:/v1/associate/local?association={}&port=1",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());

        let uri = format!(
            "walletlink:/v1/associate/local?association={}&port=1&v=two",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let uri = format!(
            "walletlink:/v1/associate/local?association={k}&association={k}&port=1&v=1",
            k = b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_err());
    }

    #[test]
    fn test_unknown_parameter_ignored() {
        let uri = format!(
            "walletlink:/v1/associate/local?association={}&port=9&v=1&future=yes",
            b64(&test_key())
        );
        assert!(AssociationDescriptor::parse(&uri).is_ok());
    }

    #[test]
    fn test_padded_key_accepted() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode(test_key());
        let uri = format!("walletlink:/v1/associate/local?association={padded}&port=9&v=1");
        let d = AssociationDescriptor::parse(&uri).unwrap();
        assert_eq!(d.association_public_key(), &test_key()[..]);
    }

    #[test]
    fn test_relay_session_id_random_unique() {
        let a = RelaySessionId::random();
        let b = RelaySessionId::random();
        assert_eq!(a.as_bytes().len(), RELAY_SESSION_ID_LEN);
        assert_ne!(a, b);
    }

    fn arb_descriptor() -> impl Strategy<Value = AssociationDescriptor> {
        let key = proptest::collection::vec(any::<u8>(), 64).prop_map(|tail| {
            let mut key = vec![0x04];
            key.extend(tail);
            key
        });
        let versions = proptest::collection::vec(0u32..1000, 1..5)
            .prop_map(|v| v.into_iter().map(ProtocolVersion).collect::<Vec<_>>());
        let local = (1u16..=u16::MAX).prop_map(|port| AssociationEndpoint::Local { port });
        let relay = (
            "[a-z][a-z0-9.-]{0,20}(:[0-9]{1,5})?",
            proptest::collection::vec(any::<u8>(), 1..32),
        )
            .prop_map(|(host, id)| AssociationEndpoint::Relay {
                host_authority: host,
                session_id: RelaySessionId::new(id),
            });
        (key, versions, prop_oneof![local, relay]).prop_map(|(key, versions, endpoint)| {
            AssociationDescriptor::build(key, versions, endpoint).unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_parse_serialize_roundtrip(d in arb_descriptor()) {
            let parsed = AssociationDescriptor::parse(&d.serialize()).unwrap();
            prop_assert_eq!(parsed, d);
        }
    }
}
