use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    pub const MINIMUM_SUPPORTED: Self = Self::Tls1_0;
    pub const MAXIMUM_SUPPORTED: Self = Self::Tls1_3;

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tls1_0 => "TLSv1",
            Self::Tls1_1 => "TLSv1.1",
            Self::Tls1_2 => "TLSv1.2",
            Self::Tls1_3 => "TLSv1.3",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "TLSv1" | "TLSv1.0" => Some(Self::Tls1_0),
            "TLSv1.1" => Some(Self::Tls1_1),
            "TLSv1.2" => Some(Self::Tls1_2),
            "TLSv1.3" => Some(Self::Tls1_3),
            _ => None,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub enum Alpn {
    #[serde(rename = "http/1.1")]
    Http11,
    #[serde(rename = "h2")]
    H2,
    #[serde(rename = "h3")]
    H3,
}

impl Alpn {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http11 => "http/1.1",
            Self::H2 => "h2",
            Self::H3 => "h3",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "http/1.1" => Some(Self::Http11),
            "h2" => Some(Self::H2),
            "h3" => Some(Self::H3),
            _ => None,
        }
    }

    /// Protocols that carry many concurrent requests over one connection.
    pub const fn is_multiplexed(self) -> bool {
        matches!(self, Self::H2 | Self::H3)
    }
}

impl std::fmt::Display for Alpn {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FingerprintAlgorithm {
    Md5,
    Sha256,
}

/// Digest of a DER encoded peer certificate.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CertFingerprint {
    digest: Vec<u8>,
}

impl CertFingerprint {
    /// Parses hex, with or without `:` separators. The digest length selects the
    /// algorithm: 16 bytes for MD5, 32 bytes for SHA-256.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let unsupported = |message: &str| Error::UnsupportedFingerprint {
            fingerprint: text.to_owned(),
            message: message.to_owned(),
        };
        let cleaned = text
            .chars()
            .filter(|character| *character != ':' && !character.is_whitespace())
            .collect::<String>();
        if cleaned.len() % 2 != 0 {
            return Err(unsupported("odd number of hex digits"));
        }
        let digest = (0..cleaned.len())
            .step_by(2)
            .map(|index| u8::from_str_radix(&cleaned[index..index + 2], 16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| unsupported("fingerprint is not hex"))?;
        match digest.len() {
            16 | 32 => Ok(Self { digest }),
            20 => Err(unsupported("sha1 fingerprints are not accepted")),
            _ => Err(unsupported("unknown hash algorithm for fingerprint length")),
        }
    }

    pub fn sha256_of(certificate_der: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(certificate_der).to_vec(),
        }
    }

    pub fn algorithm(&self) -> FingerprintAlgorithm {
        if self.digest.len() == 16 {
            FingerprintAlgorithm::Md5
        } else {
            FingerprintAlgorithm::Sha256
        }
    }

    pub fn matches(&self, certificate_der: &[u8]) -> bool {
        let actual = match self.algorithm() {
            FingerprintAlgorithm::Md5 => md5::compute(certificate_der).0.to_vec(),
            FingerprintAlgorithm::Sha256 => Sha256::digest(certificate_der).to_vec(),
        };
        constant_time_eq(&self.digest, &actual)
    }
}

impl std::fmt::Display for CertFingerprint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for byte in &self.digest {
            if !first {
                formatter.write_str(":")?;
            }
            write!(formatter, "{byte:02X}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CertFingerprint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "CertFingerprint({self})")
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0_u8, |acc, (left, right)| acc | (left ^ right))
        == 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TlsRootStore {
    #[default]
    BackendDefault,
    WebPki,
    System,
    Specific,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TlsRootCertificate {
    Pem(Vec<u8>),
    Der(Vec<u8>),
}

/// Certificate authorities trusted for a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct CaTrust {
    pub root_store: TlsRootStore,
    pub root_certificates: Vec<TlsRootCertificate>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    Pem {
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        password: Option<String>,
    },
    Pkcs12 {
        identity_der: Vec<u8>,
        password: String,
    },
}

impl ClientIdentity {
    pub fn is_configured(&self) -> bool {
        match self {
            Self::Pem {
                cert_chain_pem,
                private_key_pem,
                password,
            } => {
                !cert_chain_pem.is_empty()
                    || !private_key_pem.is_empty()
                    || password.as_deref().is_some_and(|password| !password.is_empty())
            }
            Self::Pkcs12 {
                identity_der,
                password,
            } => !identity_der.is_empty() || !password.is_empty(),
        }
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pem { .. } => formatter.write_str("ClientIdentity::Pem(..)"),
            Self::Pkcs12 { .. } => formatter.write_str("ClientIdentity::Pkcs12(..)"),
        }
    }
}

/// Opaque resumption material handed out by a TLS layer.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsSessionTicket(pub Vec<u8>);

impl std::fmt::Debug for TlsSessionTicket {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "TlsSessionTicket({} bytes)", self.0.len())
    }
}

/// Session-wide TLS negotiation parameters.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub(crate) ca_trust: CaTrust,
    pub(crate) client_identity: Option<ClientIdentity>,
    pub(crate) pinned_certs: BTreeMap<String, BTreeSet<CertFingerprint>>,
    pub(crate) min_version: TlsVersion,
    pub(crate) max_version: TlsVersion,
    pub(crate) alpn_protocols: Vec<Alpn>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ca_trust: CaTrust::default(),
            client_identity: None,
            pinned_certs: BTreeMap::new(),
            min_version: TlsVersion::Tls1_2,
            max_version: TlsVersion::MAXIMUM_SUPPORTED,
            alpn_protocols: vec![Alpn::H2, Alpn::Http11],
        }
    }
}

impl TlsSettings {
    pub fn root_store(mut self, root_store: TlsRootStore) -> Self {
        self.ca_trust.root_store = root_store;
        self
    }

    pub fn add_root_certificate(mut self, certificate: TlsRootCertificate) -> Self {
        self.ca_trust.root_certificates.push(certificate);
        self
    }

    pub fn client_identity(mut self, identity: ClientIdentity) -> Self {
        self.client_identity = Some(identity);
        self
    }

    pub fn pin_certificate(mut self, host: &str, fingerprint: &str) -> crate::Result<Self> {
        let fingerprint = CertFingerprint::parse(fingerprint)?;
        self.pinned_certs
            .entry(host.to_ascii_lowercase())
            .or_default()
            .insert(fingerprint);
        Ok(self)
    }

    pub fn versions(mut self, min_version: TlsVersion, max_version: TlsVersion) -> Self {
        self.min_version = min_version;
        self.max_version = max_version;
        self
    }

    pub fn alpn_protocols(mut self, protocols: impl IntoIterator<Item = Alpn>) -> Self {
        self.alpn_protocols = protocols.into_iter().collect();
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.min_version > self.max_version {
            return Err(Error::InvalidTlsConfig {
                message: format!(
                    "minimum tls version {} is above maximum {}",
                    self.min_version, self.max_version
                ),
            });
        }
        if self.alpn_protocols.is_empty() {
            return Err(Error::InvalidTlsConfig {
                message: "alpn protocol list must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    pub(crate) fn pins_for(&self, host: &str) -> BTreeSet<CertFingerprint> {
        self.pinned_certs.get(host).cloned().unwrap_or_default()
    }
}
