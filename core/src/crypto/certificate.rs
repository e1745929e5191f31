//! X.509 certificates identifying LAN peers
//!
//! A device certificate is self-signed by the device key and names the device
//! in its subject Common Name. Trust decisions compare the exact DER bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::keys::PrivateKey;
use crate::{Error, Result};

const PEM_TAG: &str = "CERTIFICATE";

/// DER-encoded X.509 certificate
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    der: Vec<u8>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cn", &self.common_name())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Certificate {
    /// Issue a self-signed certificate whose CN is `name`
    pub fn issue(name: &str, key: &PrivateKey) -> Result<Self> {
        let key_pair = KeyPair::from_pem(&key.to_pem()?)
            .map_err(|e| Error::Certificate(format!("unusable key: {}", e)))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| Error::Certificate(e.to_string()))?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, name);
        params.distinguished_name = subject;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("signing failed: {}", e)))?;

        Ok(Self {
            der: cert.der().to_vec(),
        })
    }

    /// Wrap DER bytes after checking they parse as X.509
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        x509_parser::parse_x509_certificate(&der)
            .map_err(|e| Error::Certificate(format!("invalid certificate: {}", e)))?;
        Ok(Self { der })
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let block = pem::parse(pem).map_err(|e| Error::Certificate(e.to_string()))?;
        if block.tag() != PEM_TAG {
            return Err(Error::Certificate(format!(
                "expected {} PEM block, found {}",
                PEM_TAG,
                block.tag()
            )));
        }
        Self::from_der(block.contents().to_vec())
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_TAG, self.der.clone()))
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The subject Common Name, used as the peer's identity
    pub fn common_name(&self) -> Option<String> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der).ok()?;
        let cn = cert.subject().iter_common_name().next()?;
        cn.as_str().ok().map(str::to_string)
    }

    /// Short SHA256 fingerprint for display and operator approval
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.der);
        BASE64.encode(&hash[..8])
    }

    pub(crate) fn to_rustls(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.der.clone())
    }
}

// Serialized as PEM, the form every persisted store uses
impl Serialize for Certificate {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_pem())
    }
}

impl<'de> Deserialize<'de> for Certificate {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Certificate::from_pem(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;

    #[test]
    fn test_issue_sets_common_name() {
        let cert = Certificate::issue("living-room", fixtures::key_a()).unwrap();
        assert_eq!(cert.common_name().as_deref(), Some("living-room"));
    }

    #[test]
    fn test_pem_roundtrip() {
        let cert = fixtures::cert_a();
        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(Certificate::from_pem(&pem).unwrap(), *cert);
    }

    #[test]
    fn test_wrong_pem_tag_rejected() {
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", fixtures::cert_a().der().to_vec()));
        assert!(Certificate::from_pem(&pem).is_err());
    }

    #[test]
    fn test_garbage_der_rejected() {
        assert!(Certificate::from_der(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_same_name_different_key_differs() {
        let a = Certificate::issue("desk", fixtures::key_a()).unwrap();
        let b = Certificate::issue("desk", fixtures::key_b()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
