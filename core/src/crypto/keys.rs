//! RSA key management for device identity and hub authentication

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::constants::RSA_KEY_BITS;
use crate::{Error, Result};

/// RSA private key, the root of a device's identity
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public", &self.public_key().fingerprint())
            .finish()
    }
}

impl PrivateKey {
    /// Generate a new random key of the default size
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        let inner = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::Crypto(format!("key generation failed: {}", e)))?;
        Ok(Self { inner })
    }

    /// Parse a PKCS#8 or PKCS#1 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::Crypto(format!("invalid private key: {}", e)))?;
        Ok(Self { inner })
    }

    /// Export as PKCS#8 PEM
    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .inner
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(pem.to_string())
    }

    /// Export as PKCS#8 DER, the form TLS stacks expect
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let der = self
            .inner
            .to_pkcs8_der()
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(der.as_bytes().to_vec())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.to_public_key(),
        }
    }

    /// RSA-SHA256 (PKCS#1 v1.5) signature over raw bytes
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.inner.clone());
        signing_key.sign(message).to_vec()
    }

    pub(crate) fn rsa(&self) -> &RsaPrivateKey {
        &self.inner
    }
}

/// RSA public key
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

// Serialized as a bare PEM string, the form the hub exchanges
impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let pem = self.to_pem().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&pem)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        PublicKey::from_pem(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PublicKey {
    /// Parse an SPKI or PKCS#1 PEM public key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::Crypto(format!("invalid public key: {}", e)))?;
        Ok(Self { inner })
    }

    /// Export as SPKI PEM
    pub fn to_pem(&self) -> Result<String> {
        self.inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    /// Verify an RSA-SHA256 signature
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::try_from(signature)
            .map_err(|_| Error::Crypto("invalid signature encoding".to_string()))?;
        VerifyingKey::<Sha256>::new(self.inner.clone())
            .verify(message, &signature)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    /// Get a human-readable fingerprint (first 8 bytes of SHA256 over the DER, base64)
    pub fn fingerprint(&self) -> String {
        let der = self
            .inner
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .unwrap_or_default();
        let hash = Sha256::digest(&der);
        BASE64.encode(&hash[..8])
    }

    pub(crate) fn rsa(&self) -> &RsaPublicKey {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;

    #[test]
    fn test_signing_roundtrip() {
        let key = fixtures::key_a();
        let message = b"nonce-1234";
        let signature = key.sign(message);

        assert!(key.public_key().verify(message, &signature).is_ok());
        assert!(key.public_key().verify(b"nonce-1235", &signature).is_err());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let signature = fixtures::key_a().sign(b"hello");
        assert!(fixtures::key_b().public_key().verify(b"hello", &signature).is_err());
    }

    #[test]
    fn test_pem_roundtrip() {
        let key = fixtures::key_a();
        let restored = PrivateKey::from_pem(&key.to_pem().unwrap()).unwrap();
        assert_eq!(restored.public_key(), key.public_key());

        let public_pem = key.public_key().to_pem().unwrap();
        assert!(public_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(PublicKey::from_pem(&public_pem).unwrap(), key.public_key());
    }

    #[test]
    fn test_public_key_serde_as_pem_string() {
        let public = fixtures::key_a().public_key();
        let json = serde_json::to_string(&public).unwrap();
        assert!(json.contains("BEGIN PUBLIC KEY"));
        let decoded: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, public);
    }

    #[test]
    fn test_fingerprint_consistency() {
        let key = fixtures::key_a();
        assert_eq!(key.public_key().fingerprint(), key.public_key().fingerprint());
        assert_ne!(
            key.public_key().fingerprint(),
            fixtures::key_b().public_key().fingerprint()
        );
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(PrivateKey::from_pem("not a key").is_err());
        assert!(PublicKey::from_pem("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n").is_err());
    }
}
