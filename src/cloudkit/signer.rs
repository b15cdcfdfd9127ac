//! Server-to-server request signing.
//!
//! Each request carries a timestamp and a signature over
//! `timestamp:base64(sha256(body)):path`. CloudKit rejects timestamps outside a
//! small skew window, so a signature is computed per send attempt and never
//! cached.
//!
//! # Security
//!
//! - Key material is held only inside the signing key types
//! - `Debug` output never includes the key
//! - Signatures and bodies are never logged

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey as EcdsaSigningKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey as RsaSigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::SignatureEncoding;
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::{sanitize_message, ImportError};

/// Timestamp format CloudKit expects: second precision, UTC, `Z` suffix.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// ─────────────────────────────────────────────────────────────────────────────
// PrivateKey
// ─────────────────────────────────────────────────────────────────────────────

/// Private key used to sign requests; the algorithm follows the key type.
pub enum PrivateKey {
    /// ECDSA over P-256 with SHA-256, DER-encoded signatures.
    Ecdsa(EcdsaSigningKey),
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    Rsa(RsaSigningKey<Sha256>),
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivateKey::Ecdsa(_) => f.write_str("PrivateKey::Ecdsa([REDACTED])"),
            PrivateKey::Rsa(_) => f.write_str("PrivateKey::Rsa([REDACTED])"),
        }
    }
}

impl PrivateKey {
    /// Parses a PEM-encoded private key.
    ///
    /// Accepts SEC1 (`EC PRIVATE KEY`, what CloudKit's key tool produces),
    /// PKCS#1 (`RSA PRIVATE KEY`) and PKCS#8 (`PRIVATE KEY`, EC or RSA).
    ///
    /// # Errors
    ///
    /// Returns `ImportError::InvalidKey` if the document cannot be parsed.
    pub fn from_pem(pem: &SecretString) -> Result<Self, ImportError> {
        let pem = pem.expose_secret().trim();

        if pem.contains("BEGIN EC PRIVATE KEY") {
            let secret = p256::SecretKey::from_sec1_pem(pem).map_err(|e| invalid_key(&e))?;
            return Ok(PrivateKey::Ecdsa(EcdsaSigningKey::from(secret)));
        }

        if pem.contains("BEGIN RSA PRIVATE KEY") {
            let key = RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| invalid_key(&e))?;
            return Ok(PrivateKey::Rsa(RsaSigningKey::<Sha256>::new(key)));
        }

        if pem.contains("BEGIN PRIVATE KEY") {
            if let Ok(key) = EcdsaSigningKey::from_pkcs8_pem(pem) {
                return Ok(PrivateKey::Ecdsa(key));
            }
            let key = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| invalid_key(&e))?;
            return Ok(PrivateKey::Rsa(RsaSigningKey::<Sha256>::new(key)));
        }

        Err(ImportError::InvalidKey(
            "expected an EC, RSA or PKCS#8 private key in PEM format".to_string(),
        ))
    }

    /// Signs `message`, returning raw signature bytes.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ImportError> {
        match self {
            PrivateKey::Ecdsa(key) => {
                let signature: EcdsaSignature = key
                    .try_sign(message)
                    .map_err(|e| ImportError::Internal(format!("ECDSA signing failed: {}", e)))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            PrivateKey::Rsa(key) => {
                let signature = rsa::signature::Signer::try_sign(key, message)
                    .map_err(|e| ImportError::Internal(format!("RSA signing failed: {}", e)))?;
                Ok(signature.to_vec())
            }
        }
    }
}

fn invalid_key(e: &dyn fmt::Display) -> ImportError {
    ImportError::InvalidKey(sanitize_message(
        &e.to_string(),
        "private key could not be parsed",
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// RequestSigner
// ─────────────────────────────────────────────────────────────────────────────

/// Timestamp and signature headers for one request attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    /// `YYYY-MM-DDTHH:MM:SSZ`.
    pub timestamp: String,
    /// Base64-encoded signature.
    pub signature: String,
}

/// Signs request bodies with a server-to-server key.
pub struct RequestSigner {
    key_id: String,
    key: PrivateKey,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .field("key", &self.key)
            .finish()
    }
}

impl RequestSigner {
    pub fn new(key_id: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            key_id: key_id.into(),
            key,
        }
    }

    /// Builds a signer from a key id and a PEM private key.
    pub fn from_pem(key_id: impl Into<String>, pem: &SecretString) -> Result<Self, ImportError> {
        Ok(Self::new(key_id, PrivateKey::from_pem(pem)?))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signs with the current time.
    pub fn sign(&self, body: &[u8], path: &str) -> Result<RequestSignature, ImportError> {
        self.sign_at(body, path, Utc::now())
    }

    /// Signs with a fixed time.
    pub fn sign_at(
        &self,
        body: &[u8],
        path: &str,
        at: DateTime<Utc>,
    ) -> Result<RequestSignature, ImportError> {
        let timestamp = format_timestamp(at);
        let message = canonical_message(&timestamp, body, path);
        let signature = self.key.sign(message.as_bytes())?;

        Ok(RequestSignature {
            timestamp,
            signature: STANDARD.encode(signature),
        })
    }
}

/// Formats a time as CloudKit's request date.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// `timestamp:base64(sha256(body)):path`.
pub fn canonical_message(timestamp: &str, body: &[u8], path: &str) -> String {
    let body_hash = STANDARD.encode(Sha256::digest(body));
    format!("{}:{}:{}", timestamp, body_hash, path)
}
