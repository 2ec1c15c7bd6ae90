//! Detached signature checks behind a capability-selected backend.
//!
//! Publishers sign the raw 32-byte SHA-256 digest of an artifact with Ed25519
//! and ship the base64 signature next to it as `<artifact>.sig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, TrustError};

pub const SIGNATURE_EXTENSION: &str = "sig";
pub const OPERATOR_KEY_ENV: &str = "WARDEN_SIGNING_PUBKEY_B64";
const OPERATOR_PUBLISHER: &str = "operator";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignatureStatus {
    Valid { publisher: String },
    Invalid { reason: String },
    Missing,
    Unavailable { reason: String },
}

impl SignatureStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, SignatureStatus::Valid { .. })
    }

    /// Everything except a bad signature soft-passes.
    pub fn passes(&self) -> bool {
        !matches!(self, SignatureStatus::Invalid { .. })
    }
}

pub trait SignatureVerifier: Send + Sync {
    fn backend(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Check `signature` over an artifact digest, optionally pinned to one publisher.
    fn verify(&self, digest: &[u8; 32], signature: &[u8], publisher: Option<&str>) -> SignatureStatus;
}

/// Ed25519 verification against a fixed set of publisher keys.
pub struct Ed25519Verifier {
    keys: BTreeMap<String, VerifyingKey>,
}

impl Ed25519Verifier {
    pub fn new(keys: BTreeMap<String, VerifyingKey>) -> Self {
        let keys = keys
            .into_iter()
            .map(|(publisher, key)| (publisher.to_lowercase(), key))
            .collect();
        Self { keys }
    }

    /// Parse `publisher -> base64 public key` pairs, rejecting any bad key.
    pub fn from_base64_keys(keys: &BTreeMap<String, String>) -> Result<Self> {
        let mut parsed = BTreeMap::new();
        for (publisher, b64) in keys {
            parsed.insert(publisher.clone(), parse_public_key(publisher, b64)?);
        }
        Ok(Self::new(parsed))
    }

    pub fn publishers(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn backend(&self) -> &'static str {
        "ed25519"
    }

    fn is_available(&self) -> bool {
        !self.keys.is_empty()
    }

    fn verify(&self, digest: &[u8; 32], signature: &[u8], publisher: Option<&str>) -> SignatureStatus {
        let sig_bytes: [u8; 64] = match signature.try_into() {
            Ok(b) => b,
            Err(_) => {
                return SignatureStatus::Invalid {
                    reason: format!("signature length {} (expected 64)", signature.len()),
                }
            }
        };
        let sig = Signature::from_bytes(&sig_bytes);

        let candidates: Vec<(&String, &VerifyingKey)> = match publisher {
            Some(p) => {
                let wanted = p.to_lowercase();
                match self.keys.get_key_value(&wanted) {
                    Some(pinned) => vec![pinned],
                    None => {
                        debug!(publisher = p, "no key configured for publisher");
                        return SignatureStatus::Invalid {
                            reason: format!("no key for publisher {wanted}"),
                        };
                    }
                }
            }
            None => self.keys.iter().collect(),
        };

        for (name, key) in candidates {
            if key.verify_strict(digest, &sig).is_ok() {
                return SignatureStatus::Valid {
                    publisher: name.clone(),
                };
            }
        }
        SignatureStatus::Invalid {
            reason: "signature does not match any trusted publisher key".into(),
        }
    }
}

/// Backend used when no verification capability is configured.
pub struct UnavailableVerifier {
    reason: String,
}

impl UnavailableVerifier {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SignatureVerifier for UnavailableVerifier {
    fn backend(&self) -> &'static str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn verify(&self, _digest: &[u8; 32], _signature: &[u8], _publisher: Option<&str>) -> SignatureStatus {
        SignatureStatus::Unavailable {
            reason: self.reason.clone(),
        }
    }
}

/// Pick a backend from configured publisher keys plus the operator key in
/// `WARDEN_SIGNING_PUBKEY_B64`. Keys that fail to parse are skipped.
pub fn detect_signature_verifier(keys: &BTreeMap<String, String>) -> Box<dyn SignatureVerifier> {
    let mut parsed = BTreeMap::new();
    for (publisher, b64) in keys {
        match parse_public_key(publisher, b64) {
            Ok(k) => {
                parsed.insert(publisher.clone(), k);
            }
            Err(e) => warn!("ignoring signing key: {e}"),
        }
    }
    if let Ok(b64) = std::env::var(OPERATOR_KEY_ENV) {
        match parse_public_key(OPERATOR_PUBLISHER, &b64) {
            Ok(k) => {
                parsed.insert(OPERATOR_PUBLISHER.to_string(), k);
            }
            Err(e) => warn!("ignoring {OPERATOR_KEY_ENV}: {e}"),
        }
    }
    if parsed.is_empty() {
        debug!("no signing keys configured; signature checks unavailable");
        return Box::new(UnavailableVerifier::new("no publisher signing keys configured"));
    }
    debug!(keys = parsed.len(), "ed25519 signature backend selected");
    Box::new(Ed25519Verifier::new(parsed))
}

pub fn parse_public_key(publisher: &str, b64: &str) -> Result<VerifyingKey> {
    let invalid = |reason: String| TrustError::InvalidKey {
        publisher: publisher.to_string(),
        reason,
    };
    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| invalid(format!("decode: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| invalid("key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))
}

pub fn default_signature_path(artifact: &Path) -> PathBuf {
    let mut s = artifact.as_os_str().to_owned();
    s.push(".");
    s.push(SIGNATURE_EXTENSION);
    PathBuf::from(s)
}

/// Read a base64 signature file; `Ok(None)` when it does not exist.
pub fn read_signature_file(path: &Path) -> Result<Option<std::result::Result<Vec<u8>, String>>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(
        general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| format!("malformed signature file: {e}")),
    ))
}
