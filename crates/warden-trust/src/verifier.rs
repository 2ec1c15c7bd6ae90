use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::checksum::{
    self, logical_name, normalize_digest, ChecksumCheck, ChecksumRegistry, ImportSummary,
    ModelChecksumRecord,
};
use crate::error::{Result, TrustError};
use crate::signature::{default_signature_path, read_signature_file, SignatureStatus, SignatureVerifier};
use crate::sources::{domain_from_url, SourceRegistry, TrustedSource};

/// Outcome of [`ArtifactTrustVerifier::validate_before_load`].
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub model: String,
    pub valid: bool,
    pub checksum_valid: bool,
    pub signature_valid: bool,
    pub source_trusted: bool,
    pub digest: Option<String>,
    pub signature: Option<SignatureStatus>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ArtifactTrustVerifier {
    sources: RwLock<SourceRegistry>,
    checksums: RwLock<ChecksumRegistry>,
    signatures: Box<dyn SignatureVerifier>,
}

impl ArtifactTrustVerifier {
    pub fn new(
        sources: SourceRegistry,
        checksums: ChecksumRegistry,
        signatures: Box<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            sources: RwLock::new(sources),
            checksums: RwLock::new(checksums),
            signatures,
        }
    }

    /// Load both registries from disk, seeding the default sources on first run.
    pub fn open(
        sources_path: &Path,
        checksums_path: &Path,
        signatures: Box<dyn SignatureVerifier>,
    ) -> Result<Self> {
        let sources = SourceRegistry::load_or_seed(sources_path)?;
        let checksums = ChecksumRegistry::load(checksums_path)?;
        info!(backend = signatures.backend(), "artifact trust verifier ready");
        Ok(Self::new(sources, checksums, signatures))
    }

    pub fn in_memory(signatures: Box<dyn SignatureVerifier>) -> Self {
        Self::new(SourceRegistry::in_memory(), ChecksumRegistry::in_memory(), signatures)
    }

    pub fn signature_backend(&self) -> &'static str {
        self.signatures.backend()
    }

    pub fn checksum(&self, path: &Path) -> Result<String> {
        checksum::hash_file(path)
    }

    /// Check `path` against `expected`, or against the digest pinned for its
    /// file name. An unknown name is pinned and reported as [`ChecksumCheck::FirstUse`].
    pub fn verify_checksum(&self, path: &Path, expected: Option<&str>) -> Result<ChecksumCheck> {
        let actual = checksum::hash_file(path)?;
        self.check_digest(&logical_name(path), &actual, expected, None)
    }

    fn check_digest(
        &self,
        model: &str,
        actual: &str,
        expected: Option<&str>,
        source_url: Option<&str>,
    ) -> Result<ChecksumCheck> {
        if let Some(expected) = expected {
            let expected = normalize_digest(expected)?;
            if expected != actual {
                error!(model, expected = %expected, actual, "checksum mismatch against expected digest");
                return Err(TrustError::Integrity {
                    model: model.to_string(),
                    expected,
                    actual: actual.to_string(),
                });
            }
            let mut reg = self.checksums.write();
            match reg.get(model) {
                None => {
                    reg.insert(record(model, actual, source_url))?;
                    debug!(model, "pinned expected digest");
                }
                Some(pinned) if pinned.digest != actual => {
                    warn!(model, pinned = %pinned.digest, "expected digest differs from pinned record; record left in place");
                }
                Some(_) => {}
            }
            return Ok(ChecksumCheck::Matched);
        }

        let mut reg = self.checksums.write();
        match reg.get(model) {
            Some(pinned) if pinned.digest == actual => Ok(ChecksumCheck::Matched),
            Some(pinned) => {
                error!(model, pinned = %pinned.digest, actual, "checksum mismatch against pinned digest");
                Err(TrustError::Integrity {
                    model: model.to_string(),
                    expected: pinned.digest.clone(),
                    actual: actual.to_string(),
                })
            }
            None => {
                reg.insert(record(model, actual, source_url))?;
                warn!(model, digest = actual, "no known digest; trusting on first use");
                Ok(ChecksumCheck::FirstUse {
                    digest: actual.to_string(),
                })
            }
        }
    }

    /// Check a detached signature. Defaults to `<path>.sig`; a missing file or
    /// an unavailable backend soft-fails.
    pub fn verify_signature(
        &self,
        path: &Path,
        signature_path: Option<&Path>,
        publisher: Option<&str>,
    ) -> Result<SignatureStatus> {
        let digest = checksum::sha256_file(path)?;
        self.check_signature(path, &digest, signature_path, publisher)
    }

    fn check_signature(
        &self,
        path: &Path,
        digest: &[u8; 32],
        signature_path: Option<&Path>,
        publisher: Option<&str>,
    ) -> Result<SignatureStatus> {
        if !self.signatures.is_available() {
            return Ok(self.signatures.verify(digest, &[], publisher));
        }
        let sig_path: PathBuf = signature_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_signature_path(path));
        let status = match read_signature_file(&sig_path)? {
            None => SignatureStatus::Missing,
            Some(Err(reason)) => SignatureStatus::Invalid { reason },
            Some(Ok(sig)) => self.signatures.verify(digest, &sig, publisher),
        };
        match &status {
            SignatureStatus::Valid { publisher } => {
                debug!(path = %path.display(), publisher = %publisher, "signature verified")
            }
            SignatureStatus::Invalid { reason } => {
                warn!(path = %path.display(), reason = %reason, "signature rejected")
            }
            _ => debug!(path = %path.display(), "no signature to check"),
        }
        Ok(status)
    }

    /// Whether `source_url`'s host is an enabled registry entry and, when the
    /// entry lists publishers, whether `publisher` is one of them.
    pub fn is_source_trusted(&self, source_url: &str, publisher: Option<&str>) -> bool {
        self.lookup_source(source_url, publisher).is_some()
    }

    fn lookup_source(&self, source_url: &str, publisher: Option<&str>) -> Option<TrustedSource> {
        let domain = match domain_from_url(source_url) {
            Ok(d) => d,
            Err(e) => {
                debug!("untrusted source: {e}");
                return None;
            }
        };
        let sources = self.sources.read();
        let src = sources.get(&domain)?;
        if !src.enabled || !src.allows_publisher(publisher) {
            return None;
        }
        Some(src.clone())
    }

    /// Run every check before a model is handed to the inference engine.
    /// Only a missing file or a digest mismatch makes the result invalid.
    pub fn validate_before_load(
        &self,
        path: &Path,
        source_url: Option<&str>,
        publisher: Option<&str>,
        expected_digest: Option<&str>,
    ) -> ValidationResult {
        let model = logical_name(path);
        let mut result = ValidationResult {
            model: model.clone(),
            valid: false,
            checksum_valid: false,
            signature_valid: false,
            source_trusted: false,
            digest: None,
            signature: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        let raw = match checksum::sha256_file(path) {
            Ok(d) => d,
            Err(e) => {
                result.errors.push(e.to_string());
                warn!(model = %model, "validation failed: {e}");
                return result;
            }
        };
        let actual = hex::encode(raw);
        result.digest = Some(actual.clone());

        match self.check_digest(&model, &actual, expected_digest, source_url) {
            Ok(ChecksumCheck::Matched) => result.checksum_valid = true,
            Ok(ChecksumCheck::FirstUse { .. }) => {
                result.checksum_valid = true;
                result
                    .warnings
                    .push(format!("no known digest for {model}; pinned on first use"));
            }
            Err(e) => result.errors.push(e.to_string()),
        }

        let source = match source_url {
            Some(url) => {
                let src = self.lookup_source(url, publisher);
                if src.is_none() {
                    result.warnings.push(format!("source {url} is not trusted"));
                }
                src
            }
            None => {
                result
                    .warnings
                    .push("no source URL supplied; provenance unknown".to_string());
                None
            }
        };
        result.source_trusted = source.is_some();

        match self.check_signature(path, &raw, None, publisher) {
            Ok(status) => {
                result.signature_valid = status.is_verified();
                match &status {
                    SignatureStatus::Valid { .. } => {}
                    SignatureStatus::Invalid { reason } => {
                        result.warnings.push(format!("signature invalid: {reason}"))
                    }
                    SignatureStatus::Missing => {
                        result.warnings.push("no signature file found".to_string())
                    }
                    SignatureStatus::Unavailable { reason } => result
                        .warnings
                        .push(format!("signature verification unavailable: {reason}")),
                }
                result.signature = Some(status);
            }
            Err(e) => result.warnings.push(format!("signature check failed: {e}")),
        }
        if let Some(src) = &source {
            if src.require_signature && !result.signature_valid {
                result
                    .warnings
                    .push(format!("{} requires a valid signature", src.domain));
            }
        }

        result.valid = result.checksum_valid && result.errors.is_empty();
        info!(
            model = %model,
            valid = result.valid,
            signature = result.signature_valid,
            source = result.source_trusted,
            warnings = result.warnings.len(),
            "artifact validated"
        );
        result
    }

    pub fn add_trusted_source(
        &self,
        domain: &str,
        require_signature: bool,
        trusted_publishers: &[String],
    ) -> Result<TrustedSource> {
        let source = TrustedSource::new(domain, require_signature, trusted_publishers);
        self.sources.write().upsert(source.clone())?;
        info!(domain = %source.domain, "trusted source added");
        Ok(source)
    }

    pub fn remove_trusted_source(&self, domain: &str) -> Result<bool> {
        let removed = self.sources.write().remove(domain)?;
        if removed {
            info!(domain, "trusted source removed");
        }
        Ok(removed)
    }

    pub fn set_source_enabled(&self, domain: &str, enabled: bool) -> Result<bool> {
        self.sources.write().set_enabled(domain, enabled)
    }

    pub fn list_trusted_sources(&self) -> Vec<TrustedSource> {
        self.sources.read().list()
    }

    pub fn trusted_source(&self, domain: &str) -> Option<TrustedSource> {
        self.sources.read().get(domain).cloned()
    }

    /// Pin a known-good digest, replacing any previous record for `name`.
    pub fn store_checksum(&self, name: &str, digest: &str, source_url: Option<&str>) -> Result<()> {
        let digest = normalize_digest(digest)?;
        self.checksums.write().insert(record(name, &digest, source_url))?;
        info!(model = name, "checksum stored");
        Ok(())
    }

    pub fn get_checksum(&self, name: &str) -> Option<ModelChecksumRecord> {
        self.checksums.read().get(name).cloned()
    }

    pub fn remove_checksum(&self, name: &str) -> Result<bool> {
        self.checksums.write().remove(name)
    }

    pub fn import_checksums(&self, path: &Path) -> Result<ImportSummary> {
        self.checksums.write().import_from(path)
    }

    pub fn export_checksums(&self, path: &Path) -> Result<usize> {
        self.checksums.read().export_to(path)
    }
}

fn record(model: &str, digest: &str, source_url: Option<&str>) -> ModelChecksumRecord {
    ModelChecksumRecord {
        model_name: model.to_string(),
        digest: digest.to_string(),
        algorithm: "sha256".to_string(),
        first_seen_at: Utc::now(),
        source_url: source_url.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{Ed25519Verifier, UnavailableVerifier};
    use base64::{engine::general_purpose, Engine as _};
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    fn unavailable() -> ArtifactTrustVerifier {
        ArtifactTrustVerifier::in_memory(Box::new(UnavailableVerifier::new("test")))
    }

    fn model(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, data).unwrap();
        p
    }

    fn sign_file(key: &SigningKey, path: &Path) {
        let digest = checksum::sha256_file(path).unwrap();
        let sig = key.sign(&digest).to_bytes();
        std::fs::write(
            default_signature_path(path),
            general_purpose::STANDARD.encode(sig),
        )
        .unwrap();
    }

    #[test]
    fn trust_on_first_use_then_hard_fail() {
        let dir = tempdir().unwrap();
        let v = unavailable();
        let path = model(&dir, "phi-2.gguf", b"original weights");

        assert!(matches!(
            v.verify_checksum(&path, None).unwrap(),
            ChecksumCheck::FirstUse { .. }
        ));
        assert_eq!(v.verify_checksum(&path, None).unwrap(), ChecksumCheck::Matched);

        std::fs::write(&path, b"poisoned weights").unwrap();
        assert!(matches!(
            v.verify_checksum(&path, None),
            Err(TrustError::Integrity { .. })
        ));
    }

    #[test]
    fn expected_digest_must_match_exactly() {
        let dir = tempdir().unwrap();
        let v = unavailable();
        let path = model(&dir, "m.gguf", b"abc");
        let good = v.checksum(&path).unwrap();

        assert_eq!(
            v.verify_checksum(&path, Some(&good.to_uppercase())).unwrap(),
            ChecksumCheck::Matched
        );
        assert_eq!(v.get_checksum("m.gguf").unwrap().digest, good);
        assert!(matches!(
            v.verify_checksum(&path, Some(&"0".repeat(64))),
            Err(TrustError::Integrity { .. })
        ));
        assert!(matches!(
            v.verify_checksum(&path, Some("short")),
            Err(TrustError::InvalidDigest(_))
        ));
    }

    #[test]
    fn source_trust_against_defaults() {
        let v = unavailable();
        assert!(v.is_source_trusted("https://huggingface.co/microsoft/phi-2", Some("microsoft")));
        assert!(v.is_source_trusted("https://www.HuggingFace.co/x", Some("Microsoft")));
        assert!(v.is_source_trusted("https://huggingface.co/x", None));
        assert!(!v.is_source_trusted("https://huggingface.co/x", Some("mallory")));
        assert!(!v.is_source_trusted("https://evil.example/model.gguf", None));
        assert!(!v.is_source_trusted("https://cdn.huggingface.co/x", None));
        assert!(v.is_source_trusted("ollama.com/library/llama3", Some("anyone")));

        assert!(v.set_source_enabled("ollama.com", false).unwrap());
        assert!(!v.is_source_trusted("https://ollama.com/library/llama3", None));
    }

    #[test]
    fn registry_mutations() {
        let v = unavailable();
        let src = v
            .add_trusted_source("WWW.Models.Example", true, &["Acme".to_string()])
            .unwrap();
        assert_eq!(src.domain, "models.example");
        assert!(v.is_source_trusted("https://models.example/a", Some("ACME")));
        assert!(v.remove_trusted_source("models.example").unwrap());
        assert!(!v.is_source_trusted("https://models.example/a", Some("acme")));
        assert!(!v.remove_trusted_source("models.example").unwrap());
    }

    #[test]
    fn signature_soft_fails_when_unavailable_or_missing() {
        let dir = tempdir().unwrap();
        let path = model(&dir, "m.gguf", b"abc");
        let status = unavailable().verify_signature(&path, None, None).unwrap();
        assert!(matches!(status, SignatureStatus::Unavailable { .. }));

        let signing = SigningKey::generate(&mut OsRng);
        let mut keys = BTreeMap::new();
        keys.insert("microsoft".to_string(), signing.verifying_key());
        let v = ArtifactTrustVerifier::in_memory(Box::new(Ed25519Verifier::new(keys)));
        assert_eq!(
            v.verify_signature(&path, None, None).unwrap(),
            SignatureStatus::Missing
        );

        sign_file(&signing, &path);
        assert!(v
            .verify_signature(&path, None, Some("microsoft"))
            .unwrap()
            .is_verified());

        std::fs::write(&path, b"abd").unwrap();
        assert!(!v.verify_signature(&path, None, None).unwrap().passes());
    }

    #[test]
    fn validation_composes_checks() {
        let dir = tempdir().unwrap();
        let signing = SigningKey::generate(&mut OsRng);
        let mut keys = BTreeMap::new();
        keys.insert("microsoft".to_string(), signing.verifying_key());
        let v = ArtifactTrustVerifier::in_memory(Box::new(Ed25519Verifier::new(keys)));
        let path = model(&dir, "phi-2.gguf", b"weights");
        sign_file(&signing, &path);

        let first = v.validate_before_load(
            &path,
            Some("https://huggingface.co/microsoft/phi-2"),
            Some("microsoft"),
            None,
        );
        assert!(first.valid);
        assert!(first.checksum_valid && first.signature_valid && first.source_trusted);
        assert!(first.errors.is_empty());
        assert_eq!(first.warnings.len(), 1);

        let second = v.validate_before_load(&path, None, None, None);
        assert!(second.valid);
        assert!(!second.source_trusted);
        assert!(second.warnings.iter().any(|w| w.contains("no source URL")));

        std::fs::write(&path, b"tampered").unwrap();
        let bad = v.validate_before_load(&path, Some("https://evil.example/x"), None, None);
        assert!(!bad.valid);
        assert!(!bad.checksum_valid);
        assert_eq!(bad.errors.len(), 1);
        assert!(!bad.signature_valid);
    }

    #[test]
    fn missing_file_is_invalid() {
        let dir = tempdir().unwrap();
        let r = unavailable().validate_before_load(&dir.path().join("gone.gguf"), None, None, None);
        assert!(!r.valid);
        assert!(r.digest.is_none());
        assert_eq!(r.errors.len(), 1);
    }

    #[test]
    fn registries_persist_through_open() {
        let dir = tempdir().unwrap();
        let sources = dir.path().join("trusted_sources.json");
        let sums = dir.path().join("model_checksums.json");
        let path = model(&dir, "m.gguf", b"abc");
        {
            let v = ArtifactTrustVerifier::open(&sources, &sums, Box::new(UnavailableVerifier::new("t")))
                .unwrap();
            v.verify_checksum(&path, None).unwrap();
            v.add_trusted_source("models.internal", false, &[]).unwrap();
        }
        let v = ArtifactTrustVerifier::open(&sources, &sums, Box::new(UnavailableVerifier::new("t")))
            .unwrap();
        assert!(v.get_checksum("m.gguf").is_some());
        assert!(v.trusted_source("models.internal").is_some());

        let out = dir.path().join("export.json");
        assert_eq!(v.export_checksums(&out).unwrap(), 1);
        assert!(v.remove_checksum("m.gguf").unwrap());
        let summary = v.import_checksums(&out).unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(v.verify_checksum(&path, None).unwrap(), ChecksumCheck::Matched);
    }
}
