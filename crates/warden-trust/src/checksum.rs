use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use warden_core::fsutil;

use crate::error::{Result, TrustError};

pub const HASH_CHUNK_SIZE: usize = 64 * 1024;
const REGISTRY_VERSION: u32 = 1;

/// Streaming SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TrustError::NotFound(path.to_path_buf()),
        _ => TrustError::Io(e),
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Lower-case hex SHA-256 of a file.
pub fn hash_file(path: &Path) -> Result<String> {
    Ok(hex::encode(sha256_file(path)?))
}

/// [`hash_file`] on a blocking worker so large models do not stall the caller's runtime.
pub async fn checksum_async(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| TrustError::Task(e.to_string()))?
}

/// Accepts `abc…`, `ABC…` or `sha256:abc…`; returns 64 lower-case hex chars.
pub fn normalize_digest(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    let lower = hex_part.to_ascii_lowercase();
    if lower.len() != 64 || !lower.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TrustError::InvalidDigest(input.to_string()));
    }
    Ok(lower)
}

/// The file name a checksum record is keyed on.
pub fn logical_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelChecksumRecord {
    pub model_name: String,
    pub digest: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub source_url: Option<String>,
}

fn default_algorithm() -> String {
    "sha256".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChecksumCheck {
    /// Digest matched the expected or pinned value.
    Matched,
    /// No prior digest existed; the computed one is now pinned.
    FirstUse { digest: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub unchanged: usize,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChecksumFile {
    version: u32,
    #[serde(default)]
    models: BTreeMap<String, ModelChecksumRecord>,
}

/// Known-good digests keyed by model name, persisted as JSON.
#[derive(Debug, Default)]
pub struct ChecksumRegistry {
    path: Option<PathBuf>,
    records: BTreeMap<String, ModelChecksumRecord>,
}

impl ChecksumRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let records = match fsutil::read_json_opt::<ChecksumFile>(path)? {
            Some(file) => file.models,
            None => BTreeMap::new(),
        };
        debug!(path = %path.display(), count = records.len(), "checksum registry loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            records,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModelChecksumRecord> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn insert(&mut self, record: ModelChecksumRecord) -> Result<()> {
        self.records.insert(record.model_name.clone(), record);
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let removed = self.records.remove(name).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Merge records from a distributed trust list. Existing pins are never
    /// overwritten; disagreeing entries are reported as conflicts.
    pub fn import_from(&mut self, path: &Path) -> Result<ImportSummary> {
        let file: ChecksumFile = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut offered = Vec::with_capacity(file.models.len());
        for (name, mut record) in file.models {
            record.digest = normalize_digest(&record.digest)?;
            record.model_name = name.clone();
            offered.push((name, record));
        }
        let mut summary = ImportSummary::default();
        for (name, record) in offered {
            match self.records.get(&name) {
                Some(existing) if existing.digest == record.digest => summary.unchanged += 1,
                Some(existing) => {
                    warn!(
                        model = %name,
                        pinned = %existing.digest,
                        offered = %record.digest,
                        "checksum import conflict; keeping pinned digest"
                    );
                    summary.conflicts.push(name);
                }
                None => {
                    self.records.insert(name, record);
                    summary.imported += 1;
                }
            }
        }
        if summary.imported > 0 {
            self.save()?;
        }
        info!(
            imported = summary.imported,
            unchanged = summary.unchanged,
            conflicts = summary.conflicts.len(),
            "checksums imported"
        );
        Ok(summary)
    }

    pub fn export_to(&self, path: &Path) -> Result<usize> {
        fsutil::write_json_atomic(path, &self.as_file())?;
        info!(path = %path.display(), count = self.records.len(), "checksums exported");
        Ok(self.records.len())
    }

    fn as_file(&self) -> ChecksumFile {
        ChecksumFile {
            version: REGISTRY_VERSION,
            models: self.records.clone(),
        }
    }

    fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            fsutil::write_json_atomic(path, &self.as_file())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn record(name: &str, digest: &str) -> ModelChecksumRecord {
        ModelChecksumRecord {
            model_name: name.into(),
            digest: digest.into(),
            algorithm: "sha256".into(),
            first_seen_at: Utc::now(),
            source_url: None,
        }
    }

    #[test]
    fn hash_matches_known_vectors() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(hash_file(&empty).unwrap(), EMPTY_SHA256);

        let big = dir.path().join("big");
        let data = vec![0xabu8; HASH_CHUNK_SIZE * 2 + 3];
        std::fs::write(&big, &data).unwrap();
        assert_eq!(hash_file(&big).unwrap(), hex::encode(Sha256::digest(&data)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            hash_file(&dir.path().join("nope")),
            Err(TrustError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn async_checksum_matches_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, b"weights").unwrap();
        assert_eq!(checksum_async(path.clone()).await.unwrap(), hash_file(&path).unwrap());
    }

    #[test]
    fn digest_normalization() {
        assert_eq!(normalize_digest(&EMPTY_SHA256.to_uppercase()).unwrap(), EMPTY_SHA256);
        assert_eq!(
            normalize_digest(&format!("sha256:{EMPTY_SHA256}")).unwrap(),
            EMPTY_SHA256
        );
        assert!(normalize_digest("deadbeef").is_err());
        assert!(normalize_digest(&"z".repeat(64)).is_err());
    }

    #[test]
    fn registry_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model_checksums.json");
        let mut reg = ChecksumRegistry::load(&path).unwrap();
        assert!(reg.is_empty());
        reg.insert(record("a.gguf", EMPTY_SHA256)).unwrap();

        let reg = ChecksumRegistry::load(&path).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("a.gguf").unwrap().digest, EMPTY_SHA256);
    }

    #[test]
    fn import_keeps_pins_and_reports_conflicts() {
        let dir = tempdir().unwrap();
        let other = "a".repeat(64);

        let mut source = ChecksumRegistry::in_memory();
        source.records.insert("same.gguf".into(), record("same.gguf", EMPTY_SHA256));
        source.records.insert("new.gguf".into(), record("new.gguf", EMPTY_SHA256));
        source.records.insert("clash.gguf".into(), record("clash.gguf", &other));
        let list = dir.path().join("list.json");
        assert_eq!(source.export_to(&list).unwrap(), 3);

        let mut reg = ChecksumRegistry::in_memory();
        reg.insert(record("same.gguf", EMPTY_SHA256)).unwrap();
        reg.insert(record("clash.gguf", EMPTY_SHA256)).unwrap();
        let summary = reg.import_from(&list).unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                imported: 1,
                unchanged: 1,
                conflicts: vec!["clash.gguf".into()],
            }
        );
        assert_eq!(reg.get("clash.gguf").unwrap().digest, EMPTY_SHA256);
        assert!(reg.get("new.gguf").is_some());
    }

    #[test]
    fn import_rejects_bad_digests() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("bad.json");
        std::fs::write(
            &list,
            serde_json::json!({
                "version": 1,
                "models": {
                    "x.gguf": {
                        "model_name": "x.gguf",
                        "digest": "not-hex",
                        "first_seen_at": "2024-01-01T00:00:00Z"
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        let mut reg = ChecksumRegistry::in_memory();
        assert!(matches!(
            reg.import_from(&list),
            Err(TrustError::InvalidDigest(_))
        ));
    }
}
