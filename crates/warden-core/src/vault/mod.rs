//! Small named secrets kept in the OS credential store.
//!
//! Values are encrypted with the session key before they reach the backend,
//! and the set of known names lives in an encrypted index entry because OS
//! keyrings cannot enumerate.

mod backend;

pub use backend::{CredentialBackend, KeyringBackend, MemoryBackend};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::credential::CredentialManager;
use crate::encryption::EncryptionService;
use crate::error::{CoreError, Result};

const INDEX_KEY: &str = "__index__";
const ENTRY_PREFIX: &str = "secret:";
const MAX_NAME_LEN: usize = 128;

#[derive(Serialize, Deserialize)]
struct StoredSecret {
    value: String,
    #[serde(default)]
    metadata: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, PartialEq)]
pub struct VaultSecret {
    pub value: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecret")
            .field("value", &"[REDACTED]")
            .field("metadata", &self.metadata)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SecretPreview {
    pub has_value: bool,
    pub length: usize,
    pub metadata: Option<Value>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportedSecret {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ExportedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedSecret")
            .field("value", &self.value.as_ref().map(|_| "[REDACTED]"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ImportReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct SecretVault {
    backend: Box<dyn CredentialBackend>,
    credentials: Arc<CredentialManager>,
    index_lock: Mutex<()>,
}

impl SecretVault {
    /// Wrap `backend` after confirming it is usable.
    pub fn open(backend: Box<dyn CredentialBackend>, credentials: Arc<CredentialManager>) -> Result<Self> {
        backend.probe()?;
        info!(namespace = backend.namespace(), "secret vault opened");
        Ok(Self {
            backend,
            credentials,
            index_lock: Mutex::new(()),
        })
    }

    /// Open the vault on the platform keyring under `namespace`.
    pub fn open_os(namespace: &str, credentials: Arc<CredentialManager>) -> Result<Self> {
        Self::open(Box::new(KeyringBackend::new(namespace)), credentials)
    }

    /// Encryption service, handed out only while the session is open.
    fn session(&self) -> Result<&EncryptionService> {
        self.credentials.require_session()?;
        Ok(self.credentials.encryption())
    }

    /// Store or replace `name`. Every read happens before the first backend
    /// write, so a failed call leaves the vault as it was.
    pub fn store_secret(&self, name: &str, value: &str, metadata: Option<Value>) -> Result<()> {
        validate_name(name)?;
        let enc = self.session()?;
        let _guard = self.index_lock.lock();
        let existing = self.read_entry(enc, name)?;
        let mut index = self.read_index(enc)?;

        let now = Utc::now();
        let record = StoredSecret {
            value: value.to_string(),
            metadata,
            created_at: existing.map_or(now, |e| e.created_at),
            updated_at: now,
        };
        let plain = Zeroizing::new(serde_json::to_vec(&record)?);
        let token = enc.encrypt(&plain)?;
        self.backend.set(&entry_key(name), &token)?;

        if index.insert(name.to_string()) {
            self.write_index(enc, &index)?;
        }
        info!(name, "vault secret stored");
        Ok(())
    }

    pub fn get_secret(&self, name: &str) -> Result<Option<VaultSecret>> {
        validate_name(name)?;
        let enc = self.session()?;
        Ok(self.read_entry(enc, name)?.map(|s| VaultSecret {
            value: s.value,
            metadata: s.metadata,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }))
    }

    pub fn delete_secret(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let enc = self.session()?;
        let _guard = self.index_lock.lock();
        let mut index = self.read_index(enc)?;
        let removed = self.backend.delete(&entry_key(name))?;
        if index.remove(name) {
            self.write_index(enc, &index)?;
        }
        if removed {
            info!(name, "vault secret deleted");
        }
        Ok(removed)
    }

    pub fn list_names(&self) -> Result<Vec<String>> {
        let enc = self.session()?;
        Ok(self.read_index(enc)?.into_iter().collect())
    }

    /// Shape of a secret without its value.
    pub fn get_secret_preview(&self, name: &str) -> Result<SecretPreview> {
        Ok(match self.get_secret(name)? {
            Some(s) => SecretPreview {
                has_value: !s.value.is_empty(),
                length: s.value.chars().count(),
                metadata: s.metadata,
            },
            None => SecretPreview {
                has_value: false,
                length: 0,
                metadata: None,
            },
        })
    }

    pub fn export(&self, include_values: bool) -> Result<BTreeMap<String, ExportedSecret>> {
        let mut out = BTreeMap::new();
        for name in self.list_names()? {
            match self.get_secret(&name)? {
                Some(s) => {
                    out.insert(
                        name,
                        ExportedSecret {
                            value: include_values.then_some(s.value),
                            metadata: s.metadata,
                            created_at: Some(s.created_at),
                            updated_at: Some(s.updated_at),
                        },
                    );
                }
                None => warn!(name = %name, "indexed vault secret is missing from the store"),
            }
        }
        info!(count = out.len(), include_values, "vault exported");
        Ok(out)
    }

    /// Store each record with a value. A lapsed session aborts the import;
    /// any other per-record failure is reported and skipped.
    pub fn import(&self, records: BTreeMap<String, ExportedSecret>) -> Result<ImportReport> {
        self.session()?;
        let mut report = ImportReport::default();
        for (name, record) in records {
            let Some(value) = record.value else {
                warn!(name = %name, "import record has no value");
                report.failed.push(name);
                continue;
            };
            match self.store_secret(&name, &value, record.metadata) {
                Ok(()) => report.succeeded.push(name),
                Err(CoreError::SessionExpired) => return Err(CoreError::SessionExpired),
                Err(e) => {
                    warn!(name = %name, "import failed: {e}");
                    report.failed.push(name);
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "vault import finished"
        );
        Ok(report)
    }

    /// Delete every indexed secret. Names whose deletion failed stay indexed.
    pub fn clear_all(&self) -> Result<bool> {
        let enc = self.session()?;
        let _guard = self.index_lock.lock();
        let index = self.read_index(enc)?;
        let mut remaining = BTreeSet::new();
        for name in index {
            if let Err(e) = self.backend.delete(&entry_key(&name)) {
                warn!(name = %name, "could not delete vault secret: {e}");
                remaining.insert(name);
            }
        }
        if remaining.is_empty() {
            self.backend.delete(INDEX_KEY)?;
            info!("vault cleared");
            Ok(true)
        } else {
            self.write_index(enc, &remaining)?;
            warn!(failed = remaining.len(), "vault partially cleared");
            Ok(false)
        }
    }

    fn read_entry(&self, enc: &EncryptionService, name: &str) -> Result<Option<StoredSecret>> {
        let Some(token) = self.backend.get(&entry_key(name))? else {
            return Ok(None);
        };
        let plain = enc.decrypt(&token)?;
        Ok(Some(serde_json::from_slice(&plain)?))
    }

    fn read_index(&self, enc: &EncryptionService) -> Result<BTreeSet<String>> {
        match self.backend.get(INDEX_KEY)? {
            Some(token) => {
                let plain = enc.decrypt(&token)?;
                Ok(serde_json::from_slice(&plain)?)
            }
            None => Ok(BTreeSet::new()),
        }
    }

    fn write_index(&self, enc: &EncryptionService, index: &BTreeSet<String>) -> Result<()> {
        let token = enc.encrypt(&serde_json::to_vec(index)?)?;
        self.backend.set(INDEX_KEY, &token)
    }
}

fn entry_key(name: &str) -> String {
    format!("{ENTRY_PREFIX}{name}")
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CoreError::InvalidName(format!(
            "name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    if name.starts_with("__") {
        return Err(CoreError::InvalidName(format!("{name}: reserved prefix")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(CoreError::InvalidName(format!(
            "{name}: only [A-Za-z0-9._-] allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::tests::{manager, unlocked};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        backend: Arc<MemoryBackend>,
        creds: Arc<CredentialManager>,
        vault: SecretVault,
    }

    fn memory_vault() -> Fixture {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new("warden-test"));
        let creds = Arc::new(unlocked(&dir));
        let vault = SecretVault::open(Box::new(Shared(backend.clone())), creds.clone()).unwrap();
        Fixture {
            _dir: dir,
            backend,
            creds,
            vault,
        }
    }

    /// A second vault over the same backend, unlocked with an unrelated data key.
    fn foreign_vault(backend: &Arc<MemoryBackend>) -> (TempDir, SecretVault) {
        let dir = tempdir().unwrap();
        let creds = Arc::new(unlocked(&dir));
        let vault = SecretVault::open(Box::new(Shared(backend.clone())), creds).unwrap();
        (dir, vault)
    }

    /// Lets a test keep a handle on the backend the vault owns.
    struct Shared(Arc<MemoryBackend>);

    impl CredentialBackend for Shared {
        fn namespace(&self) -> &str {
            self.0.namespace()
        }
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.0.set(key, value)
        }
        fn delete(&self, key: &str) -> Result<bool> {
            self.0.delete(key)
        }
        fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Refuses to delete selected keys.
    struct Stubborn {
        inner: MemoryBackend,
        pinned: BTreeSet<String>,
    }

    impl CredentialBackend for Stubborn {
        fn namespace(&self) -> &str {
            self.inner.namespace()
        }
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value)
        }
        fn delete(&self, key: &str) -> Result<bool> {
            if self.pinned.contains(key) {
                return Err(CoreError::VaultUnavailable("locked entry".into()));
            }
            self.inner.delete(key)
        }
        fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl CredentialBackend for Broken {
        fn namespace(&self) -> &str {
            "broken"
        }
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(CoreError::VaultUnavailable("no backend".into()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(CoreError::VaultUnavailable("no backend".into()))
        }
        fn delete(&self, _key: &str) -> Result<bool> {
            Err(CoreError::VaultUnavailable("no backend".into()))
        }
        fn probe(&self) -> Result<()> {
            Err(CoreError::VaultUnavailable("no secret service".into()))
        }
    }

    #[test]
    fn store_get_delete_roundtrip() {
        let f = memory_vault();
        let vault = &f.vault;
        vault
            .store_secret("openai", "sk-abc", Some(json!({"label": "work"})))
            .unwrap();
        let got = vault.get_secret("openai").unwrap().unwrap();
        assert_eq!(got.value, "sk-abc");
        assert_eq!(got.metadata, Some(json!({"label": "work"})));
        assert_eq!(vault.list_names().unwrap(), vec!["openai"]);

        assert!(vault.delete_secret("openai").unwrap());
        assert!(vault.get_secret("openai").unwrap().is_none());
        assert!(vault.list_names().unwrap().is_empty());
        assert!(!vault.delete_secret("openai").unwrap());
    }

    #[test]
    fn backend_only_sees_ciphertext() {
        let f = memory_vault();
        f.vault.store_secret("openai", "sk-very-secret", None).unwrap();
        let raw = f.backend.raw_entries();
        assert_eq!(raw.len(), 2);
        assert!(raw.contains_key("secret:openai"));
        assert!(raw.contains_key(INDEX_KEY));
        for value in raw.values() {
            assert!(!value.contains("sk-very-secret"));
            assert!(!value.contains("openai"));
        }
    }

    #[test]
    fn overwrite_keeps_created_at() {
        let f = memory_vault();
        let vault = &f.vault;
        vault.store_secret("svc", "one", None).unwrap();
        let first = vault.get_secret("svc").unwrap().unwrap();
        vault.store_secret("svc", "two", None).unwrap();
        let second = vault.get_secret("svc").unwrap().unwrap();
        assert_eq!(second.value, "two");
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(vault.list_names().unwrap().len(), 1);
    }

    #[test]
    fn logged_out_vault_fails_closed() {
        let f = memory_vault();
        let vault = &f.vault;
        vault.store_secret("svc", "v", None).unwrap();
        let before = f.backend.raw_entries();

        f.creds.logout();
        assert!(matches!(vault.get_secret("svc"), Err(CoreError::SessionExpired)));
        assert!(matches!(vault.list_names(), Err(CoreError::SessionExpired)));
        assert!(matches!(
            vault.get_secret_preview("svc"),
            Err(CoreError::SessionExpired)
        ));
        assert!(matches!(
            vault.store_secret("svc", "v2", None),
            Err(CoreError::SessionExpired)
        ));
        assert!(matches!(vault.delete_secret("svc"), Err(CoreError::SessionExpired)));
        assert!(matches!(vault.export(false), Err(CoreError::SessionExpired)));
        assert!(matches!(
            vault.import(BTreeMap::new()),
            Err(CoreError::SessionExpired)
        ));
        assert!(matches!(vault.clear_all(), Err(CoreError::SessionExpired)));
        assert_eq!(f.backend.raw_entries(), before);
    }

    #[test]
    fn timed_out_vault_fails_closed() {
        let f = memory_vault();
        f.vault.store_secret("openai", "sk-abc", None).unwrap();
        f.creds.set_session_timeout(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(60));

        assert!(matches!(
            f.vault.get_secret("openai"),
            Err(CoreError::SessionExpired)
        ));
        assert!(matches!(f.vault.list_names(), Err(CoreError::SessionExpired)));
        assert!(!f.creds.encryption().has_key());
    }

    #[test]
    fn empty_locked_vault_still_refuses_listing() {
        let dir = tempdir().unwrap();
        let creds = Arc::new(manager(&dir));
        let vault = SecretVault::open(Box::new(MemoryBackend::new("t")), creds).unwrap();
        assert!(matches!(vault.list_names(), Err(CoreError::SessionExpired)));
    }

    #[test]
    fn foreign_key_cannot_read() {
        let f = memory_vault();
        f.vault.store_secret("svc", "v", None).unwrap();
        let (_dir, other) = foreign_vault(&f.backend);
        assert!(matches!(other.get_secret("svc"), Err(CoreError::Decryption(_))));
    }

    #[test]
    fn foreign_key_cannot_overwrite() {
        let f = memory_vault();
        f.vault.store_secret("openai", "sk-abc", None).unwrap();
        let before = f.backend.raw_entries();

        let (_dir, other) = foreign_vault(&f.backend);
        assert!(matches!(
            other.store_secret("openai", "attacker", None),
            Err(CoreError::Decryption(_))
        ));
        assert_eq!(f.backend.raw_entries(), before);
        assert_eq!(f.vault.get_secret("openai").unwrap().unwrap().value, "sk-abc");
    }

    #[test]
    fn unreadable_index_blocks_writes() {
        let f = memory_vault();
        f.vault.store_secret("a", "alpha", None).unwrap();
        f.backend.set(INDEX_KEY, "not-a-token").unwrap();
        let before = f.backend.raw_entries();

        assert!(f.vault.store_secret("b", "bravo", None).is_err());
        assert!(f.vault.store_secret("a", "changed", None).is_err());
        assert_eq!(f.backend.raw_entries(), before);
        assert_eq!(f.vault.get_secret("a").unwrap().unwrap().value, "alpha");
    }

    #[test]
    fn preview_hides_value() {
        let f = memory_vault();
        f.vault
            .store_secret("gh", "ghp_123456", Some(json!({"scope": "repo"})))
            .unwrap();
        let p = f.vault.get_secret_preview("gh").unwrap();
        assert!(p.has_value);
        assert_eq!(p.length, 10);
        assert_eq!(p.metadata, Some(json!({"scope": "repo"})));
        assert!(!serde_json::to_string(&p).unwrap().contains("ghp_"));

        let missing = f.vault.get_secret_preview("nothing").unwrap();
        assert!(!missing.has_value);
    }

    #[test]
    fn export_and_import() {
        let f = memory_vault();
        f.vault.store_secret("a", "alpha", None).unwrap();
        f.vault.store_secret("b", "bravo", Some(json!(1))).unwrap();

        let shapes = f.vault.export(false).unwrap();
        assert!(shapes.values().all(|r| r.value.is_none()));
        let full = f.vault.export(true).unwrap();
        assert_eq!(full["a"].value.as_deref(), Some("alpha"));

        let target = memory_vault();
        let mut records = full.clone();
        records.insert(
            "c".into(),
            ExportedSecret {
                value: None,
                metadata: None,
                created_at: None,
                updated_at: None,
            },
        );
        records.insert(
            "bad name!".into(),
            ExportedSecret {
                value: Some("x".into()),
                metadata: None,
                created_at: None,
                updated_at: None,
            },
        );
        let report = target.vault.import(records).unwrap();
        assert_eq!(report.succeeded, vec!["a", "b"]);
        assert_eq!(report.failed, vec!["bad name!", "c"]);
        assert_eq!(target.vault.get_secret("b").unwrap().unwrap().value, "bravo");
    }

    #[test]
    fn clear_all_reports_partial_failure() {
        let dir = tempdir().unwrap();
        let creds = Arc::new(unlocked(&dir));
        let mut pinned = BTreeSet::new();
        pinned.insert(entry_key("stuck"));
        let vault = SecretVault::open(
            Box::new(Stubborn {
                inner: MemoryBackend::new("t"),
                pinned,
            }),
            creds,
        )
        .unwrap();
        vault.store_secret("free", "1", None).unwrap();
        vault.store_secret("stuck", "2", None).unwrap();

        assert!(!vault.clear_all().unwrap());
        assert_eq!(vault.list_names().unwrap(), vec!["stuck"]);
        assert!(vault.get_secret("free").unwrap().is_none());
        assert_eq!(vault.get_secret("stuck").unwrap().unwrap().value, "2");
    }

    #[test]
    fn clear_all_success_empties_everything() {
        let f = memory_vault();
        f.vault.store_secret("a", "1", None).unwrap();
        f.vault.store_secret("b", "2", None).unwrap();
        assert!(f.vault.clear_all().unwrap());
        assert!(f.backend.raw_entries().is_empty());
        assert!(f.vault.list_names().unwrap().is_empty());
    }

    #[test]
    fn unavailable_backend_is_reported_at_construction() {
        let dir = tempdir().unwrap();
        let creds = Arc::new(unlocked(&dir));
        assert!(matches!(
            SecretVault::open(Box::new(Broken), creds),
            Err(CoreError::VaultUnavailable(_))
        ));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("openai").is_ok());
        assert!(validate_name("my-key_2.prod").is_ok());
        let long = "x".repeat(129);
        for bad in ["", "__index__", "has space", "slash/name", long.as_str()] {
            assert!(validate_name(bad).is_err(), "{bad:?} accepted");
        }
    }
}
