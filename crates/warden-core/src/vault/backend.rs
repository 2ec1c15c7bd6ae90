use std::collections::BTreeMap;

use keyring::Entry;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{CoreError, Result};

const PROBE_KEY: &str = "__probe__";

/// A named blob store addressed by `(namespace, key)`. Implementations only
/// ever see already-encrypted tokens.
pub trait CredentialBackend: Send + Sync {
    fn namespace(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Returns whether an entry was removed.
    fn delete(&self, key: &str) -> Result<bool>;
    /// Fails with [`CoreError::VaultUnavailable`] when the store cannot be used.
    fn probe(&self) -> Result<()>;
}

/// The platform keyring (Keychain, Credential Manager, Secret Service).
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).map_err(|e| CoreError::VaultUnavailable(format!("keyring init: {e}")))
    }
}

impl CredentialBackend for KeyringBackend {
    fn namespace(&self) -> &str {
        &self.service
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        match self.entry(key)?.delete_password() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn probe(&self) -> Result<()> {
        match self.entry(PROBE_KEY)?.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                warn!(service = %self.service, "OS credential store unavailable: {e}");
                Err(CoreError::VaultUnavailable(e.to_string()))
            }
        }
    }
}

/// Process-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBackend {
    namespace: String,
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Raw stored tokens, keyed as the vault addresses them.
    pub fn raw_entries(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }
}

impl CredentialBackend for MemoryBackend {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn probe(&self) -> Result<()> {
        Ok(())
    }
}
