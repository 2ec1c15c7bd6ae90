use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::fsutil;

pub const MIN_KDF_ITERATIONS: u32 = 100_000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    pub timeout_secs: u64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

impl SessionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfSettings {
    pub iterations: u32,
}

/// Argon2id cost parameters for the master-credential hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordHashSettings {
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultSettings {
    pub service_namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TrustSettings {
    /// Publisher name to base64 Ed25519 public key.
    #[serde(default)]
    pub signing_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WardenSettings {
    pub session: SessionSettings,
    pub kdf: KdfSettings,
    pub password_hash: PasswordHashSettings,
    pub vault: VaultSettings,
    #[serde(default)]
    pub trust: TrustSettings,
}

impl Default for WardenSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings {
                timeout_secs: 900,
                max_failed_attempts: default_max_failed_attempts(),
                lockout_secs: default_lockout_secs(),
            },
            kdf: KdfSettings {
                iterations: DEFAULT_KDF_ITERATIONS,
            },
            password_hash: PasswordHashSettings {
                memory_kib: 19_456,
                time_cost: 2,
                parallelism: 1,
            },
            vault: VaultSettings {
                service_namespace: "warden".to_string(),
            },
            trust: TrustSettings::default(),
        }
    }
}

impl WardenSettings {
    /// Load settings from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match fsutil::read_json_opt::<WardenSettings>(path) {
            Ok(Some(s)) => s,
            Ok(None) => return Ok(Self::default()),
            Err(e) => {
                return Err(CoreError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        fsutil::write_json_atomic(path, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.timeout_secs == 0 {
            return Err(CoreError::Config("session.timeout_secs must be > 0".into()));
        }
        if self.session.max_failed_attempts == 0 {
            return Err(CoreError::Config(
                "session.max_failed_attempts must be > 0".into(),
            ));
        }
        if self.kdf.iterations < MIN_KDF_ITERATIONS {
            return Err(CoreError::Config(format!(
                "kdf.iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        if self.password_hash.time_cost == 0 || self.password_hash.parallelism == 0 {
            return Err(CoreError::Config(
                "password_hash time_cost and parallelism must be > 0".into(),
            ));
        }
        if self.password_hash.memory_kib < 8 * self.password_hash.parallelism {
            return Err(CoreError::Config(
                "password_hash.memory_kib must be at least 8 * parallelism".into(),
            ));
        }
        if self.vault.service_namespace.trim().is_empty() {
            return Err(CoreError::Config("vault.service_namespace is empty".into()));
        }
        Ok(())
    }
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    30
}
