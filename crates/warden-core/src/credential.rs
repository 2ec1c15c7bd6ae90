//! Master credential and session lifetime.
//!
//! The session flag and the key held by [`EncryptionService`] are only ever
//! changed together, under the single `session` lock. The key installed on
//! unlock is a random data key kept wrapped in `master.json` under a
//! passphrase-derived key, so changing the passphrase never orphans data
//! encrypted before the change.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, DERIVED_KEY_LEN};
use crate::encryption::{open_token, seal_token, EncryptionService};
use crate::error::{CoreError, Result};
use crate::fsutil;
use crate::settings::{PasswordHashSettings, WardenSettings};

pub const MIN_PASSPHRASE_LEN: usize = 12;
const RECORD_VERSION: u32 = 1;
const WRAP_AAD: &[u8] = b"warden.keywrap.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Uninitialized,
    NoCredential,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub state: CredentialState,
    pub timeout: Duration,
    pub idle: Option<Duration>,
    pub remaining: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MasterCredentialRecord {
    version: u32,
    password_hash: String,
    kdf_salt: String,
    kdf_iterations: u32,
    wrapped_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    state: CredentialState,
    authenticated: bool,
    last_activity: Option<Instant>,
    timeout: Duration,
    failed_attempts: u32,
    locked_out_until: Option<Instant>,
}

pub struct CredentialManager {
    path: PathBuf,
    encryption: Arc<EncryptionService>,
    hash_cost: PasswordHashSettings,
    max_failed_attempts: u32,
    lockout: Duration,
    session: Mutex<Session>,
}

impl CredentialManager {
    /// Build a manager in the `Uninitialized` state. Call [`load`](Self::load)
    /// before use, or construct with [`open`](Self::open).
    pub fn new(
        path: impl Into<PathBuf>,
        encryption: Arc<EncryptionService>,
        settings: &WardenSettings,
    ) -> Self {
        Self {
            path: path.into(),
            encryption,
            hash_cost: settings.password_hash.clone(),
            max_failed_attempts: settings.session.max_failed_attempts.max(1),
            lockout: settings.session.lockout(),
            session: Mutex::new(Session {
                state: CredentialState::Uninitialized,
                authenticated: false,
                last_activity: None,
                timeout: settings.session.timeout(),
                failed_attempts: 0,
                locked_out_until: None,
            }),
        }
    }

    pub fn open(
        path: impl Into<PathBuf>,
        encryption: Arc<EncryptionService>,
        settings: &WardenSettings,
    ) -> Result<Self> {
        let manager = Self::new(path, encryption, settings);
        manager.load()?;
        Ok(manager)
    }

    /// Read the credential file and move out of `Uninitialized`.
    pub fn load(&self) -> Result<CredentialState> {
        let mut session = self.session.lock();
        let state = match self.read_record()? {
            Some(_) => CredentialState::Locked,
            None => CredentialState::NoCredential,
        };
        if session.state != CredentialState::Unlocked {
            session.state = state;
        }
        Ok(session.state)
    }

    pub fn credential_path(&self) -> &Path {
        &self.path
    }

    pub fn encryption(&self) -> &Arc<EncryptionService> {
        &self.encryption
    }

    pub fn has_master_credential(&self) -> bool {
        self.path.exists()
    }

    pub fn state(&self) -> CredentialState {
        let mut session = self.session.lock();
        self.check_session(&mut session);
        session.state
    }

    /// Create the master credential. Only legal while no credential exists.
    pub fn set_master_credential(&self, passphrase: &str) -> Result<()> {
        check_strength(passphrase)?;
        let mut session = self.session.lock();
        if session.state != CredentialState::NoCredential || self.path.exists() {
            return Err(CoreError::InvalidState(format!(
                "cannot create a master credential in state {:?}",
                session.state
            )));
        }
        let data_key = EncryptionService::generate_data_key();
        let now = Utc::now();
        self.write_record(passphrase, &data_key, now)?;
        session.state = CredentialState::Locked;
        info!(path = %self.path.display(), "master credential created");
        Ok(())
    }

    /// Check `passphrase` and open a session. Any failure leaves the manager
    /// locked with no key installed.
    pub fn verify_and_unlock(&self, passphrase: &str) -> bool {
        let mut session = self.session.lock();
        self.unlock_locked(&mut session, passphrase).is_some()
    }

    /// Rewrap the data key under `new`. Returns `Ok(false)` when `old` does not verify.
    pub fn change_master_credential(&self, old: &str, new: &str) -> Result<bool> {
        check_strength(new)?;
        let mut session = self.session.lock();
        let data_key = match self.unlock_locked(&mut session, old) {
            Some(k) => k,
            None => return Ok(false),
        };
        let created_at = match self.read_record()? {
            Some(r) => r.created_at,
            None => Utc::now(),
        };
        self.write_record(new, &data_key, created_at)?;
        self.encryption.set_key(&data_key);
        session.last_activity = Some(Instant::now());
        info!("master credential changed");
        Ok(true)
    }

    pub fn is_session_valid(&self) -> bool {
        let mut session = self.session.lock();
        self.check_session(&mut session)
    }

    /// Fails with [`CoreError::SessionExpired`] unless a session is open.
    pub fn require_session(&self) -> Result<()> {
        if self.is_session_valid() {
            Ok(())
        } else {
            Err(CoreError::SessionExpired)
        }
    }

    pub fn touch_activity(&self) {
        let mut session = self.session.lock();
        if self.check_session(&mut session) {
            session.last_activity = Some(Instant::now());
        }
    }

    pub fn logout(&self) {
        let mut session = self.session.lock();
        self.end_session(&mut session);
        info!("session closed");
    }

    pub fn auto_lock(&self) {
        let mut session = self.session.lock();
        self.end_session(&mut session);
        info!("session auto-locked");
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        self.session.lock().timeout = timeout;
    }

    pub fn session_info(&self) -> SessionInfo {
        let mut session = self.session.lock();
        self.check_session(&mut session);
        let idle = session
            .last_activity
            .filter(|_| session.authenticated)
            .map(|t| t.elapsed());
        SessionInfo {
            state: session.state,
            timeout: session.timeout,
            idle,
            remaining: idle.map(|i| session.timeout.saturating_sub(i)),
        }
    }

    fn check_session(&self, session: &mut Session) -> bool {
        if !session.authenticated {
            self.encryption.clear_key();
            return false;
        }
        let expired = match session.last_activity {
            Some(t) => t.elapsed() > session.timeout,
            None => true,
        };
        if expired {
            info!("session timed out");
            self.end_session(session);
            return false;
        }
        if !self.encryption.has_key() {
            warn!("session open without an installed key; locking");
            self.end_session(session);
            return false;
        }
        true
    }

    fn end_session(&self, session: &mut Session) {
        self.encryption.clear_key();
        session.authenticated = false;
        session.last_activity = None;
        if session.state == CredentialState::Unlocked {
            session.state = CredentialState::Locked;
        }
    }

    fn unlock_locked(
        &self,
        session: &mut Session,
        passphrase: &str,
    ) -> Option<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
        self.end_session(session);
        if !matches!(session.state, CredentialState::Locked) {
            warn!(state = ?session.state, "unlock attempted without a master credential");
            return None;
        }
        if let Some(until) = session.locked_out_until {
            if Instant::now() < until {
                warn!("unlock refused during failed-attempt lockout");
                return None;
            }
            session.locked_out_until = None;
        }

        let record = match self.read_record() {
            Ok(Some(r)) => r,
            Ok(None) => {
                error!(path = %self.path.display(), "master credential record disappeared");
                return None;
            }
            Err(e) => {
                error!(path = %self.path.display(), "cannot read master credential: {e}");
                return None;
            }
        };

        if !crypto::verify_password(passphrase, &record.password_hash) {
            session.failed_attempts += 1;
            warn!(attempts = session.failed_attempts, "master credential verification failed");
            if session.failed_attempts >= self.max_failed_attempts {
                session.failed_attempts = 0;
                session.locked_out_until = Some(Instant::now() + self.lockout);
                warn!(secs = self.lockout.as_secs(), "too many failed attempts; locking out");
            }
            return None;
        }

        let data_key = match unwrap_data_key(&record, passphrase) {
            Ok(k) => k,
            Err(e) => {
                error!("master credential verified but data key did not unwrap: {e}");
                return None;
            }
        };
        self.encryption.set_key(&data_key);
        session.authenticated = true;
        session.last_activity = Some(Instant::now());
        session.failed_attempts = 0;
        session.state = CredentialState::Unlocked;
        info!("session unlocked");
        Some(data_key)
    }

    fn read_record(&self) -> Result<Option<MasterCredentialRecord>> {
        let record: Option<MasterCredentialRecord> = fsutil::read_json_opt(&self.path)?;
        if let Some(r) = &record {
            if r.version != RECORD_VERSION {
                return Err(CoreError::InvalidState(format!(
                    "unsupported credential record version {}",
                    r.version
                )));
            }
        }
        Ok(record)
    }

    fn write_record(
        &self,
        passphrase: &str,
        data_key: &[u8; DERIVED_KEY_LEN],
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let password_hash = crypto::hash_password(passphrase, &self.hash_cost)?;
        let (wrapping_key, salt) = self.encryption.derive_key(passphrase, None)?;
        let wrapped_key = seal_token(&wrapping_key, WRAP_AAD, data_key)?;
        let record = MasterCredentialRecord {
            version: RECORD_VERSION,
            password_hash,
            kdf_salt: hex::encode(salt),
            kdf_iterations: self.encryption.iterations(),
            wrapped_key,
            created_at,
            updated_at: Utc::now(),
        };
        fsutil::write_json_atomic(&self.path, &record)?;
        Ok(())
    }
}

fn unwrap_data_key(
    record: &MasterCredentialRecord,
    passphrase: &str,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    let salt = hex::decode(&record.kdf_salt)
        .map_err(|_| CoreError::Decryption("credential salt is not hex".into()))?;
    let wrapping_key = crypto::derive_key(passphrase, &salt, record.kdf_iterations)?;
    let raw = open_token(&wrapping_key, WRAP_AAD, &record.wrapped_key)?;
    if raw.len() != DERIVED_KEY_LEN {
        return Err(CoreError::Decryption("wrapped key has wrong length".into()));
    }
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    key.copy_from_slice(&raw);
    Ok(key)
}

fn check_strength(passphrase: &str) -> Result<()> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(CoreError::WeakPassphrase(MIN_PASSPHRASE_LEN));
    }
    Ok(())
}
