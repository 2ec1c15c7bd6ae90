//! Encrypted relational store for settings, passwords, API keys and transcripts.
//!
//! Sensitive columns only ever hold tokens produced by [`EncryptionService`];
//! identifiers needed for lookup (setting keys, service names, usernames,
//! conversation ids) stay in the clear. Every public method checks the
//! session first and fails with [`CoreError::SessionExpired`] once it lapses.

mod api_keys;
mod conversations;
pub mod models;
mod passwords;
mod schema;
mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};
use serde_json::Value;
use tracing::info;

use crate::credential::CredentialManager;
use crate::encryption::EncryptionService;
use crate::error::{CoreError, Result};
use crate::fsutil;

pub use models::{
    ApiKeyRecord, ApiKeySummary, ConversationMessage, ConversationSummary, PasswordEntry,
    PasswordSummary,
};
pub use schema::SCHEMA_VERSION;

pub struct SecretStore {
    conn: Mutex<Connection>,
    credentials: Arc<CredentialManager>,
}

impl SecretStore {
    pub fn open(path: &Path, credentials: Arc<CredentialManager>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA secure_delete = ON;",
        )?;
        fsutil::restrict_file_permissions(path);
        let store = Self::from_connection(conn, credentials)?;
        info!(path = %path.display(), "secret store opened");
        Ok(store)
    }

    pub fn open_in_memory(credentials: Arc<CredentialManager>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn, credentials)
    }

    fn from_connection(conn: Connection, credentials: Arc<CredentialManager>) -> Result<Self> {
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            credentials,
        })
    }

    /// Gate for every public operation; hands back the encryption service
    /// only while the session is open.
    fn session(&self) -> Result<&EncryptionService> {
        self.credentials.require_session()?;
        Ok(self.credentials.encryption())
    }

    /// Snapshot the database and write it encrypted to `dest`.
    pub fn backup(&self, dest: &Path) -> Result<PathBuf> {
        let enc = self.session()?;
        let staging = staging_dir(dest)?;
        let snapshot = staging.path().join("snapshot.db");
        {
            let conn = self.conn.lock();
            conn.backup(DatabaseName::Main, &snapshot, None)?;
        }
        let out = enc.encrypt_file(&snapshot, Some(dest))?;
        fsutil::restrict_file_permissions(&out);
        info!(dest = %out.display(), "secret store backed up");
        Ok(out)
    }

    /// Replace the live contents with a backup produced by [`backup`](Self::backup).
    pub fn restore(&self, src: &Path) -> Result<()> {
        let enc = self.session()?;
        let staging = staging_dir(src)?;
        let plain = staging.path().join("restore.db");
        enc.decrypt_file(src, Some(&plain))?;
        {
            let probe = Connection::open(&plain)?;
            let version: i32 = probe
                .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| {
                    r.get(0)
                })
                .map_err(|_| CoreError::InvalidState("backup is not a secret store".into()))?;
            if version > SCHEMA_VERSION {
                return Err(CoreError::InvalidState(format!(
                    "backup schema {version} is newer than supported {SCHEMA_VERSION}"
                )));
            }
        }
        let mut conn = self.conn.lock();
        conn.restore(DatabaseName::Main, &plain, None::<fn(Progress)>)?;
        schema::migrate(&conn)?;
        info!(src = %src.display(), "secret store restored");
        Ok(())
    }
}

fn staging_dir(near: &Path) -> Result<tempfile::TempDir> {
    let parent = match near.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let dir = tempfile::Builder::new()
        .prefix(".warden-staging")
        .tempdir_in(&parent)?;
    fsutil::restrict_dir_permissions(dir.path());
    Ok(dir)
}

pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn encrypt_json(enc: &EncryptionService, value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    enc.encrypt(&bytes)
}

pub(crate) fn decrypt_json(enc: &EncryptionService, token: &str) -> Result<Value> {
    let bytes = enc.decrypt(token)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn decrypt_opt_json(enc: &EncryptionService, token: Option<String>) -> Result<Option<Value>> {
    token.map(|t| decrypt_json(enc, &t)).transpose()
}

pub(crate) fn decrypt_opt_str(enc: &EncryptionService, token: Option<String>) -> Result<Option<String>> {
    token.map(|t| enc.decrypt_str(&t)).transpose()
}
