use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{decrypt_json, encrypt_json, now_ts, SecretStore};
use crate::error::Result;

impl SecretStore {
    pub fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let enc = self.session()?;
        let token = encrypt_json(enc, &serde_json::to_value(value)?)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value_enc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_enc = excluded.value_enc,
                                            updated_at = excluded.updated_at",
            params![key, token, now_ts()],
        )?;
        debug!(key, "setting stored");
        Ok(())
    }

    /// Raw JSON value of a setting, if present.
    pub fn get_setting_value(&self, key: &str) -> Result<Option<Value>> {
        let enc = self.session()?;
        let token: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT value_enc FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
        };
        token.map(|t| decrypt_json(enc, &t)).transpose()
    }

    /// Typed setting lookup; `default` only covers absence, never a failed decrypt.
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.get_setting_value(key)? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(default),
        }
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        self.session()?;
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    pub fn list_setting_keys(&self) -> Result<Vec<String>> {
        self.session()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM settings ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}
