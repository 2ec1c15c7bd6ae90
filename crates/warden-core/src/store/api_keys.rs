use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::info;

use super::models::{ApiKeyRecord, ApiKeySummary};
use super::{decrypt_opt_json, encrypt_json, now_ts, parse_ts, SecretStore};
use crate::error::Result;

impl SecretStore {
    pub fn store_api_key(&self, service: &str, api_key: &str, metadata: Option<&Value>) -> Result<()> {
        let enc = self.session()?;
        let key_enc = enc.encrypt_str(api_key)?;
        let metadata_enc = metadata.map(|m| encrypt_json(enc, m)).transpose()?;
        let now = now_ts();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_keys (service, key_enc, metadata_enc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(service) DO UPDATE SET
                 key_enc = excluded.key_enc,
                 metadata_enc = excluded.metadata_enc,
                 updated_at = excluded.updated_at",
            params![service, key_enc, metadata_enc, now],
        )?;
        info!(service, "api key stored");
        Ok(())
    }

    pub fn get_api_key(&self, service: &str) -> Result<Option<ApiKeyRecord>> {
        let enc = self.session()?;
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT key_enc, metadata_enc, created_at, updated_at
                 FROM api_keys WHERE service = ?1",
                params![service],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        parse_ts(2, row.get(2)?)?,
                        parse_ts(3, row.get(3)?)?,
                    ))
                },
            )
            .optional()?
        };
        let Some((key_enc, metadata_enc, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(ApiKeyRecord {
            service: service.to_string(),
            api_key: enc.decrypt_str(&key_enc)?,
            metadata: decrypt_opt_json(enc, metadata_enc)?,
            created_at,
            updated_at,
        }))
    }

    /// Services with a stored key, with decrypted metadata but never the key.
    pub fn list_api_keys(&self) -> Result<Vec<ApiKeySummary>> {
        let enc = self.session()?;
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT service, metadata_enc, created_at, updated_at
                 FROM api_keys ORDER BY service",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        parse_ts(2, row.get(2)?)?,
                        parse_ts(3, row.get(3)?)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter()
            .map(|(service, metadata_enc, created_at, updated_at)| {
                Ok(ApiKeySummary {
                    service,
                    metadata: decrypt_opt_json(enc, metadata_enc)?,
                    created_at,
                    updated_at,
                })
            })
            .collect()
    }

    pub fn delete_api_key(&self, service: &str) -> Result<bool> {
        self.session()?;
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM api_keys WHERE service = ?1", params![service])?;
        if n > 0 {
            info!(service, "api key deleted");
        }
        Ok(n > 0)
    }
}
