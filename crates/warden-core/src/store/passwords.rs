use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::models::{PasswordEntry, PasswordSummary};
use super::{decrypt_opt_str, now_ts, parse_ts, SecretStore};
use crate::error::Result;

struct EncryptedPasswordRow {
    id: i64,
    service: String,
    username: String,
    password_enc: String,
    url: Option<String>,
    notes_enc: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

fn row_to_encrypted(row: &Row) -> rusqlite::Result<EncryptedPasswordRow> {
    Ok(EncryptedPasswordRow {
        id: row.get(0)?,
        service: row.get(1)?,
        username: row.get(2)?,
        password_enc: row.get(3)?,
        url: row.get(4)?,
        notes_enc: row.get(5)?,
        created_at: parse_ts(6, row.get(6)?)?,
        updated_at: parse_ts(7, row.get(7)?)?,
    })
}

const ENTRY_COLUMNS: &str =
    "id, service, username, password_enc, url, notes_enc, created_at, updated_at";

impl SecretStore {
    /// Insert or replace the entry for `(service, username)`.
    pub fn store_password(
        &self,
        service: &str,
        username: &str,
        password: &str,
        url: Option<&str>,
        notes: Option<&str>,
    ) -> Result<()> {
        let enc = self.session()?;
        let password_enc = enc.encrypt_str(password)?;
        let notes_enc = notes.map(|n| enc.encrypt_str(n)).transpose()?;
        let now = now_ts();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO password_entries
                 (service, username, password_enc, url, notes_enc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(service, username) DO UPDATE SET
                 password_enc = excluded.password_enc,
                 url = excluded.url,
                 notes_enc = excluded.notes_enc,
                 updated_at = excluded.updated_at",
            params![service, username, password_enc, url, notes_enc, now],
        )?;
        info!(service, username, "password entry stored");
        Ok(())
    }

    /// Exact `(service, username)` lookup, or the most recently updated entry
    /// for `service` when `username` is omitted.
    pub fn get_password(
        &self,
        service: &str,
        username: Option<&str>,
    ) -> Result<Option<PasswordEntry>> {
        let enc = self.session()?;
        let row = {
            let conn = self.conn.lock();
            match username {
                Some(user) => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM password_entries
                             WHERE service = ?1 AND username = ?2"
                        ),
                        params![service, user],
                        row_to_encrypted,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM password_entries
                             WHERE service = ?1
                             ORDER BY updated_at DESC, id DESC LIMIT 1"
                        ),
                        params![service],
                        row_to_encrypted,
                    )
                    .optional()?,
            }
        };
        let Some(row) = row else {
            debug!(service, "no password entry");
            return Ok(None);
        };
        Ok(Some(PasswordEntry {
            id: row.id,
            password: enc.decrypt_str(&row.password_enc)?,
            notes: decrypt_opt_str(enc, row.notes_enc)?,
            service: row.service,
            username: row.username,
            url: row.url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    /// Metadata for every entry. Secret columns are never read.
    pub fn list_passwords(&self) -> Result<Vec<PasswordSummary>> {
        self.session()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, service, username, url, created_at, updated_at
             FROM password_entries ORDER BY service, username",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(PasswordSummary {
                    id: row.get(0)?,
                    service: row.get(1)?,
                    username: row.get(2)?,
                    url: row.get(3)?,
                    created_at: parse_ts(4, row.get(4)?)?,
                    updated_at: parse_ts(5, row.get(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Delete one entry, or every entry for `service` when `username` is omitted.
    pub fn delete_password(&self, service: &str, username: Option<&str>) -> Result<usize> {
        self.session()?;
        let conn = self.conn.lock();
        let n = match username {
            Some(user) => conn.execute(
                "DELETE FROM password_entries WHERE service = ?1 AND username = ?2",
                params![service, user],
            )?,
            None => conn.execute(
                "DELETE FROM password_entries WHERE service = ?1",
                params![service],
            )?,
        };
        info!(service, removed = n, "password entries deleted");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::tests::open_store;
    use tempfile::tempdir;

    #[test]
    fn upsert_keeps_single_record() {
        let dir = tempdir().unwrap();
        let (_c, store) = open_store(&dir);
        store.store_password("svc", "user", "pw1", None, None).unwrap();
        let first = store.get_password("svc", Some("user")).unwrap().unwrap();
        store
            .store_password("svc", "user", "pw2", Some("https://svc.example"), Some("note"))
            .unwrap();

        let listed = store.list_passwords().unwrap();
        assert_eq!(listed.len(), 1);
        let entry = store.get_password("svc", Some("user")).unwrap().unwrap();
        assert_eq!(entry.password, "pw2");
        assert_eq!(entry.notes.as_deref(), Some("note"));
        assert_eq!(entry.id, first.id);
        assert_eq!(entry.created_at, first.created_at);

        let dump = serde_json::to_string(&listed).unwrap();
        assert!(!dump.contains("pw1"));
        assert!(!dump.contains("pw2"));
        assert!(!format!("{entry:?}").contains("pw2"));
    }

    #[test]
    fn omitted_username_returns_most_recent() {
        let dir = tempdir().unwrap();
        let (_c, store) = open_store(&dir);
        let tick = || std::thread::sleep(std::time::Duration::from_millis(5));
        store.store_password("mail", "old", "a", None, None).unwrap();
        tick();
        store.store_password("mail", "new", "b", None, None).unwrap();
        let latest = store.get_password("mail", None).unwrap().unwrap();
        assert_eq!(latest.username, "new");

        tick();
        store.store_password("mail", "old", "c", None, None).unwrap();
        let latest = store.get_password("mail", None).unwrap().unwrap();
        assert_eq!(latest.username, "old");
        assert_eq!(latest.password, "c");
    }

    #[test]
    fn missing_entry_is_none() {
        let dir = tempdir().unwrap();
        let (_c, store) = open_store(&dir);
        assert!(store.get_password("nope", None).unwrap().is_none());
        assert!(store.get_password("nope", Some("x")).unwrap().is_none());
    }

    #[test]
    fn delete_single_and_all() {
        let dir = tempdir().unwrap();
        let (_c, store) = open_store(&dir);
        store.store_password("svc", "a", "1", None, None).unwrap();
        store.store_password("svc", "b", "2", None, None).unwrap();
        store.store_password("other", "a", "3", None, None).unwrap();
        assert_eq!(store.delete_password("svc", Some("a")).unwrap(), 1);
        assert_eq!(store.delete_password("svc", None).unwrap(), 1);
        let left = store.list_passwords().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].service, "other");
    }

    #[test]
    fn password_column_is_ciphertext() {
        let dir = tempdir().unwrap();
        let (_c, store) = open_store(&dir);
        store
            .store_password("svc", "user", "plainly-visible", None, Some("secret note"))
            .unwrap();
        let conn = store.conn.lock();
        let (pw, notes): (String, String) = conn
            .query_row(
                "SELECT password_enc, notes_enc FROM password_entries",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(!pw.contains("plainly-visible"));
        assert!(!notes.contains("secret note"));
        assert_ne!(pw, notes);
    }
}
