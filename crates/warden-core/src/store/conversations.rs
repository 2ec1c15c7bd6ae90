use rusqlite::params;
use serde_json::Value;
use tracing::{debug, info};

use super::models::{ConversationMessage, ConversationSummary};
use super::{decrypt_opt_json, encrypt_json, now_ts, parse_ts, SecretStore};
use crate::error::Result;

impl SecretStore {
    /// Append a message; returns its row id.
    pub fn store_conversation_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        mode: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<i64> {
        let enc = self.session()?;
        let content_enc = enc.encrypt_str(content)?;
        let metadata_enc = metadata.map(|m| encrypt_json(enc, m)).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversation_messages
                 (conversation_id, role, content_enc, mode, metadata_enc, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![conversation_id, role, content_enc, mode, metadata_enc, now_ts()],
        )?;
        let id = conn.last_insert_rowid();
        debug!(conversation_id, role, id, "conversation message stored");
        Ok(id)
    }

    /// The newest `limit` messages of a conversation, oldest first.
    pub fn get_conversation_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let enc = self.session()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, role, content_enc, mode, metadata_enc, created_at FROM (
                     SELECT id, role, content_enc, mode, metadata_enc, created_at
                     FROM conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2
                 ) ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![conversation_id, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        parse_ts(5, row.get(5)?)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter()
            .map(|(id, role, content_enc, mode, metadata_enc, created_at)| {
                Ok(ConversationMessage {
                    id,
                    conversation_id: conversation_id.to_string(),
                    role,
                    content: enc.decrypt_str(&content_enc)?,
                    mode,
                    metadata: decrypt_opt_json(enc, metadata_enc)?,
                    created_at,
                })
            })
            .collect()
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.session()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, COUNT(*), MAX(created_at)
             FROM conversation_messages
             GROUP BY conversation_id
             ORDER BY MAX(created_at) DESC",
        )?;
        let out = stmt
            .query_map([], |row| {
                Ok(ConversationSummary {
                    conversation_id: row.get(0)?,
                    message_count: row.get::<_, i64>(1)?.max(0) as u64,
                    last_message_at: parse_ts(2, row.get(2)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<usize> {
        self.session()?;
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM conversation_messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        info!(conversation_id, removed = n, "conversation deleted");
        Ok(n)
    }
}
