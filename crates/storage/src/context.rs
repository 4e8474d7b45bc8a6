#![forbid(unsafe_code)]

use super::*;
use rusqlite::params;
use std::collections::BTreeMap;

const MAX_CONTEXT_KEY_LEN: usize = 256;

/// Global scope is stored as an empty job id so the `(job_id, key)` primary
/// key and the upsert conflict target cover both scopes.
const GLOBAL_SCOPE: &str = "";

fn scope_of(job_id: Option<&str>) -> &str {
    job_id.unwrap_or(GLOBAL_SCOPE)
}

impl SqliteStore {
    /// Last write wins; entries persist until explicitly deleted.
    pub fn set_shared_context(
        &mut self,
        key: &str,
        value: &str,
        job_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(StoreError::InvalidInput("context key must not be empty"));
        }
        if key.len() > MAX_CONTEXT_KEY_LEN {
            return Err(StoreError::InvalidInput("context key is too long"));
        }
        let scope = scope_of(job_id).to_string();
        let value = value.to_string();
        let now = now_ms();
        self.retrying(|conn| {
            conn.execute(
                r#"
                INSERT INTO shared_context (job_id, key, value, updated_at_ms)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(job_id, key) DO UPDATE SET
                  value=excluded.value,
                  updated_at_ms=excluded.updated_at_ms
                "#,
                params![scope, key, value, now],
            )?;
            Ok(())
        })
    }

    /// Merged context for a job: global entries overlaid by job-scoped ones
    /// (job wins per key). With no job id, just the global scope.
    pub fn shared_context(
        &mut self,
        job_id: Option<&str>,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let job_scope = job_id.map(|j| j.to_string());
        self.retrying(|conn| {
            let mut merged = BTreeMap::new();
            let mut stmt =
                conn.prepare("SELECT key, value FROM shared_context WHERE job_id=?1")?;

            let rows = stmt.query_map(params![GLOBAL_SCOPE], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, value) = row?;
                merged.insert(key, value);
            }

            if let Some(job) = job_scope.as_deref() {
                let rows = stmt.query_map(params![job], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (key, value) = row?;
                    merged.insert(key, value);
                }
            }
            Ok(merged)
        })
    }

    /// Deletes one entry in the given scope; returns whether a row existed.
    pub fn delete_shared_context(
        &mut self,
        key: &str,
        job_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let scope = scope_of(job_id).to_string();
        let key = key.trim().to_string();
        self.retrying(|conn| {
            let changed = conn.execute(
                "DELETE FROM shared_context WHERE job_id=?1 AND key=?2",
                params![scope, key],
            )?;
            Ok(changed > 0)
        })
    }
}
