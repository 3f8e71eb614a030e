//! The mutation journal.
//!
//! One SQLite file holds the append-only mutation log, write-ahead intents,
//! the settings table, session bookkeeping and backup metadata. Exactly one
//! [`MutationJournal`] is owned by the orchestrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IdError, Result};
use crate::storage::backup::{BackupMethod, BackupRecord};
use crate::storage::migrations;

/// Error text stored for intents found at startup without an outcome.
pub const INTERRUPTED_ERROR: &str = "interrupted before outcome was recorded";

/// A mutation to append to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    pub category: String,
    pub item: String,
    pub original_value: Option<String>,
    pub new_value: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub session_id: Option<String>,
}

impl MutationEntry {
    pub fn new(
        category: impl Into<String>,
        item: impl Into<String>,
        original_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            category: category.into(),
            item: item.into(),
            original_value,
            new_value,
            success: true,
            error: None,
            session_id: None,
        }
    }

    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn in_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }
}

/// A row of the mutation log. Never updated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub item: String,
    pub original_value: Option<String>,
    pub new_value: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub session_id: Option<String>,
}

/// Write-ahead record of a live write about to happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub id: String,
    pub category: String,
    pub item: String,
    /// The resource being written (adapter stable id, registry path, ...).
    pub resource: String,
    pub original_value: Option<String>,
    pub new_value: Option<String>,
    pub session_id: Option<String>,
    /// Registry values this write touches, audited alongside the intent.
    #[serde(default)]
    pub registry_writes: Vec<RegistryChange>,
}

impl MutationIntent {
    pub fn new(
        category: impl Into<String>,
        item: impl Into<String>,
        resource: impl Into<String>,
        original_value: Option<String>,
        new_value: Option<String>,
        session_id: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            item: item.into(),
            resource: resource.into(),
            original_value,
            new_value,
            session_id: session_id.map(str::to_string),
            registry_writes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_registry_write(mut self, change: RegistryChange) -> Self {
        self.registry_writes.push(change);
        self
    }
}

/// One registry value write. `new_value: None` deletes the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryChange {
    pub key_path: String,
    pub value_name: String,
    pub original_value: Option<String>,
    pub new_value: Option<String>,
}

impl RegistryChange {
    pub fn new(
        key_path: impl Into<String>,
        value_name: impl Into<String>,
        original_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            key_path: key_path.into(),
            value_name: value_name.into(),
            original_value,
            new_value,
        }
    }
}

/// A row of the registry audit log. `success` is `None` while the owning
/// intent is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryChangeRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub key_path: String,
    pub value_name: String,
    pub original_value: Option<String>,
    pub new_value: Option<String>,
    pub success: Option<bool>,
    pub session_id: Option<String>,
}

/// A registry value captured into the pre-backup baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValue {
    pub key_path: String,
    pub value_name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` while open.
    pub ended_cleanly: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub per_category: BTreeMap<String, CategoryStats>,
}

/// String-keyed, JSON-valued settings. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, Value>);

impl Settings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Decode a setting. `Ok(None)` when absent or JSON null.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Decode a setting, falling back to `default` when absent or malformed.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                warn!(key, error = %err, "malformed setting, using default");
                default
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// SQLite-backed mutation journal.
pub struct MutationJournal {
    pub(crate) conn: Connection,
    path: PathBuf,
    schema_version: u32,
    pub(crate) busy_timeout: Duration,
}

impl std::fmt::Debug for MutationJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationJournal")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

impl MutationJournal {
    /// Open (or create) the journal at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Self::connect(&path, busy_timeout)?;
        let schema_version = migrations::run_migrations(&conn)?;
        debug!(path = %path.display(), schema_version, "journal opened");

        Ok(Self {
            conn,
            path,
            schema_version,
            busy_timeout,
        })
    }

    pub(crate) fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
        let conn = Connection::open(path).map_err(|err| {
            IdError::JournalUnavailable(format!("open {}: {err}", path.display()))
        })?;
        conn.busy_timeout(busy_timeout)?;
        Self::configure_pragmas(&conn)?;
        Ok(conn)
    }

    /// Re-run migrations after the underlying file was replaced.
    pub(crate) fn reopen(&mut self) -> Result<()> {
        self.conn = Self::connect(&self.path, self.busy_timeout)?;
        self.schema_version = migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Run `PRAGMA quick_check`.
    pub fn integrity_check(&self) -> Result<bool> {
        let result: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    // =========================================================================
    // MUTATION LOG
    // =========================================================================

    /// Append a secondary/audit record.
    ///
    /// Never fails the caller: a journal failure is logged and `None` returned.
    pub fn record_mutation(&self, entry: &MutationEntry) -> Option<i64> {
        let result = self.conn.execute(
            "INSERT INTO mutations
             (timestamp, category, item, original_value, new_value, success, error_message, session_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                now_string(),
                entry.category,
                entry.item,
                entry.original_value,
                entry.new_value,
                entry.success,
                entry.error,
                entry.session_id,
            ],
        );
        match result {
            Ok(_) => Some(self.conn.last_insert_rowid()),
            Err(err) => {
                warn!(
                    category = %entry.category,
                    item = %entry.item,
                    error = %err,
                    "failed to journal mutation record"
                );
                None
            }
        }
    }

    /// Durably record an intent and the originals it depends on, before the
    /// live write. Both land in one transaction or neither does.
    ///
    /// On failure the caller must not write the resource.
    pub fn begin_mutation(&mut self, intent: &MutationIntent, originals: &Settings) -> Result<()> {
        write_intent(&mut self.conn, intent, originals).map_err(|err| {
            error!(
                category = %intent.category,
                resource = %intent.resource,
                error = %err,
                "write-ahead journal entry failed; aborting resource write"
            );
            IdError::JournalUnavailable(format!("record intent for {}: {err}", intent.item))
        })
    }

    /// Resolve an intent into its mutation record.
    pub fn complete_mutation(
        &mut self,
        intent_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<MutationRecord> {
        let tx = self.conn.transaction()?;
        let intent = tx
            .query_row(
                "SELECT id, category, item, resource, original_value, new_value, session_id
                 FROM pending_mutations WHERE id = ?",
                [intent_id],
                intent_from_row,
            )
            .optional()?
            .ok_or_else(|| IdError::NotFound(format!("pending mutation {intent_id}")))?;

        let timestamp = now_string();
        tx.execute(
            "INSERT INTO mutations
             (timestamp, category, item, original_value, new_value, success, error_message, session_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                timestamp,
                intent.category,
                intent.item,
                intent.original_value,
                intent.new_value,
                success,
                error_message,
                intent.session_id,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE registry_changes SET success = ? WHERE intent_id = ?",
            params![success, intent_id],
        )?;
        tx.execute("DELETE FROM pending_mutations WHERE id = ?", [intent_id])?;
        tx.commit()?;

        Ok(MutationRecord {
            id,
            timestamp: parse_timestamp(&timestamp).unwrap_or_else(|_| Utc::now()),
            category: intent.category,
            item: intent.item,
            original_value: intent.original_value,
            new_value: intent.new_value,
            success,
            error: error_message.map(str::to_string),
            session_id: intent.session_id,
        })
    }

    /// Convert intents left by a crashed process into failed records.
    pub fn recover_interrupted(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let pending = {
            let mut stmt = tx.prepare(
                "SELECT id, created_at, category, item, original_value, new_value, session_id
                 FROM pending_mutations ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for (id, created_at, category, item, original, new, session_id) in &pending {
            tx.execute(
                "INSERT INTO mutations
                 (timestamp, category, item, original_value, new_value, success, error_message, session_id)
                 VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
                params![created_at, category, item, original, new, INTERRUPTED_ERROR, session_id],
            )?;
            tx.execute(
                "UPDATE registry_changes SET success = 0 WHERE intent_id = ?",
                [id],
            )?;
            tx.execute("DELETE FROM pending_mutations WHERE id = ?", [id])?;
            warn!(category = %category, item = %item, "recovered interrupted mutation");
        }
        tx.commit()?;
        Ok(pending.len())
    }

    pub fn pending_intents(&self) -> Result<Vec<MutationIntent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, category, item, resource, original_value, new_value, session_id
             FROM pending_mutations ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], intent_from_row)?;
        let mut intents = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        let mut writes = self.conn.prepare(
            "SELECT key_path, value_name, original_value, new_value
             FROM registry_changes WHERE intent_id = ? ORDER BY id",
        )?;
        for intent in &mut intents {
            let rows = writes.query_map([&intent.id], |row| {
                Ok(RegistryChange {
                    key_path: row.get(0)?,
                    value_name: row.get(1)?,
                    original_value: row.get(2)?,
                    new_value: row.get(3)?,
                })
            })?;
            intent.registry_writes = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        }
        Ok(intents)
    }

    /// Newest first.
    pub fn list_mutations(&self, limit: usize) -> Result<Vec<MutationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, category, item, original_value, new_value, success,
                    error_message, session_id
             FROM mutations ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn statistics(&self) -> Result<Statistics> {
        let mut stmt = self.conn.prepare(
            "SELECT category, COUNT(*), COALESCE(SUM(success), 0)
             FROM mutations GROUP BY category",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut stats = Statistics::default();
        for row in rows {
            let (category, total, succeeded) = row?;
            let total = u64::try_from(total).unwrap_or(0);
            let succeeded = u64::try_from(succeeded).unwrap_or(0);
            let entry = CategoryStats {
                total,
                succeeded,
                failed: total - succeeded.min(total),
            };
            stats.total += entry.total;
            stats.succeeded += entry.succeeded;
            stats.failed += entry.failed;
            stats.per_category.insert(category, entry);
        }
        Ok(stats)
    }

    /// Delete mutation rows and resolved registry audit rows older than
    /// `retention_days`. The only deletion path for either log.
    pub fn prune(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);
        let deleted = self
            .conn
            .execute("DELETE FROM mutations WHERE timestamp < ?", [&cutoff])?;
        let audit = self.conn.execute(
            "DELETE FROM registry_changes WHERE timestamp < ? AND success IS NOT NULL",
            [&cutoff],
        )?;
        if deleted > 0 || audit > 0 {
            info!(deleted, audit, retention_days, "pruned journal");
        }
        Ok(deleted)
    }

    // =========================================================================
    // REGISTRY AUDIT
    // =========================================================================

    /// Append a registry audit row for a write made outside an intent.
    ///
    /// Never fails the caller, like [`Self::record_mutation`].
    pub fn record_registry_change(
        &self,
        change: &RegistryChange,
        success: bool,
        session_id: Option<&str>,
    ) -> Option<i64> {
        match insert_registry_change(&self.conn, change, Some(success), session_id, None) {
            Ok(_) => Some(self.conn.last_insert_rowid()),
            Err(err) => {
                warn!(
                    key_path = %change.key_path,
                    value_name = %change.value_name,
                    error = %err,
                    "failed to journal registry change"
                );
                None
            }
        }
    }

    /// Newest first.
    pub fn list_registry_changes(&self, limit: usize) -> Result<Vec<RegistryChangeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, key_path, value_name, original_value, new_value, success,
                    session_id
             FROM registry_changes ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok(RegistryChangeRecord {
                id: row.get(0)?,
                timestamp: timestamp_column(row, 1)?,
                key_path: row.get(2)?,
                value_name: row.get(3)?,
                original_value: row.get(4)?,
                new_value: row.get(5)?,
                success: row.get(6)?,
                session_id: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    pub fn load_settings(&self) -> Result<Settings> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM app_settings")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut settings = Settings::new();
        for row in rows {
            let (key, raw) = row?;
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => settings.set_value(key, value),
                Err(err) => warn!(key = %key, error = %err, "skipping undecodable setting"),
            }
        }
        Ok(settings)
    }

    /// Upsert every entry of `settings`. Keys not present are left alone.
    pub fn save_settings(&mut self, settings: &Settings) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (key, value) in settings.iter() {
            upsert_setting(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_settings(&mut self, keys: &[&str]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM app_settings WHERE key = ?", [key])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Read one setting; absent, malformed, or unreadable values yield `default`.
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let raw = self
            .conn
            .query_row("SELECT value FROM app_settings WHERE key = ?", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional();
        match raw {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(key, error = %err, "malformed setting, using default");
                default
            }),
            Ok(None) => default,
            Err(err) => {
                warn!(key, error = %err, "could not read setting, using default");
                default
            }
        }
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    pub fn start_session(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO sessions (id, started_at) VALUES (?, ?)",
            params![id, now_string()],
        )?;
        debug!(session_id = %id, "session started");
        Ok(id)
    }

    pub fn end_session(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?, ended_cleanly = 1
             WHERE id = ? AND ended_at IS NULL",
            params![now_string(), id],
        )?;
        debug!(session_id = %id, "session ended");
        Ok(())
    }

    pub fn count_open_sessions(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Mark sessions left open by dead processes as ended uncleanly.
    pub fn close_stale_sessions(&self, except: Option<&str>) -> Result<usize> {
        let closed = self.conn.execute(
            "UPDATE sessions SET ended_at = ?, ended_cleanly = 0
             WHERE ended_at IS NULL AND id IS NOT ?",
            params![now_string(), except],
        )?;
        Ok(closed)
    }

    /// Insert `id` as an open session, reopening it if present.
    pub fn ensure_session(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, started_at) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET ended_at = NULL, ended_cleanly = NULL",
            params![id, format_timestamp(started_at)],
        )?;
        Ok(())
    }

    pub fn session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, started_at, ended_at, ended_cleanly FROM sessions WHERE id = ?",
                [id],
                |row| {
                    let ended_at: Option<String> = row.get(2)?;
                    Ok(Session {
                        id: row.get(0)?,
                        started_at: timestamp_column(row, 1)?,
                        ended_at: ended_at.as_deref().map(parse_timestamp).transpose().map_err(
                            |e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)),
                        )?,
                        ended_cleanly: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    // =========================================================================
    // BACKUP METADATA & SNAPSHOTS
    // =========================================================================

    pub fn record_backup(&self, record: &BackupRecord) -> Result<i64> {
        let row_counts = record
            .row_counts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO backup_metadata
             (created_at, file_path, size_bytes, included_tables, method, row_counts)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                format_timestamp(record.created_at),
                record.file_path.display().to_string(),
                i64::try_from(record.size_bytes).unwrap_or(i64::MAX),
                serde_json::to_string(&record.included_tables)?,
                record.method.as_str(),
                row_counts,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn last_backup(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list_backups(1)?.into_iter().next())
    }

    /// Newest first.
    pub fn list_backups(&self, limit: usize) -> Result<Vec<BackupRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT created_at, file_path, size_bytes, included_tables, method, row_counts
             FROM backup_metadata ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], backup_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn save_system_snapshot(&self, data: &Value) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO system_snapshots (captured_at, data) VALUES (?, ?)",
            params![now_string(), data.to_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn latest_system_snapshot(&self) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM system_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(IdError::from))
            .transpose()
    }

    /// Store one baseline of registry values. All rows share a capture time.
    pub fn save_registry_snapshot(
        &self,
        values: &[RegistryValue],
        session_id: Option<&str>,
    ) -> Result<usize> {
        let captured_at = now_string();
        let tx = self.conn.unchecked_transaction()?;
        for value in values {
            tx.execute(
                "INSERT INTO registry_snapshot
                 (captured_at, key_path, value_name, value, session_id)
                 VALUES (?, ?, ?, ?, ?)",
                params![captured_at, value.key_path, value.value_name, value.value, session_id],
            )?;
        }
        tx.commit()?;
        Ok(values.len())
    }

    /// Values of the most recent baseline, empty when none was taken.
    pub fn latest_registry_snapshot(&self) -> Result<Vec<RegistryValue>> {
        let mut stmt = self.conn.prepare(
            "SELECT key_path, value_name, value FROM registry_snapshot
             WHERE captured_at = (SELECT MAX(captured_at) FROM registry_snapshot)
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RegistryValue {
                key_path: row.get(0)?,
                value_name: row.get(1)?,
                value: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }
}

fn write_intent(
    conn: &mut Connection,
    intent: &MutationIntent,
    originals: &Settings,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for (key, value) in originals.iter() {
        upsert_setting(&tx, key, value)?;
    }
    tx.execute(
        "INSERT INTO pending_mutations
         (id, created_at, category, item, resource, original_value, new_value, session_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            intent.id,
            now_string(),
            intent.category,
            intent.item,
            intent.resource,
            intent.original_value,
            intent.new_value,
            intent.session_id,
        ],
    )?;
    for change in &intent.registry_writes {
        insert_registry_change(&tx, change, None, intent.session_id.as_deref(), Some(&intent.id))?;
    }
    tx.commit()
}

fn insert_registry_change(
    conn: &Connection,
    change: &RegistryChange,
    success: Option<bool>,
    session_id: Option<&str>,
    intent_id: Option<&str>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO registry_changes
         (timestamp, key_path, value_name, original_value, new_value, success, session_id, intent_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            now_string(),
            change.key_path,
            change.value_name,
            change.original_value,
            change.new_value,
            success,
            session_id,
            intent_id,
        ],
    )
}

fn upsert_setting(conn: &Connection, key: &str, value: &Value) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value.to_string(), now_string()],
    )
}

pub(crate) fn now_string() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MutationRecord> {
    Ok(MutationRecord {
        id: row.get(0)?,
        timestamp: timestamp_column(row, 1)?,
        category: row.get(2)?,
        item: row.get(3)?,
        original_value: row.get(4)?,
        new_value: row.get(5)?,
        success: row.get(6)?,
        error: row.get(7)?,
        session_id: row.get(8)?,
    })
}

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<MutationIntent> {
    Ok(MutationIntent {
        id: row.get(0)?,
        category: row.get(1)?,
        item: row.get(2)?,
        resource: row.get(3)?,
        original_value: row.get(4)?,
        new_value: row.get(5)?,
        session_id: row.get(6)?,
        registry_writes: Vec::new(),
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    let tables_raw: String = row.get(3)?;
    let method_raw: String = row.get(4)?;
    let counts_raw: Option<String> = row.get(5)?;
    let size: i64 = row.get(2)?;
    let file_path: String = row.get(1)?;

    Ok(BackupRecord {
        created_at: timestamp_column(row, 0)?,
        file_path: PathBuf::from(file_path),
        size_bytes: u64::try_from(size).unwrap_or(0),
        included_tables: serde_json::from_str(&tables_raw).map_err(|e| json_err(3, e))?,
        method: BackupMethod::parse(&method_raw),
        row_counts: counts_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| json_err(5, e))?,
    })
}
