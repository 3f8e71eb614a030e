//! Consistent snapshots of the journal and restore from them.
//!
//! Snapshots are taken on a dedicated connection inside a read transaction,
//! so ordinary writers keep going while pages are copied in bounded chunks.
//! When the page copy is blocked the journal is exported logically instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::backup::{Backup, StepResult};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IdError, Result};
use crate::storage::journal::MutationJournal;
use crate::storage::migrations;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMethod {
    /// SQLite online-backup page copy.
    PageCopy,
    /// Schema and rows replayed into a fresh file.
    LogicalExport,
}

impl BackupMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PageCopy => "page_copy",
            Self::LogicalExport => "logical_export",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "logical_export" => Self::LogicalExport,
            _ => Self::PageCopy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub created_at: DateTime<Utc>,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub included_tables: Vec<String>,
    /// Present only for verified backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_counts: Option<BTreeMap<String, i64>>,
    pub method: BackupMethod,
}

impl MutationJournal {
    /// Snapshot the journal into `dir`.
    ///
    /// `on_progress` receives percentages in `0..=100`. With `verify`, the
    /// written file is integrity-checked and its per-table row counts are
    /// recorded. Metadata is written to the live journal afterwards; failing
    /// to record it is logged, not returned.
    pub fn create_backup(
        &self,
        dir: &Path,
        verify: bool,
        chunk_pages: i32,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<BackupRecord> {
        fs::create_dir_all(dir)?;
        let created_at = Utc::now();
        let file_path = dir.join(format!(
            "journal_backup_{}.bak",
            created_at.format("%Y%m%d_%H%M%S_%6f")
        ));

        on_progress(0);
        let method = match self.page_copy(&file_path, chunk_pages.max(1), on_progress) {
            Ok(()) => BackupMethod::PageCopy,
            Err(IdError::BackupContention(reason)) => {
                warn!(reason = %reason, "page copy blocked, falling back to logical export");
                remove_if_exists(&file_path)?;
                self.logical_export(&file_path)?;
                BackupMethod::LogicalExport
            }
            Err(err) => {
                remove_if_exists(&file_path)?;
                return Err(err);
            }
        };

        let inspection = inspect_backup(&file_path, verify)?;
        let record = BackupRecord {
            created_at,
            size_bytes: fs::metadata(&file_path)?.len(),
            file_path,
            included_tables: inspection.tables,
            row_counts: inspection.row_counts,
            method,
        };

        if let Err(err) = self.record_backup(&record) {
            warn!(path = %record.file_path.display(), error = %err, "failed to record backup metadata");
        }
        on_progress(100);
        info!(
            path = %record.file_path.display(),
            method = record.method.as_str(),
            size_bytes = record.size_bytes,
            "backup created"
        );
        Ok(record)
    }

    fn page_copy(
        &self,
        dest: &Path,
        chunk_pages: i32,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let src = self.snapshot_connection()?;
        let mut dst = Connection::open(dest)?;
        {
            let backup = Backup::new(&src, &mut dst)?;
            loop {
                match backup.step(chunk_pages).map_err(contention_or)? {
                    StepResult::Done => break,
                    StepResult::More => {
                        let progress = backup.progress();
                        on_progress(percent(progress.pagecount, progress.remaining));
                    }
                    other => {
                        return Err(IdError::BackupContention(format!(
                            "backup step returned {other:?}"
                        )));
                    }
                }
            }
        }
        if let Err(err) = src.execute_batch("COMMIT") {
            debug!(error = %err, "closing snapshot transaction");
        }
        // A backup should be a single self-contained file.
        dst.pragma_update(None, "journal_mode", "DELETE")?;
        Ok(())
    }

    /// Recreate schema and rows of the journal in a fresh database at `dest`.
    pub(crate) fn logical_export(&self, dest: &Path) -> Result<()> {
        let src = self.snapshot_connection()?;
        let version = migrations::user_version(&src)?;

        let objects: Vec<(String, String, String)> = {
            let mut stmt = src.prepare(
                "SELECT type, name, sql FROM sqlite_master
                 WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
                 ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut dst = Connection::open(dest)?;
        let tx = dst.transaction()?;
        for (_, _, sql) in objects.iter().filter(|(kind, _, _)| kind == "table") {
            tx.execute_batch(sql)?;
        }
        for (_, name, _) in objects.iter().filter(|(kind, _, _)| kind == "table") {
            let table = quote_ident(name);
            let mut select = src.prepare(&format!("SELECT * FROM {table}"))?;
            let columns = select.column_count();
            let placeholders = vec!["?"; columns].join(", ");
            let mut insert = tx.prepare(&format!("INSERT INTO {table} VALUES ({placeholders})"))?;

            let mut rows = select.query([])?;
            while let Some(row) = rows.next()? {
                let values = (0..columns)
                    .map(|idx| row.get::<_, SqlValue>(idx))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                insert.execute(params_from_iter(values))?;
            }
        }
        for (_, _, sql) in objects.iter().filter(|(kind, _, _)| kind != "table") {
            tx.execute_batch(sql)?;
        }
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;

        if let Err(err) = src.execute_batch("COMMIT") {
            debug!(error = %err, "closing snapshot transaction");
        }
        Ok(())
    }

    /// A dedicated connection holding an open read transaction.
    fn snapshot_connection(&self) -> Result<Connection> {
        let src = Connection::open(self.path()).map_err(contention_or)?;
        src.busy_timeout(self.busy_timeout)?;
        src.execute_batch("PRAGMA query_only = ON; BEGIN;")
            .map_err(contention_or)?;
        // The first read pins the snapshot.
        src.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(contention_or)?;
        Ok(src)
    }

    /// Replace the live journal with `backup` and migrate it.
    ///
    /// The candidate is validated before the live handle is closed, so a
    /// corrupt or foreign file leaves the journal untouched.
    pub fn restore_backup(&mut self, backup: &Path) -> Result<()> {
        if !backup.exists() {
            return Err(IdError::NotFound(format!("backup {}", backup.display())));
        }
        validate_candidate(backup)?;

        let live = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        if let Err((_, err)) = live.close() {
            warn!(error = %err, "closing live journal before restore");
        }

        let path = self.path().to_path_buf();
        let copied = remove_sidecars(&path).and_then(|()| fs::copy(backup, &path).map_err(IdError::from));
        // Reopen even when the copy failed, so the handle is never left detached.
        self.reopen()?;
        copied?;

        info!(backup = %backup.display(), schema_version = self.schema_version(), "journal restored");
        Ok(())
    }
}

struct Inspection {
    tables: Vec<String>,
    row_counts: Option<BTreeMap<String, i64>>,
}

fn inspect_backup(path: &Path, verify: bool) -> Result<Inspection> {
    let conn = Connection::open(path)?;
    if verify {
        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(IdError::ValidationFailed(format!(
                "backup {} failed quick_check: {check}",
                path.display()
            )));
        }
    }

    let tables = table_names(&conn)?;
    let row_counts = if verify {
        let mut counts = BTreeMap::new();
        for table in &tables {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )?;
            counts.insert(table.clone(), count);
        }
        Some(counts)
    } else {
        None
    };

    Ok(Inspection { tables, row_counts })
}

fn validate_candidate(path: &Path) -> Result<()> {
    let invalid = |detail: String| IdError::ValidationFailed(format!("{}: {detail}", path.display()));
    let conn = Connection::open(path).map_err(|err| invalid(err.to_string()))?;
    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|err| invalid(err.to_string()))?;
    if check != "ok" {
        return Err(invalid(format!("quick_check reported {check}")));
    }
    let tables = table_names(&conn).map_err(|err| invalid(err.to_string()))?;
    if !tables.iter().any(|t| t == "mutations") {
        return Err(invalid("not an idswap journal".to_string()));
    }
    Ok(())
}

fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn contention_or(err: rusqlite::Error) -> IdError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
            IdError::BackupContention(err.to_string())
        }
        _ => IdError::Database(err),
    }
}

fn percent(pagecount: i32, remaining: i32) -> u8 {
    if pagecount <= 0 {
        return 0;
    }
    let done = i64::from(pagecount - remaining.clamp(0, pagecount));
    u8::try_from((done * 100 / i64::from(pagecount)).min(99)).unwrap_or(99)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn remove_sidecars(path: &Path) -> Result<()> {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        remove_if_exists(Path::new(&sidecar))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::journal::{MutationEntry, Settings};
    use tempfile::{tempdir, TempDir};

    fn journal_with_rows(rows: usize) -> (TempDir, MutationJournal) {
        let dir = tempdir().unwrap();
        let mut journal =
            MutationJournal::open(dir.path().join("journal.db"), Duration::from_millis(500)).unwrap();
        for idx in 0..rows {
            journal.record_mutation(&MutationEntry::new(
                "adapter_address",
                "mac_address",
                Some(format!("AA:BB:CC:00:00:{idx:02X}")),
                Some(format!("02:00:00:00:00:{idx:02X}")),
            ));
        }
        let mut settings = Settings::new();
        settings.set("spoof_mode", &"ephemeral").unwrap();
        journal.save_settings(&settings).unwrap();
        (dir, journal)
    }

    #[test]
    fn test_verified_backup_reports_row_counts() {
        let (dir, journal) = journal_with_rows(5);
        let mut seen = Vec::new();
        let record = journal
            .create_backup(&dir.path().join("backups"), true, 1, &mut |p| seen.push(p))
            .unwrap();

        assert!(record.file_path.exists());
        assert_eq!(record.method, BackupMethod::PageCopy);
        assert!(record.size_bytes > 0);
        assert!(record.included_tables.contains(&"mutations".to_string()));
        assert_eq!(record.row_counts.as_ref().unwrap()["mutations"], 5);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        let last = journal.last_backup().unwrap().unwrap();
        assert_eq!(last.file_path, record.file_path);
        assert_eq!(last.row_counts, record.row_counts);
    }

    #[test]
    fn test_unverified_backup_has_no_row_counts() {
        let (dir, journal) = journal_with_rows(2);
        let record = journal
            .create_backup(&dir.path().join("backups"), false, 1000, &mut |_| {})
            .unwrap();
        assert!(record.row_counts.is_none());
        assert!(!record.included_tables.is_empty());
    }

    #[test]
    fn test_logical_export_reproduces_rows_and_version() {
        let (dir, journal) = journal_with_rows(3);
        let dest = dir.path().join("export.bak");
        journal.logical_export(&dest).unwrap();

        let exported = Connection::open(&dest).unwrap();
        assert_eq!(
            migrations::user_version(&exported).unwrap(),
            migrations::SCHEMA_VERSION
        );
        let count: i64 = exported
            .query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
        let index_count: i64 = exported
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_mutations_timestamp'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index_count, 1);
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let (dir, mut journal) = journal_with_rows(4);
        let record = journal
            .create_backup(&dir.path().join("backups"), true, 2, &mut |_| {})
            .unwrap();
        let before_rows = journal.list_mutations(100).unwrap();
        let before_settings = journal.load_settings().unwrap();

        journal.record_mutation(&MutationEntry::new("machine_id", "machine_guid", None, None));
        let mut later = Settings::new();
        later.set("spoof_mode", &"permanent").unwrap();
        journal.save_settings(&later).unwrap();

        journal.restore_backup(&record.file_path).unwrap();

        assert_eq!(journal.list_mutations(100).unwrap(), before_rows);
        assert_eq!(journal.load_settings().unwrap(), before_settings);
        assert!(journal.integrity_check().unwrap());
    }

    #[test]
    fn test_restore_rejects_corrupt_file_and_keeps_journal() {
        let (dir, mut journal) = journal_with_rows(2);
        let bogus = dir.path().join("bogus.bak");
        fs::write(&bogus, b"definitely not sqlite").unwrap();

        let err = journal.restore_backup(&bogus).unwrap_err();
        assert!(matches!(err, IdError::ValidationFailed(_)));
        assert_eq!(journal.list_mutations(10).unwrap().len(), 2);
    }

    #[test]
    fn test_restore_missing_file_is_not_found() {
        let (dir, mut journal) = journal_with_rows(0);
        let err = journal
            .restore_backup(&dir.path().join("nope.bak"))
            .unwrap_err();
        assert!(matches!(err, IdError::NotFound(_)));
    }

    #[test]
    fn test_restore_migrates_older_backup() {
        let (dir, mut journal) = journal_with_rows(0);
        let old = dir.path().join("old.bak");
        {
            let conn = Connection::open(&old).unwrap();
            migrations::run_migrations_to(&conn, 1).unwrap();
            conn.execute(
                "INSERT INTO mutations (timestamp, category, item, success)
                 VALUES ('2026-01-01T00:00:00.000000Z', 'machine_id', 'machine_guid', 1)",
                [],
            )
            .unwrap();
        }

        journal.restore_backup(&old).unwrap();

        assert_eq!(journal.schema_version(), migrations::SCHEMA_VERSION);
        assert_eq!(journal.list_mutations(10).unwrap().len(), 1);
        assert!(journal.pending_intents().unwrap().is_empty());
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(10, 10), 0);
        assert_eq!(percent(10, 5), 50);
        assert_eq!(percent(10, 0), 99);
    }

    #[test]
    fn test_backup_method_strings() {
        assert_eq!(BackupMethod::parse(BackupMethod::LogicalExport.as_str()), BackupMethod::LogicalExport);
        assert_eq!(BackupMethod::parse("page_copy"), BackupMethod::PageCopy);
    }
}
