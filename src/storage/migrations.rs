//! Journal schema migrations

use rusqlite::Connection;

use crate::error::{IdError, Result};

const MIGRATIONS: [&str; 4] = [
    include_str!("../../migrations/001_initial_schema.sql"),
    include_str!("../../migrations/002_write_ahead_intents.sql"),
    include_str!("../../migrations/003_system_snapshots.sql"),
    include_str!("../../migrations/004_registry_audit.sql"),
];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`SCHEMA_VERSION`].
///
/// Idempotent: migrations already covered by `user_version` are skipped, so
/// a restored backup at an older version is upgraded in place.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    apply_migrations(conn, &MIGRATIONS)
}

/// Each migration and its `user_version` bump commit together, so a failed
/// batch leaves the schema at the previous version.
fn apply_migrations(conn: &Connection, migrations: &[&str]) -> Result<u32> {
    let current_version = user_version(conn)?;

    for (idx, sql) in migrations.iter().enumerate() {
        let target_version = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        if current_version >= target_version {
            continue;
        }

        let tx = conn.unchecked_transaction().map_err(|err| {
            IdError::JournalUnavailable(format!("migration {target_version} failed: {err}"))
        })?;
        tx.execute_batch(sql).map_err(|err| {
            IdError::JournalUnavailable(format!("migration {target_version} failed: {err}"))
        })?;
        tx.pragma_update(None, "user_version", target_version)
            .map_err(|err| {
                IdError::JournalUnavailable(format!(
                    "failed to set user_version {target_version}: {err}"
                ))
            })?;
        tx.commit().map_err(|err| {
            IdError::JournalUnavailable(format!("migration {target_version} failed: {err}"))
        })?;
    }

    Ok(u32::try_from(migrations.len()).unwrap_or(u32::MAX))
}

pub fn user_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|err| IdError::JournalUnavailable(err.to_string()))
}

/// Apply only the first `version` migrations. Used to fabricate older journals.
#[cfg(test)]
pub(crate) fn run_migrations_to(conn: &Connection, version: u32) -> Result<()> {
    for (idx, sql) in MIGRATIONS.iter().enumerate().take(version as usize) {
        conn.execute_batch(sql)?;
        conn.pragma_update(None, "user_version", (idx + 1) as u32)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn schema_version_matches_migrations_count() {
        assert_eq!(SCHEMA_VERSION, MIGRATIONS.len() as u32);
    }

    #[test]
    fn migrations_are_not_empty() {
        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            assert!(!sql.trim().is_empty(), "Migration {} is empty", idx + 1);
        }
    }

    #[test]
    fn run_migrations_on_empty_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(user_version(&conn).unwrap(), 0);

        let result = run_migrations(&conn).unwrap();
        assert_eq!(result, SCHEMA_VERSION);
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);
        for table in [
            "mutations",
            "pending_mutations",
            "app_settings",
            "sessions",
            "backup_metadata",
            "system_snapshots",
            "registry_changes",
            "registry_snapshot",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn run_migrations_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        for _ in 0..3 {
            assert_eq!(run_migrations(&conn).unwrap(), SCHEMA_VERSION);
        }
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn run_migrations_upgrades_older_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations_to(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO sessions (id, started_at) VALUES ('s1', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        assert!(!table_exists(&conn, "pending_mutations"));

        run_migrations(&conn).unwrap();

        assert!(table_exists(&conn, "pending_mutations"));
        let cleanly: Option<i64> = conn
            .query_row("SELECT ended_cleanly FROM sessions WHERE id = 's1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(cleanly, None);
    }

    #[test]
    fn failed_migration_rolls_back_with_its_version() {
        let conn = Connection::open_in_memory().unwrap();
        let migrations = [
            "CREATE TABLE first (id INTEGER PRIMARY KEY);",
            "CREATE TABLE second (id INTEGER PRIMARY KEY); INSERT INTO missing VALUES (1);",
        ];

        let err = apply_migrations(&conn, &migrations).unwrap_err();

        assert!(matches!(err, IdError::JournalUnavailable(_)));
        assert_eq!(user_version(&conn).unwrap(), 1);
        assert!(table_exists(&conn, "first"));
        assert!(!table_exists(&conn, "second"));
    }
}
