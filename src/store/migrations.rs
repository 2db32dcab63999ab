//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "sequences",
        sql: r#"
            CREATE TABLE IF NOT EXISTS prospects (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                my_email TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_prospects_email ON prospects(email);
            CREATE INDEX IF NOT EXISTS idx_prospects_my_email ON prospects(my_email);

            CREATE TABLE IF NOT EXISTS sequence_steps (
                prospect_id TEXT NOT NULL REFERENCES prospects(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                step_key TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                day TEXT,
                hour TEXT,
                sent INTEGER NOT NULL DEFAULT 0,
                message_id TEXT,
                sent_at TEXT,
                opened INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (prospect_id, ordinal)
            );
            CREATE INDEX IF NOT EXISTS idx_sequence_steps_due ON sequence_steps(sent, day, hour);
        "#,
    },
    Migration {
        version: 2,
        name: "status_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS status_log (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                email TEXT,
                step_key TEXT,
                error TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_status_log_timestamp ON status_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_status_log_kind ON status_log(kind);
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
