pub mod schema;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::RowPulseError;
use schema::{Migration, CREATE_SCHEMA_SQL, CURRENT_SCHEMA_VERSION, MIGRATIONS};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// A pooled handle to one SQLite database file.
///
/// The same type is used for the metadata store (opened with
/// [`Database::open_metadata`], which applies migrations) and for the
/// watched target databases (opened with [`Database::open`]).
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open a pool on an existing or new SQLite file without touching its
    /// schema or journal mode.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self, RowPulseError> {
        Self::open_pool(path, pool_size, false)
    }

    fn open_pool(path: &Path, pool_size: u32, wal: bool) -> Result<Self, RowPulseError> {
        let manager = SqliteConnectionManager::file(path).with_init(move |c| {
            c.busy_timeout(BUSY_TIMEOUT)?;
            if wal {
                c.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            c.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        debug!("Opened database pool for {}", path.display());

        Ok(Database {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Open the metadata store and bring its schema up to date.
    pub fn open_metadata(path: &Path, pool_size: u32) -> Result<Self, RowPulseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self::open_pool(path, pool_size, true)?;
        let conn = db.get_connection()?;
        ensure_schema(&conn)?;
        info!("Metadata store ready at {}", path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<PooledConn, RowPulseError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back on error.
    ///
    /// Taking the write lock up front means two callers doing a
    /// read-modify-write can never interleave: the second blocks (up to the
    /// busy timeout) until the first commits.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, RowPulseError>
    where
        F: FnOnce(&Connection) -> Result<T, RowPulseError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback failed after error '{}': {}", e, rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Run blocking connection work on the tokio blocking pool.
    pub async fn interact<T, F>(&self, f: F) -> Result<T, RowPulseError>
    where
        F: FnOnce(&Connection) -> Result<T, RowPulseError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| RowPulseError::Error(format!("Database task failed: {}", e)))?
    }

    /// Like [`Database::interact`], wrapped in an immediate transaction.
    pub async fn write<T, F>(&self, f: F) -> Result<T, RowPulseError>
    where
        F: FnOnce(&Connection) -> Result<T, RowPulseError> + Send + 'static,
        T: Send + 'static,
    {
        self.interact(move |conn| Database::immediate_transaction(conn, f))
            .await
    }

    pub fn get_meta_value_locked(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<String>, RowPulseError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(value)
    }

    pub fn set_meta_value_locked(
        conn: &Connection,
        key: &str,
        value: &str,
    ) -> Result<(), RowPulseError> {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }
}

/// Quote a table or column name for interpolation into SQL.
///
/// Names are never accepted from free text without first being checked
/// against the target schema (see [`table_columns`]); this only guarantees
/// the quoted form cannot break out of the identifier.
pub fn quote_identifier(name: &str) -> Result<String, RowPulseError> {
    if name.trim().is_empty() {
        return Err(RowPulseError::Validation(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if name.contains('\0') {
        return Err(RowPulseError::Validation(format!(
            "Identifier contains a NUL byte: {:?}",
            name
        )));
    }

    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, RowPulseError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Column names of `table_name`, in declaration order. Empty when the table
/// does not exist.
pub fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>, RowPulseError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?) ORDER BY cid")?;
    let columns = stmt
        .query_map([table_name], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Fail with a validation error unless `table_name` exists and has every
/// column in `columns`.
pub fn validate_table_columns<S: AsRef<str>>(
    conn: &Connection,
    table_name: &str,
    columns: &[S],
) -> Result<(), RowPulseError> {
    let known = table_columns(conn, table_name)?;
    if known.is_empty() {
        return Err(RowPulseError::NotFound(format!(
            "Table '{}' not found",
            table_name
        )));
    }

    for column in columns {
        let column = column.as_ref();
        if !known.iter().any(|k| k == column) {
            return Err(RowPulseError::Validation(format!(
                "Column '{}' not found in table '{}'",
                column, table_name
            )));
        }
    }

    Ok(())
}

fn ensure_schema(conn: &Connection) -> Result<(), RowPulseError> {
    let meta_exists = table_exists(conn, "meta")?;

    if !meta_exists {
        info!("Creating metadata schema (version {})", CURRENT_SCHEMA_VERSION);
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        return Ok(());
    }

    loop {
        let version = current_version(conn)?;

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        if version > CURRENT_SCHEMA_VERSION {
            return Err(RowPulseError::Error(format!(
                "Metadata schema version {} is newer than this build supports ({})",
                version, CURRENT_SCHEMA_VERSION
            )));
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.from_version == version)
            .ok_or_else(|| {
                RowPulseError::Error(format!("No migration from schema version {}", version))
            })?;

        apply_migration(conn, migration)?;
    }
}

fn current_version(conn: &Connection) -> Result<u32, RowPulseError> {
    let stored = Database::get_meta_value_locked(conn, "schema_version")?
        .ok_or_else(|| RowPulseError::Error("Schema version missing".to_string()))?;

    stored
        .parse::<u32>()
        .map_err(|_| RowPulseError::Error(format!("Invalid schema version '{}'", stored)))
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<(), RowPulseError> {
    info!(
        "Upgrading metadata schema {} → {}",
        migration.from_version,
        migration.from_version + 1
    );

    Database::immediate_transaction(conn, |c| {
        c.execute_batch(migration.sql)?;
        Database::set_meta_value_locked(
            c,
            "schema_version",
            &(migration.from_version + 1).to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_metadata_creates_current_schema() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_metadata(&dir.path().join("meta.db"), 2).unwrap();
        let conn = db.get_connection().unwrap();

        assert_eq!(current_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(table_exists(&conn, "alerts").unwrap());
        assert!(table_exists(&conn, "alert_subscriptions").unwrap());
        assert!(table_exists(&conn, "alert_logs").unwrap());
    }

    #[test]
    fn test_open_metadata_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        Database::open_metadata(&path, 1).unwrap();
        let db = Database::open_metadata(&path, 1).unwrap();
        let conn = db.get_connection().unwrap();
        assert_eq!(current_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_from_version_1() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(schema::V1_SCHEMA_SQL).unwrap();
            conn.execute(
                "INSERT INTO alerts (alert_id, alert_creator_id, alert_created_at, database_name,
                    table_name, id_columns, timestamp_column, frequency, next_deadline)
                 VALUES ('a1', 'me', '2024-01-01 00:00:00', 'db', 't', '[\"id\"]', 'ts',
                    '+1 minute', '2024-01-01 00:01:00')",
                [],
            )
            .unwrap();
        }

        let db = Database::open_metadata(&path, 1).unwrap();
        let conn = db.get_connection().unwrap();
        assert_eq!(current_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        let kind: String = conn
            .query_row("SELECT alert_kind FROM alerts WHERE alert_id = 'a1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(kind, "cursor");
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_metadata(&dir.path().join("meta.db"), 1).unwrap();
        let conn = db.get_connection().unwrap();

        let result: Result<(), RowPulseError> = Database::immediate_transaction(&conn, |c| {
            Database::set_meta_value_locked(c, "marker", "1")?;
            Err(RowPulseError::Error("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(Database::get_meta_value_locked(&conn, "marker").unwrap(), None);
    }

    #[test]
    fn test_journal_mode_only_changed_for_metadata_store() {
        let dir = TempDir::new().unwrap();
        let journal_mode = |db: &Database| -> String {
            db.get_connection()
                .unwrap()
                .query_row("PRAGMA journal_mode", [], |r| r.get(0))
                .unwrap()
        };

        let target = Database::open(&dir.path().join("target.db"), 1).unwrap();
        assert_eq!(journal_mode(&target), "delete");

        let meta = Database::open_metadata(&dir.path().join("meta.db"), 1).unwrap();
        assert_eq!(journal_mode(&meta), "wal");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("name").unwrap(), "\"name\"");
        assert_eq!(quote_identifier("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_identifier("  ").is_err());
        assert!(quote_identifier("a\0b").is_err());
    }

    #[test]
    fn test_validate_table_columns() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("target.db"), 1).unwrap();
        let conn = db.get_connection().unwrap();
        conn.execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY, ts TEXT)")
            .unwrap();

        assert!(validate_table_columns(&conn, "events", &["id", "ts"]).is_ok());
        assert!(matches!(
            validate_table_columns(&conn, "events", &["nope"]),
            Err(RowPulseError::Validation(_))
        ));
        assert!(matches!(
            validate_table_columns(&conn, "missing", &["id"]),
            Err(RowPulseError::NotFound(_))
        ));
    }
}
