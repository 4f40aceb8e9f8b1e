//! `SQLite` plumbing shared by ccfleet storage layers.
//!
//! Pools always run with foreign keys on, so referential mistakes surface as
//! [`DatabaseError::Constraint`] and duplicate keys as
//! [`DatabaseError::Conflict`] instead of generic query failures.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Connections in a file-backed pool.
const FILE_POOL_CONNECTIONS: u32 = 5;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot prepare database directory: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A row with the same key already exists.
    #[error("Already exists: {0}")]
    Conflict(String),

    /// A foreign-key, check or not-null constraint rejected the write.
    #[error("Constraint violated: {0}")]
    Constraint(String),
}

impl DatabaseError {
    /// Replace the driver's message of a [`Conflict`](Self::Conflict) with
    /// one naming the row.
    #[must_use]
    pub fn on_conflict(self, message: impl FnOnce() -> String) -> Self {
        match self {
            Self::Conflict(_) => Self::Conflict(message()),
            other => other,
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        if matches!(e, sqlx::Error::RowNotFound) {
            return Self::NotFound(e.to_string());
        }
        let kind = e.as_database_error().map(|db| (db.kind(), db.message().to_string()));
        match kind {
            Some((ErrorKind::UniqueViolation, message)) => Self::Conflict(message),
            Some((
                ErrorKind::ForeignKeyViolation
                | ErrorKind::CheckViolation
                | ErrorKind::NotNullViolation,
                message,
            )) => Self::Constraint(message),
            _ => Self::Query(e.to_string()),
        }
    }
}

fn base_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Open (or create) the database file at `path`, creating its directory.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DatabaseError::Io(format!("{}: {e}", parent.display())))?;
    }

    let options = base_options(
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true),
    );
    let pool = SqlitePoolOptions::new()
        .max_connections(FILE_POOL_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(path = %path.display(), "Database opened");
    Ok(pool)
}

/// In-memory pool for tests. Every connection would get its own empty
/// database, so the pool holds exactly one.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = base_options(SqliteConnectOptions::new().in_memory(true));
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Seconds since the Unix epoch; the unit of every stored timestamp.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Declare a storage handle over a migrated `SQLite` pool.
///
/// The invoking crate's `migrations/` directory is embedded and applied on
/// every open.
///
/// ```ignore
/// ccfleet_core::define_database!(Database);
/// ```
#[macro_export]
macro_rules! define_database {
    ($name:ident) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::migrated($crate::db::open_pool(path).await?).await
            }

            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::migrated($crate::db::open_pool_in_memory().await?).await
            }

            async fn migrated(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;
                ::tracing::debug!(store = stringify!($name), "Migrations applied");
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn scratch() -> Pool<Sqlite> {
        let pool = open_pool_in_memory().await.unwrap();
        for sql in [
            "CREATE TABLE parent (id TEXT PRIMARY KEY)",
            "CREATE TABLE child (id TEXT PRIMARY KEY, \
             parent_id TEXT NOT NULL REFERENCES parent(id), \
             size INTEGER CHECK (size > 0))",
            "INSERT INTO parent (id) VALUES ('p')",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        pool
    }

    #[test]
    fn unix_timestamp_is_reasonable() {
        // After 2024-01-01.
        assert!(unix_timestamp() > 1_704_067_200);
    }

    #[tokio::test]
    async fn duplicate_key_is_conflict() {
        let pool = scratch().await;
        let err: DatabaseError = sqlx::query("INSERT INTO parent (id) VALUES ('p')")
            .execute(&pool)
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, DatabaseError::Conflict(_)), "{err}");

        let named = err.on_conflict(|| "Parent p".into());
        assert_eq!(named.to_string(), "Already exists: Parent p");
    }

    #[tokio::test]
    async fn broken_reference_and_check_are_constraint_errors() {
        let pool = scratch().await;
        for sql in [
            "INSERT INTO child (id, parent_id) VALUES ('c1', 'ghost')",
            "INSERT INTO child (id, parent_id, size) VALUES ('c2', 'p', 0)",
        ] {
            let err: DatabaseError = sqlx::query(sql).execute(&pool).await.unwrap_err().into();
            assert!(matches!(err, DatabaseError::Constraint(_)), "{sql}: {err}");
        }
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let pool = scratch().await;
        let err: DatabaseError = sqlx::query_as::<_, (String,)>("SELECT id FROM parent WHERE id = 'x'")
            .fetch_one(&pool)
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_pool_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let pool = open_pool(&path).await.unwrap();
        let row: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, "wal");
        assert!(path.exists());
    }
}
