//! Run-log database: one row per container run.

use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{FromRow, SqlitePool};

use crate::stats::StatsSnapshot;

#[derive(Clone, Debug)]
pub struct Database(SqlitePool);

impl Database {
    /// Connect to a sqlite database (`sqlite:<path>` or
    /// `sqlite::memory:`), creating the file and the schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseSetupError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(DatabaseSetupError::Unavailable)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(DatabaseSetupError::Unavailable)?;
        migrate(&pool)
            .await
            .map_err(DatabaseSetupError::MigrationFailed)?;
        Ok(Self(pool))
    }
}

impl Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            stdout TEXT NOT NULL,
            stderr TEXT NOT NULL,
            exit_code INTEGER NOT NULL,
            memory_cache_hits INTEGER NOT NULL,
            disk_cache_hits INTEGER NOT NULL,
            server_fetches INTEGER NOT NULL,
            username TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// A completed run, ready to be logged.
#[derive(Debug)]
pub struct NewRun<'a> {
    pub filename: &'a str,
    /// Wall-clock start, milliseconds since the epoch.
    pub started_at: i64,
    pub duration_ms: i64,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exit_code: i32,
    pub stats: StatsSnapshot,
    pub username: &'a str,
}

/// A logged run, as served by `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub filename: String,
    pub started_at: i64,
    pub duration_ms: i64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub memory_cache_hits: i64,
    pub disk_cache_hits: i64,
    pub server_fetches: i64,
    pub username: String,
}

impl Database {
    /// Insert a run row and return its id.
    pub async fn log_run(&self, run: NewRun<'_>) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (
                filename, started_at, duration_ms, stdout, stderr, exit_code,
                memory_cache_hits, disk_cache_hits, server_fetches, username
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(run.filename)
        .bind(run.started_at)
        .bind(run.duration_ms)
        .bind(run.stdout)
        .bind(run.stderr)
        .bind(run.exit_code)
        .bind(run.stats.memory_cache_hits)
        .bind(run.stats.disk_cache_hits)
        .bind(run.stats.server_fetches)
        .bind(run.username)
        .execute(&self.0)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Full run history, newest first.
    pub async fn all_runs(&self) -> Result<Vec<RunRecord>, sqlx::Error> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, filename, started_at, duration_ms, stdout, stderr, exit_code,
                   memory_cache_hits, disk_cache_hits, server_fetches, username
            FROM runs
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.0)
        .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("error occurred while attempting database migration: {0}")]
    MigrationFailed(sqlx::Error),

    #[error("unable to perform initial connection to the database: {0}")]
    Unavailable(sqlx::Error),
}
