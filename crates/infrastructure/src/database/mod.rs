pub mod sqlite;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::debug;

use pipeline_domain::PipelineResult;

pub type DbPool = Pool<Sqlite>;

/// Owns the SQLite connection pool and the embedded schema.
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Opens (creating if necessary) the task graph database and brings
    /// the schema up to date.
    pub async fn open(database_url: &str, max_connections: u32) -> PipelineResult<Self> {
        debug!(database_url, "opening task graph database");

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> PipelineResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection keeps every query on the same in-memory
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> PipelineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> PipelineResult<()> {
        debug!("running task graph schema migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER REFERENCES tasks(id),
                task_type TEXT NOT NULL,
                name TEXT,
                job_name TEXT,
                working_directory TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduling_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                queued_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                started_at DATETIME,
                ended_at DATETIME,
                latest_heartbeat DATETIME,
                host TEXT,
                error_fail INTEGER NOT NULL DEFAULT 0,
                error_text TEXT,
                all_products_passed_qc INTEGER,
                qc_complete INTEGER NOT NULL DEFAULT 0,
                run_time_wall_clock REAL,
                run_time_cpu REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generator_task INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                directory TEXT NOT NULL,
                filename TEXT NOT NULL,
                semantic_type TEXT NOT NULL,
                mime_type TEXT,
                planned_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (generator_task, directory, filename)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS product_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
                attempt_id INTEGER NOT NULL REFERENCES scheduling_attempts(id) ON DELETE CASCADE,
                repository_id TEXT NOT NULL,
                checksum TEXT,
                size_bytes INTEGER,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                passed_qc INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_inputs (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
                semantic_type TEXT NOT NULL,
                PRIMARY KEY (task_id, product_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_metadata (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                keyword TEXT NOT NULL,
                value_float REAL,
                value_str TEXT,
                recorded_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (task_id, keyword)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempt_metadata (
                attempt_id INTEGER NOT NULL REFERENCES scheduling_attempts(id) ON DELETE CASCADE,
                keyword TEXT NOT NULL,
                value_float REAL,
                value_str TEXT,
                recorded_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (attempt_id, keyword)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata_requests (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                referenced_task_id INTEGER REFERENCES tasks(id),
                referenced_name TEXT NOT NULL,
                PRIMARY KEY (task_id, kind, referenced_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_task ON scheduling_attempts(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_status ON scheduling_attempts(status)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_heartbeat \
             ON scheduling_attempts(latest_heartbeat)",
            "CREATE INDEX IF NOT EXISTS idx_products_generator ON products(generator_task)",
            "CREATE INDEX IF NOT EXISTS idx_products_location ON products(directory, filename)",
            "CREATE INDEX IF NOT EXISTS idx_versions_product ON product_versions(product_id)",
            "CREATE INDEX IF NOT EXISTS idx_versions_attempt ON product_versions(attempt_id)",
            "CREATE INDEX IF NOT EXISTS idx_inputs_product ON task_inputs(product_id)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        debug!("task graph schema is up to date");
        Ok(())
    }
}
