//! SQLite-backed [`RunStore`].
//!
//! UUIDs are stored as hyphenated TEXT and timestamps as RFC 3339 TEXT, so
//! the database stays readable from the sqlite3 shell.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::RunStatus;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use super::state::Run;
use super::store::{Crew, CrewRecipe, RunStore, RunStoreError};

impl From<sqlx::Error> for RunStoreError {
    fn from(e: sqlx::Error) -> Self {
        RunStoreError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for RunStoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        RunStoreError::Database(format!("migration failed: {e}"))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if needed) the database at `database_url` and run
    /// migrations. Accepts `sqlite:./path.db` or a bare path.
    pub async fn connect(database_url: &str) -> Result<Self, RunStoreError> {
        let file_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        let abs_path = std::env::current_dir()
            .map_err(|e| RunStoreError::Database(e.to_string()))?
            .join(file_path);
        if let Some(parent) = abs_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunStoreError::Database(e.to_string()))?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(&abs_path)
                .create_if_missing(true),
        )
        .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(path = %abs_path.display(), "Run store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid, RunStoreError> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| RunStoreError::Corrupt(format!("{column}: {e}")))
}

fn run_from_row(row: &SqliteRow) -> Result<Run, RunStoreError> {
    let status: String = row.try_get("status")?;
    let status: RunStatus = status.parse().map_err(RunStoreError::Corrupt)?;
    let total_tokens: i64 = row.try_get("total_tokens")?;

    Ok(Run {
        id: parse_uuid(row, "id")?,
        crew_id: parse_uuid(row, "crew_id")?,
        status,
        prompt: row.try_get("prompt")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        total_tokens: u64::try_from(total_tokens).unwrap_or(0),
        output: row.try_get("output")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn tokens_column(run: &Run) -> i64 {
    i64::try_from(run.total_tokens).unwrap_or(i64::MAX)
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), RunStoreError> {
        sqlx::query(
            "INSERT INTO runs (id, crew_id, status, prompt, created_at, started_at, finished_at, \
             total_tokens, output, failure_reason) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(run.crew_id.to_string())
        .bind(run.status.as_str())
        .bind(&run.prompt)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(tokens_column(run))
        .bind(&run.output)
        .bind(&run.failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query(
            "SELECT id, crew_id, status, prompt, created_at, started_at, finished_at, \
             total_tokens, output, failure_reason FROM runs WHERE id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn save_run(&self, run: &Run) -> Result<(), RunStoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, started_at = ?, finished_at = ?, total_tokens = ?, \
             output = ?, failure_reason = ? WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(tokens_column(run))
        .bind(&run.output)
        .bind(&run.failure_reason)
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(run_id = %run.id, "save_run found no row, inserting");
            return self.create_run(run).await;
        }
        Ok(())
    }

    async fn get_crew(&self, crew_id: Uuid) -> Result<Option<Crew>, RunStoreError> {
        let row = sqlx::query("SELECT id, org_id, name, recipe FROM crews WHERE id = ?")
            .bind(crew_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let recipe: String = row.try_get("recipe")?;
        let recipe: CrewRecipe = serde_json::from_str(&recipe)?;
        Ok(Some(Crew {
            id: parse_uuid(&row, "id")?,
            org_id: row.try_get("org_id")?,
            name: row.try_get("name")?,
            recipe,
        }))
    }

    async fn put_crew(&self, crew: &Crew) -> Result<(), RunStoreError> {
        let recipe = serde_json::to_string(&crew.recipe)?;
        sqlx::query(
            "INSERT INTO crews (id, org_id, name, recipe) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET org_id = excluded.org_id, name = excluded.name, \
             recipe = excluded.recipe",
        )
        .bind(crew.id.to_string())
        .bind(&crew.org_id)
        .bind(&crew.name)
        .bind(recipe)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
