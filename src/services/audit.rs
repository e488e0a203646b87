use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::MatchProposal;

/// Errors that can occur when interacting with the audit store
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),
}

/// Append-only audit store
///
/// Terminal proposals and delivery attempts are inserted for audit/replay.
/// The engine never reads this store on the hot path.
pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    /// Create a new audit store from a connection string
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AuditError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        // Run migrations on startup
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a new audit store from settings
    pub async fn from_settings(
        url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self, AuditError> {
        tracing::info!("Connecting to PostgreSQL audit store");
        Self::new(url, max_connections.unwrap_or(10), min_connections.unwrap_or(1)).await
    }

    /// Append a terminal proposal
    ///
    /// Idempotent on match id so a crash-restart replay never duplicates the
    /// audit row.
    pub async fn append_terminal(&self, proposal: &MatchProposal) -> Result<(), AuditError> {
        let query = r#"
            INSERT INTO match_audit
                (match_id, room_id, participant_ids, state, compatibility_score, created_at, terminal_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (match_id) DO NOTHING
        "#;

        let state = serde_json::to_string(&proposal.state)
            .unwrap_or_else(|_| "unknown".to_string())
            .trim_matches('"')
            .to_string();

        sqlx::query(query)
            .bind(proposal.id)
            .bind(proposal.room_id)
            .bind(proposal.participant_ids())
            .bind(state)
            .bind(proposal.score)
            .bind(proposal.created_at)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Audited terminal proposal {}", proposal.id);
        Ok(())
    }

    /// Append one delivery attempt
    pub async fn append_delivery_attempt(
        &self,
        match_id: Uuid,
        attempt: u32,
        succeeded: bool,
        error: Option<&str>,
    ) -> Result<(), AuditError> {
        let query = r#"
            INSERT INTO delivery_attempts (match_id, attempt, succeeded, error, attempted_at)
            VALUES ($1, $2, $3, $4, NOW())
        "#;

        sqlx::query(query)
            .bind(match_id)
            .bind(attempt as i32)
            .bind(succeeded)
            .bind(error)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Health check for the database connection
    pub async fn health_check(&self) -> Result<bool, AuditError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| true)
            .map_err(Into::into)
    }
}
