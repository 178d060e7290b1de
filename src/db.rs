use crate::constants::DB_PRAGMAS;
use crate::session::SessionStore;
use crate::types::{ColloquyError, Message, Result, Session, SessionHeader, SessionScope};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ColloquyError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(ColloquyError::Database(e).into()),
    };

    configure_db(&pool).await?;

    // Run Migrations
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ColloquyError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(ColloquyError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(e) => Err(ColloquyError::Internal(
            format!("Corrupt session timestamp '{}': {}", raw, e),
            tracing_error::SpanTrace::capture(),
        )
        .into()),
    }
}

/// Sessions stored one row each, messages as a JSON column.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn upsert(&self, scope: &SessionScope, session: &Session) -> Result<()> {
        let messages_json = serde_json::to_string(&session.messages)?;
        sqlx::query(
            "INSERT INTO chat_sessions (id, project, profile, title, created_at, total_tokens, total_cost, messages_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                total_tokens = excluded.total_tokens,
                total_cost = excluded.total_cost,
                messages_json = excluded.messages_json,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&session.id)
        .bind(&scope.project)
        .bind(&scope.profile)
        .bind(&session.title)
        .bind(session.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(session.total_tokens.map(|t| t as i64))
        .bind(session.total_cost)
        .bind(messages_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, scope: &SessionScope, title: &str) -> Result<Session> {
        let session = Session::new(title);
        self.upsert(scope, &session).await?;
        tracing::info!("Created chat session {} ({})", session.id, session.title);
        Ok(session)
    }

    async fn save(&self, scope: &SessionScope, session: &Session) -> Result<()> {
        let mut stored = session.clone();
        stored.recompute_totals();
        self.upsert(scope, &stored).await?;
        tracing::debug!(
            "Saved session {} ({} messages, tokens={:?})",
            stored.id,
            stored.messages.len(),
            stored.total_tokens
        );
        Ok(())
    }

    async fn list(&self, scope: &SessionScope) -> Result<Vec<SessionHeader>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at FROM chat_sessions
             WHERE project = ? AND profile = ?
             ORDER BY created_at DESC",
        )
        .bind(&scope.project)
        .bind(&scope.profile)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                Ok(SessionHeader {
                    id: row.get("id"),
                    title: row.get("title"),
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    async fn load(&self, scope: &SessionScope, id: &str) -> Result<Session> {
        let row = sqlx::query(
            "SELECT id, title, created_at, total_tokens, total_cost, messages_json
             FROM chat_sessions WHERE id = ? AND project = ? AND profile = ?",
        )
        .bind(id)
        .bind(&scope.project)
        .bind(&scope.profile)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(ColloquyError::SessionNotFound(id.to_string()).into());
        };

        let created_at: String = row.get("created_at");
        let messages_json: String = row.get("messages_json");
        let total_tokens: Option<i64> = row.get("total_tokens");
        let messages: Vec<Message> = serde_json::from_str(&messages_json)?;

        Ok(Session {
            id: row.get("id"),
            title: row.get("title"),
            created_at: parse_timestamp(&created_at)?,
            messages,
            total_tokens: total_tokens.map(|t| t as u64),
            total_cost: row.get("total_cost"),
        })
    }

    async fn delete(&self, scope: &SessionScope, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chat_sessions WHERE id = ? AND project = ? AND profile = ?")
            .bind(id)
            .bind(&scope.project)
            .bind(&scope.profile)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename(&self, scope: &SessionScope, id: &str, title: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET title = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND project = ? AND profile = ?",
        )
        .bind(title)
        .bind(id)
        .bind(&scope.project)
        .bind(&scope.profile)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ColloquyError::SessionNotFound(id.to_string()).into());
        }
        Ok(())
    }

    async fn delete_all(&self, scope: &SessionScope) -> Result<()> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE project = ? AND profile = ?")
            .bind(&scope.project)
            .bind(&scope.profile)
            .execute(&self.pool)
            .await?;
        tracing::info!(
            "Deleted {} sessions for {}/{}",
            result.rows_affected(),
            scope.project,
            scope.profile
        );
        Ok(())
    }
}
