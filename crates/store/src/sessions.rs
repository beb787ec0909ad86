use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;

use reservo_core::config::SessionConfig;
use reservo_core::session::{Session, SessionKey, SessionStore, SessionStoreError};

pub type DbPool = sqlx::SqlitePool;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session (
    platform TEXT NOT NULL,
    user_id TEXT NOT NULL,
    document TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (platform, user_id)
)";

/// Opens the session database.
///
/// Every processed message rewrites one `(platform, user)` document row, so
/// the connection is tuned for many small independent writers: WAL keeps
/// health probes and other readers off the writer's lock, `synchronous =
/// NORMAL` is safe under WAL and halves the fsync cost of the per-message
/// write, and the busy timeout absorbs write bursts from concurrent
/// conversations.
pub async fn open_session_pool(config: &SessionConfig) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
}

pub async fn migrate(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Session store over sqlite with optimistic versioned writes: a `put`
/// whose loaded version was superseded in the meantime is rejected instead
/// of silently dropping the concurrent writer's turns.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, SessionStoreError> {
        let row = sqlx::query("SELECT document, version FROM session WHERE platform = ? AND user_id = ?")
            .bind(key.platform.as_str())
            .bind(key.user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| SessionStoreError::Load(error.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let document: String =
            row.try_get("document").map_err(|error| SessionStoreError::Load(error.to_string()))?;
        let version: i64 =
            row.try_get("version").map_err(|error| SessionStoreError::Load(error.to_string()))?;

        let mut session: Session = serde_json::from_str(&document)
            .map_err(|error| SessionStoreError::Load(format!("session document: {error}")))?;
        session.version = version;
        Ok(Some(session))
    }

    async fn put(&self, key: &SessionKey, session: &Session) -> Result<(), SessionStoreError> {
        let document = serde_json::to_string(session)
            .map_err(|error| SessionStoreError::Save(format!("session document: {error}")))?;
        let updated_at = Utc::now().to_rfc3339();

        let conflict = || SessionStoreError::Conflict {
            platform: key.platform,
            user_id: key.user_id.clone(),
            expected: session.version,
        };

        if session.version == 0 {
            let result = sqlx::query(
                "INSERT INTO session (platform, user_id, document, version, updated_at) \
                 VALUES (?, ?, ?, 1, ?)",
            )
            .bind(key.platform.as_str())
            .bind(key.user_id.as_str())
            .bind(&document)
            .bind(&updated_at)
            .execute(&self.pool)
            .await;

            return match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                    Err(conflict())
                }
                Err(error) => Err(SessionStoreError::Save(error.to_string())),
            };
        }

        let result = sqlx::query(
            "UPDATE session SET document = ?, version = version + 1, updated_at = ? \
             WHERE platform = ? AND user_id = ? AND version = ?",
        )
        .bind(&document)
        .bind(&updated_at)
        .bind(key.platform.as_str())
        .bind(key.user_id.as_str())
        .bind(session.version)
        .execute(&self.pool)
        .await
        .map_err(|error| SessionStoreError::Save(error.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(conflict());
        }
        Ok(())
    }
}
