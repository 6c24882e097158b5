use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::UploadSession;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Durable persistence for queued sessions
///
/// Implementations must enumerate sessions in the order they were added.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Add a new session. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn add(&self, session: &UploadSession) -> Result<(), StoreError>;

    /// Overwrite a session record (idempotent)
    async fn update(&self, session: &UploadSession) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<UploadSession>, StoreError>;

    /// Enumerate all sessions in enqueue order
    async fn list(&self) -> Result<Vec<UploadSession>, StoreError>;

    /// Remove a session by id. Removing an unknown id is a no-op.
    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// SQLite-backed session store
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (or create) the queue database
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        info!(path = %config.database_path.display(), "Opened session store");

        Ok(Self { pool })
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running session store migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Session store migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    async fn add(&self, session: &UploadSession) -> Result<(), StoreError> {
        let record = serde_json::to_string(session)?;

        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (session_id, event_id, created_at, updated_at, record)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.event_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(&record)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Session added to store");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(session.session_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    async fn update(&self, session: &UploadSession) -> Result<(), StoreError> {
        let record = serde_json::to_string(session)?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions (session_id, event_id, created_at, updated_at, record)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                record = excluded.record
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.event_id)
        .bind(session.created_at)
        .bind(Utc::now())
        .bind(&record)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<UploadSession>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM upload_sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(record,)| serde_json::from_str(&record).map_err(StoreError::from))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<UploadSession>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT record FROM upload_sessions ORDER BY seq ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(record,)| serde_json::from_str(&record).map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM upload_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        debug!("Session removed from store");
        Ok(())
    }
}

/// Volatile store for embedding and tests
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<Vec<UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn add(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.iter().any(|s| s.session_id == session.session_id) {
            return Err(StoreError::Duplicate(session.session_id.clone()));
        }
        sessions.push(session.clone());
        Ok(())
    }

    async fn update(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.iter_mut().find(|s| s.session_id == session.session_id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<UploadSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.iter().find(|s| s.session_id == session_id).cloned())
    }

    async fn list(&self) -> Result<Vec<UploadSession>, StoreError> {
        Ok(self.sessions.read().await.clone())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .retain(|s| s.session_id != session_id);
        Ok(())
    }
}
