use crate::entity::UserIdentity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::{
    collections::HashMap,
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONVERSATION_ID_KEY: &str = "parley_conversation_id";
pub const STARTED_AT_KEY: &str = "parley_conversation_started_at";
pub const MESSAGE_COUNT_KEY: &str = "parley_message_count";
pub const ENDED_KEY: &str = "parley_conversation_ended";
pub const USER_NAME_KEY: &str = "parley_user_name";
pub const USER_EMAIL_KEY: &str = "parley_user_email";
pub const USER_PHONE_KEY: &str = "parley_user_phone";
pub const VISITOR_ID_KEY: &str = "parley_chat_user_id";

/// Session-scoped key/value storage. Implementations never fail towards the
/// caller; storage problems are logged and absorbed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    async fn remove(&self, key: &str);
}

/// Process-local storage. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        self.items().insert(key.to_string(), value.to_string());
    }

    async fn remove(&self, key: &str) {
        self.items().remove(key);
    }
}

/// SQLite-backed storage that survives restarts of the front end.
///
/// After the first failed query every operation is served from an in-memory
/// copy for the rest of the process, so writes stay readable.
#[derive(Debug)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    fallback: MemorySessionStore,
    degraded: AtomicBool,
}

impl SqliteSessionStore {
    /// Open (and create if needed) the session database at `db_path`.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create session directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to session database")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_items (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to initialize session schema")?;

        Ok(Self {
            pool,
            fallback: MemorySessionStore::new(),
            degraded: AtomicBool::new(false),
        })
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade(&self, op: &str, key: &str, err: &sqlx::Error) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                "Session storage unavailable ({} {}): {}. Using in-memory values for this session.",
                op, key, err
            );
        }
    }

    async fn try_get(&self, key: &str) -> std::result::Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM session_items WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("value")).transpose()
    }

    async fn try_set(&self, key: &str, value: &str) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO session_items (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_remove(&self, key: &str) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM session_items WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &str) -> Option<String> {
        if self.is_degraded() {
            return self.fallback.get(key).await;
        }
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                self.degrade("get", key, &e);
                self.fallback.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: &str) {
        if !self.is_degraded() {
            match self.try_set(key, value).await {
                Ok(()) => return,
                Err(e) => self.degrade("set", key, &e),
            }
        }
        self.fallback.set(key, value).await;
    }

    async fn remove(&self, key: &str) {
        if !self.is_degraded() {
            match self.try_remove(key).await {
                Ok(()) => return,
                Err(e) => self.degrade("remove", key, &e),
            }
        }
        self.fallback.remove(key).await;
    }
}

/// Pick the storage backend once, at construction. Without a path, or when
/// the database cannot be opened, the session lives in memory only.
pub async fn open_session_store(db_path: Option<&Path>) -> Arc<dyn SessionStore> {
    let Some(db_path) = db_path else {
        info!("No session path configured, keeping conversation state in memory");
        return Arc::new(MemorySessionStore::new());
    };

    match SqliteSessionStore::open(db_path).await {
        Ok(store) => {
            info!("Session store at {}", db_path.display());
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                "Session storage unavailable at {}: {:#}. Falling back to memory.",
                db_path.display(),
                e
            );
            Arc::new(MemorySessionStore::new())
        }
    }
}

/// Typed view of the conversation fields kept in a [`SessionStore`].
#[derive(Clone)]
pub struct ConversationRecord {
    store: Arc<dyn SessionStore>,
}

impl ConversationRecord {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// The current conversation id, starting a new conversation if there is
    /// none yet.
    pub async fn conversation_id(&self) -> String {
        if let Some(id) = self.store.get(CONVERSATION_ID_KEY).await {
            return id;
        }

        let id = generate_conversation_id();
        debug!("Starting conversation {}", id);
        self.store.set(CONVERSATION_ID_KEY, &id).await;
        self.store.set(STARTED_AT_KEY, &Utc::now().to_rfc3339()).await;
        self.store.set(MESSAGE_COUNT_KEY, "0").await;
        id
    }

    pub async fn message_count(&self) -> u64 {
        self.store
            .get(MESSAGE_COUNT_KEY)
            .await
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }

    pub async fn increment_message_count(&self) -> u64 {
        let count = self.message_count().await + 1;
        self.store.set(MESSAGE_COUNT_KEY, &count.to_string()).await;
        count
    }

    pub async fn started_at(&self) -> DateTime<Utc> {
        self.store
            .get(STARTED_AT_KEY)
            .await
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    pub async fn is_ended(&self) -> bool {
        self.store.get(ENDED_KEY).await.as_deref() == Some("true")
    }

    pub async fn set_ended(&self, ended: bool) {
        self.store
            .set(ENDED_KEY, if ended { "true" } else { "false" })
            .await;
    }

    pub async fn clear_conversation(&self) {
        for key in [CONVERSATION_ID_KEY, STARTED_AT_KEY, MESSAGE_COUNT_KEY, ENDED_KEY] {
            self.store.remove(key).await;
        }
    }

    pub async fn user_identity(&self) -> Option<UserIdentity> {
        let name = self.store.get(USER_NAME_KEY).await.filter(|s| !s.is_empty())?;
        let email = self.store.get(USER_EMAIL_KEY).await.filter(|s| !s.is_empty())?;
        let phone = self.store.get(USER_PHONE_KEY).await.unwrap_or_default();
        Some(UserIdentity { name, email, phone })
    }

    pub async fn store_user_identity(&self, identity: &UserIdentity) {
        self.store.set(USER_NAME_KEY, &identity.name).await;
        self.store.set(USER_EMAIL_KEY, &identity.email).await;
        self.store.set(USER_PHONE_KEY, &identity.phone).await;
    }

    pub async fn clear_user_identity(&self) {
        for key in [USER_NAME_KEY, USER_EMAIL_KEY, USER_PHONE_KEY] {
            self.store.remove(key).await;
        }
    }

    /// Stable per-visitor id; conversation resets leave it alone.
    pub async fn visitor_id(&self) -> String {
        if let Some(id) = self.store.get(VISITOR_ID_KEY).await {
            return id;
        }
        let random = Uuid::new_v4().simple().to_string();
        let id = format!("user_{}_{}", Utc::now().timestamp_millis(), &random[..9]);
        self.store.set(VISITOR_ID_KEY, &id).await;
        id
    }
}

/// `conv_<unix millis>_<random>`.
pub fn generate_conversation_id() -> String {
    format!(
        "conv_{}_{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}
