use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::warn;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("unsupported database url: {0} (only sqlite is supported)")]
    Unsupported(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl JournalError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "db-unsupported",
            Self::Storage(_) => "db-storage",
            Self::Database(_) => "db-error",
            Self::Migrate(_) => "db-migrate",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub ts: i64,
    pub component: String,
    pub action: String,
    pub status: String,
    pub study_id: Option<String>,
    pub meta: Value,
}

/// Append-only audit trail of everything the watchdog did to the server or
/// to disk.
pub struct Journal {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
}

impl Journal {
    pub fn open(url: &str, runtime: Arc<Runtime>) -> Result<Self, JournalError> {
        let trimmed = url.trim();
        if !trimmed.starts_with("sqlite://") && !trimmed.starts_with("sqlite::") {
            return Err(JournalError::Unsupported(trimmed.to_string()));
        }
        ensure_sqlite_storage(trimmed)?;

        let max_connections = if trimmed.starts_with("sqlite::memory:") {
            1
        } else {
            4
        };
        let pool = runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(trimmed)
                .await?;
            MIGRATOR.run(&pool).await?;
            Ok::<SqlitePool, JournalError>(pool)
        })?;

        Ok(Self { pool, runtime })
    }

    /// Opens `url`, falling back to an in-memory journal so a broken database
    /// never stops the watchdog itself.
    pub fn open_or_memory(url: &str, runtime: Arc<Runtime>) -> Result<Self, JournalError> {
        match Self::open(url, runtime.clone()) {
            Ok(journal) => Ok(journal),
            Err(err) => {
                warn!(
                    "[JOURNAL] db-init-fallback url={url} code={} err={err}",
                    err.code()
                );
                Self::open(MEMORY_URL, runtime)
            }
        }
    }

    /// Best-effort write; failures are logged and swallowed.
    pub fn record(
        &self,
        component: &str,
        action: &str,
        status: &str,
        study_id: Option<&str>,
        meta: Value,
    ) {
        let ts = current_unix_secs() as i64;
        let meta_text = meta.to_string();
        let pool = self.pool.clone();
        let result = self.runtime.block_on(async move {
            sqlx::query(
                "INSERT INTO events (ts, component, action, status, study_id, meta) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(ts)
            .bind(component)
            .bind(action)
            .bind(status)
            .bind(study_id)
            .bind(meta_text)
            .execute(&pool)
            .await
        });
        if let Err(err) = result {
            warn!("[JOURNAL] event-write-failed component={component} action={action} err={err}");
        }
    }

    /// Most recent events first.
    pub fn recent(
        &self,
        limit: u32,
        component: Option<&str>,
    ) -> Result<Vec<EventRecord>, JournalError> {
        let pool = self.pool.clone();
        let rows = self.runtime.block_on(async move {
            match component {
                Some(component) => {
                    sqlx::query(
                        "SELECT id, ts, component, action, status, study_id, meta FROM events WHERE component = ? ORDER BY id DESC LIMIT ?",
                    )
                    .bind(component)
                    .bind(i64::from(limit))
                    .fetch_all(&pool)
                    .await
                }
                None => {
                    sqlx::query(
                        "SELECT id, ts, component, action, status, study_id, meta FROM events ORDER BY id DESC LIMIT ?",
                    )
                    .bind(i64::from(limit))
                    .fetch_all(&pool)
                    .await
                }
            }
        })?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let meta_text: String = row.get("meta");
                EventRecord {
                    id: row.get("id"),
                    ts: row.get("ts"),
                    component: row.get("component"),
                    action: row.get("action"),
                    status: row.get("status"),
                    study_id: row.get("study_id"),
                    meta: serde_json::from_str(&meta_text).unwrap_or(Value::Null),
                }
            })
            .collect())
    }
}

fn ensure_sqlite_storage(conn: &str) -> Result<(), JournalError> {
    let Some(raw) = conn.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = Path::new(raw.split('?').next().unwrap_or(raw));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                JournalError::Storage(format!(
                    "db-dir-create-failed path={} err={e}",
                    parent.display()
                ))
            })?;
        }
    }
    // sqlx does not create a missing file on every platform.
    if !path.exists() {
        File::create(path).map_err(|e| {
            JournalError::Storage(format!(
                "db-file-create-failed path={} err={e}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

pub fn current_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
pub(crate) fn test_journal() -> Journal {
    let runtime = Arc::new(Runtime::new().unwrap());
    Journal::open(MEMORY_URL, runtime).unwrap()
}
