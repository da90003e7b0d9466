use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use sns_trigger_core::StoredValues;

pub mod session;
pub mod trigger_state;
pub mod wrapper;

pub use session::{ConflictResolution, CustomDataStorage, TriggerDataSession};
pub use trigger_state::{TriggerDataError, TriggerState};
pub use wrapper::{ConflictSafeStorage, FlushOutcome};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the versioned per-trigger key-value rows.
    pub fn trigger_data(&self) -> TriggerDataRepository {
        TriggerDataRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the build promotions table.
    pub fn build_queue(&self) -> BuildQueueRepository {
        BuildQueueRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("trigger data for scope '{0}' changed since it was read")]
    Conflict(String),
    #[error("failed to decode stored values: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Persisted values of one scope together with their version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerDataRow {
    pub values: StoredValues,
    pub version: i64,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written { version: i64 },
    Conflict,
}

/// Repository for the `trigger_data` table.
///
/// Each scope is one row. Writers state the version they read; a write is
/// applied only if the row still carries that version, with version 0 meaning
/// the row must not exist yet.
#[derive(Clone)]
pub struct TriggerDataRepository {
    pool: SqlitePool,
}

impl TriggerDataRepository {
    pub async fn load(&self, scope: &str) -> Result<Option<TriggerDataRow>, StorageError> {
        let row = sqlx::query("SELECT values_json, version FROM trigger_data WHERE scope = ?")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let values_json: String = row.get("values_json");
        Ok(Some(TriggerDataRow {
            values: serde_json::from_str(&values_json)?,
            version: row.get("version"),
        }))
    }

    /// Writes `values` if the stored version still equals `expected_version`.
    pub async fn compare_and_swap(
        &self,
        scope: &str,
        expected_version: i64,
        values: &StoredValues,
        updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome, StorageError> {
        let values_json = serde_json::to_string(values)?;
        let updated_at = to_rfc3339(updated_at);

        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO trigger_data (scope, values_json, version, updated_at) \
                 VALUES (?, ?, 1, ?) \
                 ON CONFLICT(scope) DO NOTHING",
            )
            .bind(scope)
            .bind(&values_json)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE trigger_data \
                 SET values_json = ?, version = version + 1, updated_at = ? \
                 WHERE scope = ? AND version = ?",
            )
            .bind(&values_json)
            .bind(&updated_at)
            .bind(scope)
            .bind(expected_version)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Ok(CasOutcome::Conflict);
        }
        Ok(CasOutcome::Written {
            version: expected_version + 1,
        })
    }

    /// Writes `values` unconditionally and returns the new version.
    pub async fn overwrite(
        &self,
        scope: &str,
        values: &StoredValues,
        updated_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let row = sqlx::query(
            "INSERT INTO trigger_data (scope, values_json, version, updated_at) \
             VALUES (?, ?, 1, ?) \
             ON CONFLICT(scope) DO UPDATE \
             SET values_json = excluded.values_json, \
                 version = trigger_data.version + 1, \
                 updated_at = excluded.updated_at \
             RETURNING version",
        )
        .bind(scope)
        .bind(serde_json::to_string(values)?)
        .bind(to_rfc3339(updated_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("version"))
    }

    /// Deletes the scope. Returns `false` if nothing was stored.
    pub async fn remove(&self, scope: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM trigger_data WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Lifecycle of a stored build promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionStatus {
    Pending,
    Queued,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
        }
    }
}

/// Data required to create a pending promotion.
pub struct NewPromotion<'a> {
    pub id: &'a str,
    pub trigger_id: &'a str,
    pub build_type_id: &'a str,
    pub branch: &'a str,
    pub parameters_json: String,
    pub created_at: DateTime<Utc>,
}

/// Row of the `build_queue` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PromotionRow {
    pub id: String,
    pub trigger_id: String,
    pub build_type_id: String,
    pub branch: String,
    pub parameters_json: String,
    pub status: String,
    pub triggered_by: Option<String>,
    pub created_at: String,
    pub queued_at: Option<String>,
}

/// Errors raised by the build queue repository.
#[derive(Debug, Error)]
pub enum BuildQueueError {
    #[error("promotion {0} does not exist or is already queued")]
    NotPending(String),
    #[error("failed to encode build parameters: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `build_queue` table.
#[derive(Clone)]
pub struct BuildQueueRepository {
    pool: SqlitePool,
}

impl BuildQueueRepository {
    pub async fn insert_pending(&self, promotion: NewPromotion<'_>) -> Result<(), BuildQueueError> {
        sqlx::query(
            "INSERT INTO build_queue \
             (id, trigger_id, build_type_id, branch, parameters_json, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(promotion.id)
        .bind(promotion.trigger_id)
        .bind(promotion.build_type_id)
        .bind(promotion.branch)
        .bind(&promotion.parameters_json)
        .bind(PromotionStatus::Pending.as_str())
        .bind(to_rfc3339(promotion.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves a pending promotion into the queue.
    pub async fn mark_queued(
        &self,
        id: &str,
        triggered_by: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<(), BuildQueueError> {
        let result = sqlx::query(
            "UPDATE build_queue \
             SET status = ?, triggered_by = ?, queued_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(PromotionStatus::Queued.as_str())
        .bind(triggered_by)
        .bind(to_rfc3339(queued_at))
        .bind(id)
        .bind(PromotionStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BuildQueueError::NotPending(id.to_string()));
        }
        Ok(())
    }

    /// Lists promotions of one trigger, oldest first.
    pub async fn list_for_trigger(
        &self,
        build_type_id: &str,
        trigger_id: &str,
    ) -> Result<Vec<PromotionRow>, BuildQueueError> {
        let rows = sqlx::query_as::<_, PromotionRow>(
            "SELECT id, trigger_id, build_type_id, branch, parameters_json, status, \
                    triggered_by, created_at, queued_at \
             FROM build_queue \
             WHERE build_type_id = ? AND trigger_id = ? \
             ORDER BY created_at, id",
        )
        .bind(build_type_id)
        .bind(trigger_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    pub(crate) fn values(entries: &[(&str, &str)]) -> StoredValues {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('trigger_data', 'build_queue')",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 2);
    }

    #[tokio::test]
    async fn compare_and_swap_detects_stale_version() {
        let db = setup_db().await;
        let repo = db.trigger_data();
        let now = Utc::now();

        assert!(repo.load("bt:t1").await.expect("load").is_none());

        let first = repo
            .compare_and_swap("bt:t1", 0, &values(&[("topicArn", "arn-1")]), now)
            .await
            .expect("insert");
        assert_eq!(first, CasOutcome::Written { version: 1 });

        let stale = repo
            .compare_and_swap("bt:t1", 0, &values(&[("topicArn", "arn-2")]), now)
            .await
            .expect("stale insert");
        assert_eq!(stale, CasOutcome::Conflict);

        let second = repo
            .compare_and_swap("bt:t1", 1, &values(&[("topicArn", "arn-3")]), now)
            .await
            .expect("update");
        assert_eq!(second, CasOutcome::Written { version: 2 });

        let row = repo.load("bt:t1").await.expect("load").expect("row");
        assert_eq!(row.version, 2);
        assert_eq!(row.values, values(&[("topicArn", "arn-3")]));
    }

    #[tokio::test]
    async fn overwrite_and_remove() {
        let db = setup_db().await;
        let repo = db.trigger_data();

        let version = repo
            .overwrite("bt:t2", &values(&[("a", "1")]), Utc::now())
            .await
            .expect("overwrite");
        assert_eq!(version, 1);
        let version = repo
            .overwrite("bt:t2", &values(&[("a", "2")]), Utc::now())
            .await
            .expect("overwrite again");
        assert_eq!(version, 2);

        assert!(repo.remove("bt:t2").await.expect("remove"));
        assert!(!repo.remove("bt:t2").await.expect("remove again"));
        assert!(repo.load("bt:t2").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn promotion_moves_from_pending_to_queued() {
        let db = setup_db().await;
        let repo = db.build_queue();

        repo.insert_pending(NewPromotion {
            id: "p-1",
            trigger_id: "TRIGGER_1",
            build_type_id: "Proj_Build",
            branch: "",
            parameters_json: "{}".into(),
            created_at: Utc::now(),
        })
        .await
        .expect("insert");

        repo.mark_queued("p-1", "##type='sns'", Utc::now())
            .await
            .expect("queue");
        let err = repo
            .mark_queued("p-1", "##type='sns'", Utc::now())
            .await
            .expect_err("already queued");
        assert!(matches!(err, BuildQueueError::NotPending(id) if id == "p-1"));

        let rows = repo
            .list_for_trigger("Proj_Build", "TRIGGER_1")
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "QUEUED");
        assert_eq!(rows[0].triggered_by.as_deref(), Some("##type='sns'"));
    }
}
