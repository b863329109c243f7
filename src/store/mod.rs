//! Durable Progress Store plus the Job/Account/Log persistence it shares a
//! connection pool with. Backed by `sqlx` + SQLite.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::domain::{
    Account, AccountId, AccountStatus, ChatRef, FilterPolicy, Job, JobId, JobStatus, LogEntry,
    LogLevel, ProgressCursor, RateParams,
};
use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = include_str!("schema.sql");

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        // In-memory databases are per-connection: a pool of more than one
        // would migrate a table on one connection and find it missing on
        // the next. WAL mode also has no meaning without a backing file.
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------

    pub async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, description, source_ref, target_ref, account_ids,
                filter_policy, rate_params, status, reset_progress,
                schedule_enabled, schedule_cron, auto_restart,
                created_at, started_at, completed_at, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(serde_json::to_string(&job.source_ref)?)
        .bind(serde_json::to_string(&job.target_ref)?)
        .bind(serde_json::to_string(&job.account_ids)?)
        .bind(serde_json::to_string(&job.filter_policy)?)
        .bind(serde_json::to_string(&job.rate_params)?)
        .bind(status_str(job.status))
        .bind(job.reset_progress)
        .bind(job.schedule_enabled)
        .bind(&job.schedule_cron)
        .bind(job.auto_restart)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(&job.last_error)
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO progress (job_id, last_id, delivered) VALUES (?, 0, '[]')")
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                name = ?, description = ?, source_ref = ?, target_ref = ?,
                account_ids = ?, filter_policy = ?, rate_params = ?, status = ?,
                reset_progress = ?, schedule_enabled = ?, schedule_cron = ?,
                auto_restart = ?, started_at = ?, completed_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(serde_json::to_string(&job.source_ref)?)
        .bind(serde_json::to_string(&job.target_ref)?)
        .bind(serde_json::to_string(&job.account_ids)?)
        .bind(serde_json::to_string(&job.filter_policy)?)
        .bind(serde_json::to_string(&job.rate_params)?)
        .bind(status_str(job.status))
        .bind(job.reset_progress)
        .bind(job.schedule_enabled)
        .bind(&job.schedule_cron)
        .bind(job.auto_restart)
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(&job.last_error)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }

    pub async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(job_from_row).collect()
    }

    pub async fn delete_job(&self, id: &JobId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM progress WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM logs WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transition every job persisted as `running` back to `pending` on
    /// recovery: the engine never auto-restarts a job it did not observe
    /// crash. Returns the affected job ids.
    pub async fn demote_running_jobs(&self) -> StoreResult<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<JobId> = rows.iter().map(|r| r.get::<String, _>("id")).collect();
        sqlx::query("UPDATE jobs SET status = 'pending' WHERE status = 'running'")
            .execute(&self.pool)
            .await?;
        Ok(ids)
    }

    // ---------------------------------------------------------------
    // Progress Cursor
    // ---------------------------------------------------------------

    pub async fn load_cursor(&self, job_id: &JobId) -> StoreResult<ProgressCursor> {
        let row = sqlx::query("SELECT last_id, delivered FROM progress WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let last_id: i64 = row.get("last_id");
                let delivered_json: String = row.get("delivered");
                let delivered: HashSet<i64> = serde_json::from_str(&delivered_json)?;
                Ok(ProgressCursor { last_id, delivered })
            }
            None => Ok(ProgressCursor::default()),
        }
    }

    /// Atomically advance `last_id` and add `delivered_id` to the
    /// delivered set — must be atomic with respect to crashes — then trim
    /// to the retained bound.
    pub async fn append(&self, job_id: &JobId, delivered_id: Option<i64>, last_id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT delivered FROM progress WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.clone()))?;
        let delivered_json: String = row.get("delivered");
        let mut delivered: HashSet<i64> = serde_json::from_str(&delivered_json)?;

        if let Some(id) = delivered_id {
            delivered.insert(id);
        }
        let mut cursor = ProgressCursor { last_id, delivered };
        cursor.trim();

        sqlx::query("UPDATE progress SET last_id = ?, delivered = ? WHERE job_id = ?")
            .bind(cursor.last_id)
            .bind(serde_json::to_string(&cursor.delivered)?)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn reset_cursor(&self, job_id: &JobId) -> StoreResult<()> {
        sqlx::query("UPDATE progress SET last_id = 0, delivered = '[]' WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Logs
    // ---------------------------------------------------------------

    pub async fn append_log(&self, entry: &LogEntry) -> StoreResult<()> {
        sqlx::query("INSERT INTO logs (job_id, ts, level, message) VALUES (?, ?, ?, ?)")
            .bind(&entry.job_id)
            .bind(entry.timestamp.to_rfc3339())
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent_logs(&self, job_id: &JobId, limit: i64) -> StoreResult<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT job_id, ts, level, message FROM logs WHERE job_id = ? ORDER BY ts DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let ts: String = row.get("ts");
                let level: String = row.get("level");
                Ok(LogEntry {
                    job_id: row.get("job_id"),
                    level: level_from_str(&level),
                    message: row.get("message"),
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Accounts
    // ---------------------------------------------------------------

    pub async fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, api_id, api_hash, phone, session_blob, status, use_tor, auth_attempts, last_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                api_id = excluded.api_id,
                api_hash = excluded.api_hash,
                phone = excluded.phone,
                session_blob = excluded.session_blob,
                status = excluded.status,
                use_tor = excluded.use_tor,
                auth_attempts = excluded.auth_attempts,
                last_active = excluded.last_active
            "#,
        )
        .bind(&account.id)
        .bind(account.api_id)
        .bind(&account.api_hash)
        .bind(&account.phone)
        .bind(&account.session_blob)
        .bind(account_status_str(account.status))
        .bind(account.use_tor)
        .bind(account.auth_attempts)
        .bind(account.last_active.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(account_from_row).transpose()
    }

    pub async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts").fetch_all(&self.pool).await?;
        rows.into_iter().map(account_from_row).collect()
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Paused => "paused",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Stopped => "stopped",
    }
}

fn status_from_str(s: &str) -> JobStatus {
    match s {
        "running" => JobStatus::Running,
        "paused" => JobStatus::Paused,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "stopped" => JobStatus::Stopped,
        _ => JobStatus::Pending,
    }
}

fn account_status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Created => "created",
        AccountStatus::Authenticating => "authenticating",
        AccountStatus::Authenticated => "authenticated",
        AccountStatus::Failed => "failed",
        AccountStatus::Disconnected => "disconnected",
    }
}

fn account_status_from_str(s: &str) -> AccountStatus {
    match s {
        "authenticating" => AccountStatus::Authenticating,
        "authenticated" => AccountStatus::Authenticated,
        "failed" => AccountStatus::Failed,
        "disconnected" => AccountStatus::Disconnected,
        _ => AccountStatus::Created,
    }
}

fn level_from_str(s: &str) -> LogLevel {
    match s {
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Job> {
    let source_ref: String = row.get("source_ref");
    let target_ref: String = row.get("target_ref");
    let account_ids: String = row.get("account_ids");
    let filter_policy: String = row.get("filter_policy");
    let rate_params: String = row.get("rate_params");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let started_at: Option<String> = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(Job {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        source_ref: serde_json::from_str::<ChatRef>(&source_ref)?,
        target_ref: serde_json::from_str::<ChatRef>(&target_ref)?,
        account_ids: serde_json::from_str::<Vec<AccountId>>(&account_ids)?,
        filter_policy: serde_json::from_str::<FilterPolicy>(&filter_policy)?,
        rate_params: serde_json::from_str::<RateParams>(&rate_params)?,
        status: status_from_str(&status),
        created_at: parse_rfc3339(&created_at)?,
        started_at: started_at.map(|s| parse_rfc3339(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_rfc3339(&s)).transpose()?,
        last_error: row.get("last_error"),
        reset_progress: row.get("reset_progress"),
        schedule_enabled: row.get("schedule_enabled"),
        schedule_cron: row.get("schedule_cron"),
        auto_restart: row.get("auto_restart"),
    })
}

fn account_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Account> {
    let status: String = row.get("status");
    let last_active: Option<String> = row.get("last_active");
    Ok(Account {
        id: row.get("id"),
        api_id: row.get("api_id"),
        api_hash: row.get("api_hash"),
        session_blob: row.get("session_blob"),
        phone: row.get("phone"),
        status: account_status_from_str(&status),
        use_tor: row.get("use_tor"),
        auth_attempts: row.get::<i64, _>("auth_attempts") as u32,
        last_active: last_active.map(|s| parse_rfc3339(&s)).transpose()?,
    })
}

fn parse_rfc3339(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FilterKind;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_job() -> Job {
        Job::new(
            "job1".into(),
            "test job".into(),
            ChatRef::Id(1),
            ChatRef::Id(2),
            vec!["acc1".into()],
            FilterPolicy {
                kinds: [FilterKind::TextOnly].into_iter().collect(),
                extensions: Default::default(),
            },
            RateParams::default(),
        )
    }

    #[tokio::test]
    async fn round_trip_job() {
        let store = memory_store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cursor_round_trip_and_trim() {
        let store = memory_store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        store.append(&job.id, Some(5), 5).await.unwrap();
        store.append(&job.id, Some(6), 6).await.unwrap();

        let cursor = store.load_cursor(&job.id).await.unwrap();
        assert_eq!(cursor.last_id, 6);
        assert!(cursor.delivered.contains(&5));
        assert!(cursor.delivered.contains(&6));
    }

    #[tokio::test]
    async fn demote_running_jobs_on_recovery() {
        let store = memory_store().await;
        let mut job = sample_job();
        job.transition(JobStatus::Running);
        store.insert_job(&job).await.unwrap();

        let demoted = store.demote_running_jobs().await.unwrap();
        assert_eq!(demoted, vec![job.id.clone()]);

        let reloaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);
    }
}
