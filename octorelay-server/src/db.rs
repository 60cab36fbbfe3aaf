//! SQLite persistence layer.
//!
//! The store is the only shared mutable resource in the process. All
//! mutations serialize through one `Mutex<Connection>`; constraint-based
//! conflict signaling (insert returning `false`) is the only synchronization
//! primitive it offers to higher layers, and the claim protocol is built on
//! exactly that.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::Connection;

use crate::records::{
    CommentSyncRecord, CopyRecord, RecordKind, RecordStatus, ReviewTask, ScoreRecord,
    WebhookEventRecord,
};

/// Current schema version. Increment when making schema changes.
///
/// When adding a new version:
/// 1. Increment this constant
/// 2. Add a migration function `migrate_v{N}_to_v{N+1}`
/// 3. Call it from `run_migrations`
const SCHEMA_VERSION: i32 = 2;

/// Current UTC time as a fixed-width RFC 3339 string.
///
/// Fixed fractional precision keeps lexicographic order equal to
/// chronological order, which the retention sweep relies on.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A work record as seen by the claim protocol: identity, status, age.
#[derive(Debug, Clone)]
pub struct ClaimRow {
    pub id: String,
    pub status: RecordStatus,
    pub created_at: String,
}

/// Filters for the read-only query surface.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<RecordStatus>,
    pub repo: Option<String>,
    pub limit: Option<usize>,
}

/// SQLite database holding every record kind.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// The mutex doubles as the process-wide write serialization point: no two
/// threads in this process can interleave store mutations.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema and run any pending migrations.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    /// Run migrations from `from_version` up to `SCHEMA_VERSION`, in order.
    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        if from_version < 2 {
            Self::migrate_v1_to_v2(conn)?;
        }

        Ok(())
    }

    /// Migration v0 -> v1: initial schema.
    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS copy_records (
                id TEXT PRIMARY KEY,
                source_repo TEXT NOT NULL,
                source_number INTEGER NOT NULL,
                target_repo TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'pending', 'processing', 'completed', 'failed'
                )),
                target_number INTEGER,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,

                -- The logical key is unique across ALL statuses: at most one
                -- row per (source, number, target), whatever the outcome.
                UNIQUE (source_repo, source_number, target_repo)
            );

            CREATE TABLE IF NOT EXISTS review_tasks (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                head_sha TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'pending', 'processing', 'completed', 'failed'
                )),
                substantive INTEGER,
                summary TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_review_tasks_pr
            ON review_tasks(repo, pr_number);

            CREATE TABLE IF NOT EXISTS score_records (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                issue_number INTEGER NOT NULL,
                comment_id INTEGER NOT NULL,
                author TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'pending', 'processing', 'completed', 'failed'
                )),
                score INTEGER,
                reasoning TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS comment_sync_records (
                id TEXT PRIMARY KEY,
                source_repo TEXT NOT NULL,
                source_number INTEGER NOT NULL,
                comment_id INTEGER NOT NULL,
                target_repo TEXT NOT NULL,
                target_number INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'pending', 'processing', 'completed', 'failed'
                )),
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS webhook_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                action TEXT,
                delivery_id TEXT,
                sender TEXT,
                repo TEXT,
                entity_number INTEGER,
                coordinators TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    /// Migration v1 -> v2: add the cosmetic worker progress column.
    fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            ALTER TABLE copy_records ADD COLUMN progress TEXT;
            ALTER TABLE review_tasks ADD COLUMN progress TEXT;
            ALTER TABLE score_records ADD COLUMN progress TEXT;
            ALTER TABLE comment_sync_records ADD COLUMN progress TEXT;
            "#,
        )
        .context("Failed to add progress columns (v1 -> v2)")?;

        Ok(())
    }

    /// Insert a row, reporting a logical-key conflict as `Ok(false)`.
    ///
    /// This boolean is the only channel through which "someone else already
    /// owns this key" is communicated to higher layers.
    fn insert(&self, table: &str, columns: &[&str], params: &[&dyn ToSql]) -> Result<bool> {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn.lock().expect("mutex poisoned");
        match conn.execute(&sql, params) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to insert into {}", table)),
        }
    }

    /// Apply a partial update to one row. Returns whether a row matched.
    pub fn update_row(
        &self,
        table: &str,
        id: &str,
        assignments: &[(&str, &dyn ToSql)],
    ) -> Result<bool> {
        let set: Vec<String> = assignments
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{} = ?{}", col, i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            table,
            set.join(", "),
            assignments.len() + 1
        );

        let mut params: Vec<&dyn ToSql> = assignments.iter().map(|(_, v)| *v).collect();
        params.push(&id as &dyn ToSql);

        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(&sql, params.as_slice())
            .with_context(|| format!("Failed to update row in {}", table))?;

        Ok(rows > 0)
    }

    /// All rows whose logical key matches, as the claim protocol sees them.
    pub fn find_claims(&self, kind: RecordKind, key: &[(&str, &dyn ToSql)]) -> Result<Vec<ClaimRow>> {
        let clauses: Vec<String> = key
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{} = ?{}", col, i + 1))
            .collect();
        let sql = format!(
            "SELECT id, status, created_at FROM {} WHERE {}",
            kind.table(),
            clauses.join(" AND ")
        );
        let params: Vec<&dyn ToSql> = key.iter().map(|(_, v)| *v).collect();

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare claim query on {}", kind.table()))?;
        let rows = stmt
            .query_map(params.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query claim rows")?;

        let mut result = Vec::new();
        for row in rows {
            let (id, status, created_at) = row.context("Failed to read claim row")?;
            result.push(ClaimRow {
                id,
                status: RecordStatus::parse(&status)?,
                created_at,
            });
        }

        Ok(result)
    }

    /// Atomically take over a stale live row.
    ///
    /// Compare-and-swap on the observed `created_at`: the update succeeds
    /// only if nobody else has touched the row since it was read, so two
    /// reclaimers racing for the same stale row cannot both win.
    pub fn take_over_stale(
        &self,
        kind: RecordKind,
        id: &str,
        observed_created_at: &str,
        new_created_at: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                &format!(
                    "UPDATE {} SET status = 'pending', created_at = ?1, error = NULL \
                     WHERE id = ?2 AND status IN ('pending', 'processing') AND created_at = ?3",
                    kind.table()
                ),
                rusqlite::params![new_created_at, id, observed_created_at],
            )
            .context("Failed to take over stale claim row")?;

        Ok(rows > 0)
    }

    /// Delete terminal rows created before `cutoff`. Returns the count.
    pub fn sweep_terminal_before(&self, table: &str, cutoff: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE status IN ('completed', 'failed') AND created_at < ?1",
                    table
                ),
                rusqlite::params![cutoff],
            )
            .with_context(|| format!("Failed to sweep {}", table))?;

        Ok(rows)
    }

    /// Delete webhook audit rows created before `cutoff` (always terminal).
    pub fn sweep_events_before(&self, cutoff: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                "DELETE FROM webhook_events WHERE created_at < ?1",
                rusqlite::params![cutoff],
            )
            .context("Failed to sweep webhook_events")?;

        Ok(rows)
    }

    /// Row count per status for one table.
    pub fn stats(&self, table: &str) -> Result<HashMap<String, u64>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT status, COUNT(*) FROM {} GROUP BY status",
                table
            ))
            .with_context(|| format!("Failed to prepare stats query on {}", table))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })
            .context("Failed to query stats")?;

        let mut result = HashMap::new();
        for row in rows {
            let (status, count) = row.context("Failed to read stats row")?;
            result.insert(status, count);
        }

        Ok(result)
    }

    fn total(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count: u64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("Failed to count {}", table))?;
        Ok(count)
    }

    /// Total rows in one record kind's table.
    pub fn count(&self, kind: RecordKind) -> Result<u64> {
        self.total(kind.table())
    }

    pub fn count_events(&self) -> Result<u64> {
        self.total("webhook_events")
    }

    fn list_sql(table: &str, columns: &str, repo_column: &str, filter: &ListFilter) -> String {
        let mut sql = format!("SELECT {} FROM {} WHERE 1=1", columns, table);
        if filter.status.is_some() {
            sql.push_str(" AND status = :status");
        }
        if filter.repo.is_some() {
            sql.push_str(&format!(" AND {} = :repo", repo_column));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT :limit");
        sql
    }

    fn filter_params<'a>(
        filter: &'a ListFilter,
        status_str: &'a Option<&'static str>,
        limit: &'a i64,
    ) -> Vec<(&'static str, &'a dyn ToSql)> {
        let mut params: Vec<(&'static str, &dyn ToSql)> = Vec::new();
        if let Some(s) = status_str {
            params.push((":status", s));
        }
        if let Some(repo) = &filter.repo {
            params.push((":repo", repo));
        }
        params.push((":limit", limit));
        params
    }

    // --- copy records ---

    pub fn insert_copy(&self, record: &CopyRecord) -> Result<bool> {
        self.insert(
            "copy_records",
            &[
                "id",
                "source_repo",
                "source_number",
                "target_repo",
                "title",
                "status",
                "progress",
                "target_number",
                "error",
                "created_at",
                "completed_at",
            ],
            &[
                &record.id,
                &record.source_repo,
                &record.source_number,
                &record.target_repo,
                &record.title,
                &record.status.as_str(),
                &record.progress,
                &record.target_number,
                &record.error,
                &record.created_at,
                &record.completed_at,
            ],
        )
    }

    const COPY_COLUMNS: &'static str = "id, source_repo, source_number, target_repo, title, \
         status, progress, target_number, error, created_at, completed_at";

    fn copy_from_row(row: &rusqlite::Row) -> rusqlite::Result<(CopyRecord, String)> {
        let status: String = row.get(5)?;
        Ok((
            CopyRecord {
                id: row.get(0)?,
                source_repo: row.get(1)?,
                source_number: row.get(2)?,
                target_repo: row.get(3)?,
                title: row.get(4)?,
                status: RecordStatus::Pending, // patched by caller from `status`
                progress: row.get(6)?,
                target_number: row.get(7)?,
                error: row.get(8)?,
                created_at: row.get(9)?,
                completed_at: row.get(10)?,
            },
            status,
        ))
    }

    pub fn get_copy(&self, id: &str) -> Result<Option<CopyRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM copy_records WHERE id = ?1",
                Self::COPY_COLUMNS
            ),
            rusqlite::params![id],
            Self::copy_from_row,
        );
        Self::one(result, |(mut record, status)| {
            record.status = RecordStatus::parse(&status)?;
            Ok(record)
        })
    }

    pub fn list_copies(&self, filter: &ListFilter) -> Result<Vec<CopyRecord>> {
        let sql = Self::list_sql(
            "copy_records",
            Self::COPY_COLUMNS,
            RecordKind::Copy.repo_column(),
            filter,
        );
        let status_str = filter.status.map(|s| s.as_str());
        let limit = filter.limit.unwrap_or(50) as i64;
        let params = Self::filter_params(filter, &status_str, &limit);

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&sql).context("Failed to prepare copy list")?;
        let rows = stmt
            .query_map(params.as_slice(), Self::copy_from_row)
            .context("Failed to query copy records")?;

        let mut result = Vec::new();
        for row in rows {
            let (mut record, status) = row.context("Failed to read copy record")?;
            record.status = RecordStatus::parse(&status)?;
            result.push(record);
        }
        Ok(result)
    }

    /// Completed copies of one source issue (used by comment fan-out).
    pub fn completed_copies_of(
        &self,
        source_repo: &str,
        source_number: u64,
    ) -> Result<Vec<CopyRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM copy_records \
                 WHERE source_repo = ?1 AND source_number = ?2 AND status = 'completed'",
                Self::COPY_COLUMNS
            ))
            .context("Failed to prepare completed-copies query")?;
        let rows = stmt
            .query_map(
                rusqlite::params![source_repo, source_number],
                Self::copy_from_row,
            )
            .context("Failed to query completed copies")?;

        let mut result = Vec::new();
        for row in rows {
            let (mut record, status) = row.context("Failed to read copy record")?;
            record.status = RecordStatus::parse(&status)?;
            result.push(record);
        }
        Ok(result)
    }

    // --- review tasks ---

    pub fn insert_review(&self, task: &ReviewTask) -> Result<bool> {
        self.insert(
            "review_tasks",
            &[
                "id",
                "repo",
                "pr_number",
                "head_sha",
                "model",
                "status",
                "progress",
                "substantive",
                "summary",
                "error",
                "created_at",
                "completed_at",
            ],
            &[
                &task.id,
                &task.repo,
                &task.pr_number,
                &task.head_sha,
                &task.model,
                &task.status.as_str(),
                &task.progress,
                &task.substantive,
                &task.summary,
                &task.error,
                &task.created_at,
                &task.completed_at,
            ],
        )
    }

    const REVIEW_COLUMNS: &'static str = "id, repo, pr_number, head_sha, model, status, \
         progress, substantive, summary, error, created_at, completed_at";

    fn review_from_row(row: &rusqlite::Row) -> rusqlite::Result<(ReviewTask, String)> {
        let status: String = row.get(5)?;
        Ok((
            ReviewTask {
                id: row.get(0)?,
                repo: row.get(1)?,
                pr_number: row.get(2)?,
                head_sha: row.get(3)?,
                model: row.get(4)?,
                status: RecordStatus::Pending,
                progress: row.get(6)?,
                substantive: row.get(7)?,
                summary: row.get(8)?,
                error: row.get(9)?,
                created_at: row.get(10)?,
                completed_at: row.get(11)?,
            },
            status,
        ))
    }

    pub fn get_review(&self, id: &str) -> Result<Option<ReviewTask>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM review_tasks WHERE id = ?1",
                Self::REVIEW_COLUMNS
            ),
            rusqlite::params![id],
            Self::review_from_row,
        );
        Self::one(result, |(mut task, status)| {
            task.status = RecordStatus::parse(&status)?;
            Ok(task)
        })
    }

    pub fn list_reviews(&self, filter: &ListFilter) -> Result<Vec<ReviewTask>> {
        let sql = Self::list_sql(
            "review_tasks",
            Self::REVIEW_COLUMNS,
            RecordKind::Review.repo_column(),
            filter,
        );
        let status_str = filter.status.map(|s| s.as_str());
        let limit = filter.limit.unwrap_or(50) as i64;
        let params = Self::filter_params(filter, &status_str, &limit);

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare review list")?;
        let rows = stmt
            .query_map(params.as_slice(), Self::review_from_row)
            .context("Failed to query review tasks")?;

        let mut result = Vec::new();
        for row in rows {
            let (mut task, status) = row.context("Failed to read review task")?;
            task.status = RecordStatus::parse(&status)?;
            result.push(task);
        }
        Ok(result)
    }

    // --- score records ---

    pub fn insert_score(&self, record: &ScoreRecord) -> Result<bool> {
        self.insert(
            "score_records",
            &[
                "id",
                "repo",
                "issue_number",
                "comment_id",
                "author",
                "status",
                "progress",
                "score",
                "reasoning",
                "error",
                "created_at",
                "completed_at",
            ],
            &[
                &record.id,
                &record.repo,
                &record.issue_number,
                &record.comment_id,
                &record.author,
                &record.status.as_str(),
                &record.progress,
                &record.score,
                &record.reasoning,
                &record.error,
                &record.created_at,
                &record.completed_at,
            ],
        )
    }

    const SCORE_COLUMNS: &'static str = "id, repo, issue_number, comment_id, author, status, \
         progress, score, reasoning, error, created_at, completed_at";

    fn score_from_row(row: &rusqlite::Row) -> rusqlite::Result<(ScoreRecord, String)> {
        let status: String = row.get(5)?;
        Ok((
            ScoreRecord {
                id: row.get(0)?,
                repo: row.get(1)?,
                issue_number: row.get(2)?,
                comment_id: row.get(3)?,
                author: row.get(4)?,
                status: RecordStatus::Pending,
                progress: row.get(6)?,
                score: row.get(7)?,
                reasoning: row.get(8)?,
                error: row.get(9)?,
                created_at: row.get(10)?,
                completed_at: row.get(11)?,
            },
            status,
        ))
    }

    pub fn get_score(&self, id: &str) -> Result<Option<ScoreRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM score_records WHERE id = ?1",
                Self::SCORE_COLUMNS
            ),
            rusqlite::params![id],
            Self::score_from_row,
        );
        Self::one(result, |(mut record, status)| {
            record.status = RecordStatus::parse(&status)?;
            Ok(record)
        })
    }

    pub fn list_scores(&self, filter: &ListFilter) -> Result<Vec<ScoreRecord>> {
        let sql = Self::list_sql(
            "score_records",
            Self::SCORE_COLUMNS,
            RecordKind::Score.repo_column(),
            filter,
        );
        let status_str = filter.status.map(|s| s.as_str());
        let limit = filter.limit.unwrap_or(50) as i64;
        let params = Self::filter_params(filter, &status_str, &limit);

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&sql).context("Failed to prepare score list")?;
        let rows = stmt
            .query_map(params.as_slice(), Self::score_from_row)
            .context("Failed to query score records")?;

        let mut result = Vec::new();
        for row in rows {
            let (mut record, status) = row.context("Failed to read score record")?;
            record.status = RecordStatus::parse(&status)?;
            result.push(record);
        }
        Ok(result)
    }

    // --- comment sync records ---

    pub fn insert_comment_sync(&self, record: &CommentSyncRecord) -> Result<bool> {
        self.insert(
            "comment_sync_records",
            &[
                "id",
                "source_repo",
                "source_number",
                "comment_id",
                "target_repo",
                "target_number",
                "status",
                "progress",
                "error",
                "created_at",
                "completed_at",
            ],
            &[
                &record.id,
                &record.source_repo,
                &record.source_number,
                &record.comment_id,
                &record.target_repo,
                &record.target_number,
                &record.status.as_str(),
                &record.progress,
                &record.error,
                &record.created_at,
                &record.completed_at,
            ],
        )
    }

    const SYNC_COLUMNS: &'static str = "id, source_repo, source_number, comment_id, target_repo, \
         target_number, status, progress, error, created_at, completed_at";

    fn sync_from_row(row: &rusqlite::Row) -> rusqlite::Result<(CommentSyncRecord, String)> {
        let status: String = row.get(6)?;
        Ok((
            CommentSyncRecord {
                id: row.get(0)?,
                source_repo: row.get(1)?,
                source_number: row.get(2)?,
                comment_id: row.get(3)?,
                target_repo: row.get(4)?,
                target_number: row.get(5)?,
                status: RecordStatus::Pending,
                progress: row.get(7)?,
                error: row.get(8)?,
                created_at: row.get(9)?,
                completed_at: row.get(10)?,
            },
            status,
        ))
    }

    pub fn get_comment_sync(&self, id: &str) -> Result<Option<CommentSyncRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM comment_sync_records WHERE id = ?1",
                Self::SYNC_COLUMNS
            ),
            rusqlite::params![id],
            Self::sync_from_row,
        );
        Self::one(result, |(mut record, status)| {
            record.status = RecordStatus::parse(&status)?;
            Ok(record)
        })
    }

    pub fn list_comment_syncs(&self, filter: &ListFilter) -> Result<Vec<CommentSyncRecord>> {
        let sql = Self::list_sql(
            "comment_sync_records",
            Self::SYNC_COLUMNS,
            RecordKind::CommentSync.repo_column(),
            filter,
        );
        let status_str = filter.status.map(|s| s.as_str());
        let limit = filter.limit.unwrap_or(50) as i64;
        let params = Self::filter_params(filter, &status_str, &limit);

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&sql).context("Failed to prepare sync list")?;
        let rows = stmt
            .query_map(params.as_slice(), Self::sync_from_row)
            .context("Failed to query comment sync records")?;

        let mut result = Vec::new();
        for row in rows {
            let (mut record, status) = row.context("Failed to read comment sync record")?;
            record.status = RecordStatus::parse(&status)?;
            result.push(record);
        }
        Ok(result)
    }

    // --- webhook event audit ---

    pub fn insert_webhook_event(&self, event: &WebhookEventRecord) -> Result<bool> {
        self.insert(
            "webhook_events",
            &[
                "id",
                "event_type",
                "action",
                "delivery_id",
                "sender",
                "repo",
                "entity_number",
                "coordinators",
                "outcome",
                "error",
                "created_at",
            ],
            &[
                &event.id,
                &event.event_type,
                &event.action,
                &event.delivery_id,
                &event.sender,
                &event.repo,
                &event.entity_number,
                &event.coordinators,
                &event.outcome,
                &event.error,
                &event.created_at,
            ],
        )
    }

    const EVENT_COLUMNS: &'static str = "id, event_type, action, delivery_id, sender, repo, \
         entity_number, coordinators, outcome, error, created_at";

    fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<WebhookEventRecord> {
        Ok(WebhookEventRecord {
            id: row.get(0)?,
            event_type: row.get(1)?,
            action: row.get(2)?,
            delivery_id: row.get(3)?,
            sender: row.get(4)?,
            repo: row.get(5)?,
            entity_number: row.get(6)?,
            coordinators: row.get(7)?,
            outcome: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    pub fn get_webhook_event(&self, id: &str) -> Result<Option<WebhookEventRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM webhook_events WHERE id = ?1",
                Self::EVENT_COLUMNS
            ),
            rusqlite::params![id],
            Self::event_from_row,
        );
        Self::one(result, Ok)
    }

    pub fn list_webhook_events(&self, filter: &ListFilter) -> Result<Vec<WebhookEventRecord>> {
        let mut sql = format!(
            "SELECT {} FROM webhook_events WHERE 1=1",
            Self::EVENT_COLUMNS
        );
        if filter.repo.is_some() {
            sql.push_str(" AND repo = :repo");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT :limit");

        let limit = filter.limit.unwrap_or(50) as i64;
        let mut params: Vec<(&'static str, &dyn ToSql)> = Vec::new();
        if let Some(repo) = &filter.repo {
            params.push((":repo", repo));
        }
        params.push((":limit", &limit));

        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare(&sql).context("Failed to prepare event list")?;
        let rows = stmt
            .query_map(params.as_slice(), Self::event_from_row)
            .context("Failed to query webhook events")?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read webhook event")?);
        }
        Ok(result)
    }

    /// Run arbitrary SQL against the store, for tests that need to break it.
    #[cfg(test)]
    pub(crate) fn exec_raw(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(sql).context("Failed to run raw SQL")
    }

    fn one<T, U>(
        result: rusqlite::Result<T>,
        convert: impl FnOnce(T) -> Result<U>,
    ) -> Result<Option<U>> {
        match result {
            Ok(value) => Ok(Some(convert(value)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to fetch row"),
        }
    }
}
