//! Claim/finalize protocol: at-least-once triggers, at-most-once execution.
//!
//! Built on nothing but the store's constraint-based conflict signaling.
//! The pre-checks (already done, in progress) are short-circuit
//! optimizations; correctness rests solely on the insert's uniqueness
//! constraint, which is the only step that is transactionally safe when the
//! database file is shared with other processes. Within one process the
//! store's connection mutex keeps the check-then-insert sequence from
//! interleaving with another thread's write.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use tracing::{info, warn};

use crate::db::{now_ts, SqliteDb};
use crate::records::{RecordKind, RecordStatus};

/// Default age after which a live claim is considered abandoned.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(30);

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller now exclusively owns execution for this logical key and must
    /// finalize exactly once. `reclaimed` is set when a stale live row was
    /// taken over rather than a fresh row inserted.
    Claimed { record_id: String, reclaimed: bool },
    /// A prior run already completed this unit of work. An idempotent
    /// no-op for callers, not an error.
    AlreadyDone { record_id: String },
    /// Another owner is working on this key right now.
    InProgress,
    /// Another caller has, or had, ownership of this key.
    Duplicate,
}

/// Terminal outcome closing a claim.
#[derive(Debug, Clone)]
pub enum FinalOutcome {
    Completed,
    Failed(String),
}

/// Converts maybe-duplicate triggers into exclusive ownership of a logical
/// key, using only the store.
#[derive(Clone)]
pub struct ClaimGuard {
    db: Arc<SqliteDb>,
    staleness_window: Duration,
}

impl ClaimGuard {
    pub fn new(db: Arc<SqliteDb>, staleness_window: Duration) -> Self {
        Self {
            db,
            staleness_window,
        }
    }

    /// Attempt to claim the unit of work identified by `key`.
    ///
    /// `insert_pending` runs only when no prior row short-circuits the
    /// attempt; it must insert a `pending` row carrying `record_id` and the
    /// logical key, and report a constraint rejection as `Ok(false)`.
    ///
    /// A prior `failed` row blocks re-claiming permanently: the composite
    /// index spans all statuses, so the insert is rejected. Known-bad units
    /// of work are not retried automatically.
    pub fn claim(
        &self,
        kind: RecordKind,
        key: &[(&str, &dyn ToSql)],
        record_id: &str,
        insert_pending: impl FnOnce() -> Result<bool>,
    ) -> Result<ClaimOutcome> {
        let rows = self.db.find_claims(kind, key)?;

        if let Some(done) = rows
            .iter()
            .find(|row| row.status == RecordStatus::Completed)
        {
            return Ok(ClaimOutcome::AlreadyDone {
                record_id: done.id.clone(),
            });
        }

        if let Some(live) = rows.iter().find(|row| row.status.is_live()) {
            if !self.is_stale(&live.created_at) {
                return Ok(ClaimOutcome::InProgress);
            }

            // Abandoned by a dead or wedged worker: take the row over in
            // place. A fresh insert would hit the uniqueness constraint.
            let taken =
                self.db
                    .take_over_stale(kind, &live.id, &live.created_at, &now_ts())?;
            if taken {
                warn!(
                    record_id = %live.id,
                    table = kind.table(),
                    "Reclaimed stale claim record"
                );
                return Ok(ClaimOutcome::Claimed {
                    record_id: live.id.clone(),
                    reclaimed: true,
                });
            }
            // Someone else won the takeover race.
            return Ok(ClaimOutcome::Duplicate);
        }

        if insert_pending()? {
            Ok(ClaimOutcome::Claimed {
                record_id: record_id.to_string(),
                reclaimed: false,
            })
        } else {
            Ok(ClaimOutcome::Duplicate)
        }
    }

    /// Close a claim. Must be called exactly once per successful claim,
    /// on every path out of the owning worker.
    pub fn finalize(&self, kind: RecordKind, record_id: &str, outcome: FinalOutcome) -> Result<bool> {
        let completed_at = now_ts();
        let matched = match &outcome {
            FinalOutcome::Completed => self.db.update_row(
                kind.table(),
                record_id,
                &[
                    ("status", &RecordStatus::Completed.as_str() as &dyn ToSql),
                    ("completed_at", &completed_at as &dyn ToSql),
                ],
            )?,
            FinalOutcome::Failed(message) => self.db.update_row(
                kind.table(),
                record_id,
                &[
                    ("status", &RecordStatus::Failed.as_str() as &dyn ToSql),
                    ("error", &message as &dyn ToSql),
                    ("completed_at", &completed_at as &dyn ToSql),
                ],
            )?,
        };

        if matched {
            info!(record_id, table = kind.table(), outcome = ?outcome, "Finalized claim");
        } else {
            warn!(record_id, table = kind.table(), "Finalize matched no row");
        }

        Ok(matched)
    }

    /// Move a claimed record into `processing`, with an optional checkpoint
    /// label. Checkpoints are cosmetic, for observability only.
    pub fn checkpoint(&self, kind: RecordKind, record_id: &str, progress: &str) -> Result<bool> {
        self.db.update_row(
            kind.table(),
            record_id,
            &[
                ("status", &RecordStatus::Processing.as_str() as &dyn ToSql),
                ("progress", &progress as &dyn ToSql),
            ],
        )
    }

    fn is_stale(&self, created_at: &str) -> bool {
        let Ok(created) = DateTime::parse_from_rfc3339(created_at) else {
            // Unparseable timestamps never block progress forever.
            return true;
        };
        let age = Utc::now().signed_duration_since(created.with_timezone(&Utc));
        age.to_std()
            .map(|age| age >= self.staleness_window)
            .unwrap_or(false)
    }
}
