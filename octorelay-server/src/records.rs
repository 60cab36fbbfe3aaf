//! Record types persisted by the store.
//!
//! Every work record shares the same lifecycle: created `pending` by a
//! coordinator, moved to `processing` by the owning worker, then moved
//! exactly once to a terminal status (`completed` or `failed`) by that same
//! worker. Nothing else ever mutates status.

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Lifecycle status of a work record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "processing" => Ok(RecordStatus::Processing),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(anyhow!("Unknown record status: {}", other)),
        }
    }

    /// Terminal statuses are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }

    /// A live record: some worker has (or had) it in flight.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// The kinds of work record the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Copy,
    Review,
    Score,
    CommentSync,
}

impl RecordKind {
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Copy => "copy_records",
            RecordKind::Review => "review_tasks",
            RecordKind::Score => "score_records",
            RecordKind::CommentSync => "comment_sync_records",
        }
    }

    /// Column the query surface's `repo` filter applies to.
    pub fn repo_column(&self) -> &'static str {
        match self {
            RecordKind::Copy | RecordKind::CommentSync => "source_repo",
            RecordKind::Review | RecordKind::Score => "repo",
        }
    }
}

/// One issue copied from a source repository into a target repository.
///
/// The (source_repo, source_number, target_repo) tuple is unique across all
/// statuses: at most one row can ever exist for it, whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CopyRecord {
    pub id: String,
    pub source_repo: String,
    pub source_number: u64,
    pub target_repo: String,
    pub title: String,
    pub status: RecordStatus,
    pub progress: Option<String>,
    pub target_number: Option<u64>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One review run for a pull request. A fresh row is created per qualifying
/// event, so rows accumulate as review history.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewTask {
    pub id: String,
    pub repo: String,
    pub pr_number: u64,
    pub head_sha: String,
    pub model: String,
    pub status: RecordStatus,
    pub progress: Option<String>,
    pub substantive: Option<bool>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One scoring run for an issue comment. Accumulates like review tasks.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRecord {
    pub id: String,
    pub repo: String,
    pub issue_number: u64,
    pub comment_id: u64,
    pub author: String,
    pub status: RecordStatus,
    pub progress: Option<String>,
    pub score: Option<u32>,
    pub reasoning: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One comment relayed onto a copied issue. Append-only audit: a duplicate
/// re-send is cheap, so there is no uniqueness constraint here.
#[derive(Debug, Clone, Serialize)]
pub struct CommentSyncRecord {
    pub id: String,
    pub source_repo: String,
    pub source_number: u64,
    pub comment_id: u64,
    pub target_repo: String,
    pub target_number: u64,
    pub status: RecordStatus,
    pub progress: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Audit row written once per inbound webhook delivery.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub delivery_id: Option<String>,
    pub sender: Option<String>,
    pub repo: Option<String>,
    pub entity_number: Option<u64>,
    /// JSON array of per-coordinator results.
    pub coordinators: String,
    pub outcome: String,
    pub error: Option<String>,
    pub created_at: String,
}
