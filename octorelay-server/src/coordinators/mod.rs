//! Domain coordinators.
//!
//! Each coordinator owns one entity's lifecycle. The router fans an event
//! out to every interested coordinator; a coordinator validates the payload,
//! decides whether to claim a unit of work, schedules the slow part on the
//! task runner, and answers immediately. Validation problems are `Skipped`
//! outcomes, never errors: a malformed payload must not look like a fault.

pub mod comment_sync;
pub mod copy;
pub mod review;
pub mod score;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub use comment_sync::CommentSyncCoordinator;
pub use copy::CopyCoordinator;
pub use review::ReviewCoordinator;
pub use score::ScoreCoordinator;

/// Event body as coordinators see it. Transport metadata (delivery id and
/// friends) stays in the router; this is the re-serialized payload plus the
/// event type header.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_type: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EventPayload {
    pub action: Option<String>,
    pub repository: Option<Repository>,
    pub issue: Option<Issue>,
    pub pull_request: Option<PullRequest>,
    pub comment: Option<Comment>,
    pub sender: Option<User>,
    pub installation: Option<Installation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: Option<String>,
    pub body: Option<String>,
    /// Present when the "issue" is actually a pull request.
    pub pull_request: Option<PullRequestLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestLink {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: u64,
}

/// What a coordinator did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorOutcome {
    /// Work was claimed and scheduled; the response does not wait for it.
    Accepted { record_id: Option<String> },
    /// Nothing to do: not interested, duplicate, or unusable payload.
    Skipped { reason: String },
    /// The coordinator itself failed.
    Failed { error: String },
}

impl CoordinatorOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        CoordinatorOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CoordinatorOutcome::Accepted { .. } => "accepted",
            CoordinatorOutcome::Skipped { .. } => "skipped",
            CoordinatorOutcome::Failed { .. } => "failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            CoordinatorOutcome::Accepted { record_id } => record_id.as_deref(),
            CoordinatorOutcome::Skipped { reason } => Some(reason),
            CoordinatorOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CoordinatorOutcome::Failed { .. })
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: Arc<EventEnvelope>) -> CoordinatorOutcome;
}
