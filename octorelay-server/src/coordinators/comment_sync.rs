//! Comment relay coordinator.
//!
//! When someone comments on an issue that has completed copies, the comment
//! is relayed onto each copy. Relayed comments carry the bot marker, and the
//! marker check here is what breaks the loop: a relayed comment arriving as
//! a fresh event must never be relayed again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use octorelay_core::{format_sync_comment, is_bot_output};

use crate::claim::{ClaimGuard, FinalOutcome};
use crate::coordinators::{Coordinator, CoordinatorOutcome, EventEnvelope};
use crate::db::{now_ts, SqliteDb};
use crate::github::IssueHost;
use crate::records::{CommentSyncRecord, RecordKind, RecordStatus};
use crate::tasks::TaskRunner;

pub struct CommentSyncCoordinator {
    db: Arc<SqliteDb>,
    host: Arc<dyn IssueHost>,
    guard: ClaimGuard,
    runner: TaskRunner,
}

impl CommentSyncCoordinator {
    pub fn new(
        db: Arc<SqliteDb>,
        host: Arc<dyn IssueHost>,
        guard: ClaimGuard,
        runner: TaskRunner,
    ) -> Self {
        Self {
            db,
            host,
            guard,
            runner,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_comment(
        host: Arc<dyn IssueHost>,
        guard: ClaimGuard,
        record_id: String,
        installation_id: u64,
        target_repo: String,
        target_number: u64,
        author: String,
        source_repo: String,
        source_number: u64,
        body: String,
    ) -> anyhow::Result<()> {
        guard.checkpoint(RecordKind::CommentSync, &record_id, "posting relayed comment")?;
        let comment = format_sync_comment(&author, &source_repo, source_number, &body);
        host.post_comment(installation_id, &target_repo, target_number, &comment)
            .await?;
        guard.finalize(RecordKind::CommentSync, &record_id, FinalOutcome::Completed)?;

        info!(
            source_repo,
            source_number, target_repo, target_number, "Relayed comment onto copy"
        );
        Ok(())
    }
}

#[async_trait]
impl Coordinator for CommentSyncCoordinator {
    fn name(&self) -> &'static str {
        "comment_sync"
    }

    async fn handle(&self, event: Arc<EventEnvelope>) -> CoordinatorOutcome {
        let payload = &event.payload;
        if payload.action.as_deref() != Some("created") {
            return CoordinatorOutcome::skipped("action not handled");
        }
        let Some(repository) = &payload.repository else {
            return CoordinatorOutcome::skipped("payload missing repository");
        };
        let Some(issue) = &payload.issue else {
            return CoordinatorOutcome::skipped("payload missing issue");
        };
        let Some(comment) = &payload.comment else {
            return CoordinatorOutcome::skipped("payload missing comment");
        };
        let Some(installation) = &payload.installation else {
            return CoordinatorOutcome::skipped("no app installation");
        };
        if is_bot_output(&comment.body) {
            return CoordinatorOutcome::skipped("comment is our own output");
        }

        let copies = match self
            .db
            .completed_copies_of(&repository.full_name, issue.number)
        {
            Ok(copies) => copies,
            Err(e) => {
                return CoordinatorOutcome::Failed {
                    error: format!("{:#}", e),
                };
            }
        };
        if copies.is_empty() {
            return CoordinatorOutcome::skipped("issue has no completed copies");
        }

        let mut relayed = 0usize;
        for copy in &copies {
            let Some(target_number) = copy.target_number else {
                // Completed copies always carry a target number; skip the
                // malformed row rather than fail the whole event.
                continue;
            };

            let record = CommentSyncRecord {
                id: Uuid::new_v4().to_string(),
                source_repo: copy.source_repo.clone(),
                source_number: copy.source_number,
                comment_id: comment.id,
                target_repo: copy.target_repo.clone(),
                target_number,
                status: RecordStatus::Pending,
                progress: None,
                error: None,
                created_at: now_ts(),
                completed_at: None,
            };
            match self.db.insert_comment_sync(&record) {
                Ok(true) => {}
                Ok(false) => {
                    return CoordinatorOutcome::Failed {
                        error: "comment sync record id collision".to_string(),
                    };
                }
                Err(e) => {
                    return CoordinatorOutcome::Failed {
                        error: format!("{:#}", e),
                    };
                }
            }

            self.runner.spawn_finalizing(
                self.guard.clone(),
                RecordKind::CommentSync,
                record.id.clone(),
                "comment_sync",
                Self::relay_comment(
                    self.host.clone(),
                    self.guard.clone(),
                    record.id.clone(),
                    installation.id,
                    record.target_repo.clone(),
                    target_number,
                    comment.user.login.clone(),
                    record.source_repo.clone(),
                    record.source_number,
                    comment.body.clone(),
                ),
            );
            relayed += 1;
        }

        if relayed == 0 {
            return CoordinatorOutcome::skipped("no relayable copies");
        }
        CoordinatorOutcome::Accepted { record_id: None }
    }
}
