//! Pull request review coordinator.
//!
//! Every qualifying pull request event gets a fresh review task: reviews
//! accumulate as history rather than deduplicate, since reviewing the same
//! head twice wastes tokens but damages nothing. The event-layer action
//! filter is the only dedup here.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ToSql;
use tracing::info;
use uuid::Uuid;

use octorelay_core::{
    format_review_comment, is_bot_output, parse_review_response, review_system_prompt,
    review_user_prompt,
};

use crate::claim::{ClaimGuard, FinalOutcome};
use crate::coordinators::{Coordinator, CoordinatorOutcome, EventEnvelope};
use crate::db::{now_ts, SqliteDb};
use crate::github::IssueHost;
use crate::llm::TextEngine;
use crate::records::{RecordKind, RecordStatus, ReviewTask};
use crate::tasks::TaskRunner;

const REVIEWED_ACTIONS: &[&str] = &["opened", "synchronize", "ready_for_review"];

pub struct ReviewCoordinator {
    db: Arc<SqliteDb>,
    host: Arc<dyn IssueHost>,
    engine: Arc<dyn TextEngine>,
    guard: ClaimGuard,
    runner: TaskRunner,
    model: String,
}

impl ReviewCoordinator {
    pub fn new(
        db: Arc<SqliteDb>,
        host: Arc<dyn IssueHost>,
        engine: Arc<dyn TextEngine>,
        guard: ClaimGuard,
        runner: TaskRunner,
        model: String,
    ) -> Self {
        Self {
            db,
            host,
            engine,
            guard,
            runner,
            model,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn review_pull(
        db: Arc<SqliteDb>,
        host: Arc<dyn IssueHost>,
        engine: Arc<dyn TextEngine>,
        guard: ClaimGuard,
        record_id: String,
        installation_id: u64,
        repo: String,
        pr_number: u64,
        head_sha: String,
    ) -> anyhow::Result<()> {
        guard.checkpoint(RecordKind::Review, &record_id, "fetching diff")?;
        let files = host
            .list_pull_files(installation_id, &repo, pr_number)
            .await?;
        let diffs: Vec<(String, String)> = files
            .into_iter()
            .filter_map(|f| f.patch.map(|patch| (f.filename, patch)))
            .collect();

        if diffs.is_empty() {
            // Binary-only or empty change: nothing a text review can say.
            db.update_row(
                RecordKind::Review.table(),
                &record_id,
                &[
                    ("substantive", &false as &dyn ToSql),
                    ("summary", &"No reviewable text changes" as &dyn ToSql),
                    ("progress", &"done" as &dyn ToSql),
                ],
            )?;
            guard.finalize(RecordKind::Review, &record_id, FinalOutcome::Completed)?;
            return Ok(());
        }

        guard.checkpoint(RecordKind::Review, &record_id, "generating review")?;
        let content = engine
            .generate(&review_system_prompt(), &review_user_prompt(&diffs))
            .await?;
        let review = parse_review_response(&content)?;

        guard.checkpoint(RecordKind::Review, &record_id, "posting review comment")?;
        let comment =
            format_review_comment(&review, &head_sha, octorelay_core::service_version());
        host.post_comment(installation_id, &repo, pr_number, &comment)
            .await?;

        db.update_row(
            RecordKind::Review.table(),
            &record_id,
            &[
                ("substantive", &review.substantive_comments as &dyn ToSql),
                ("summary", &review.summary as &dyn ToSql),
                ("progress", &"done" as &dyn ToSql),
            ],
        )?;
        guard.finalize(RecordKind::Review, &record_id, FinalOutcome::Completed)?;

        info!(repo, pr_number, head_sha, "Posted pull request review");
        Ok(())
    }
}

#[async_trait]
impl Coordinator for ReviewCoordinator {
    fn name(&self) -> &'static str {
        "review"
    }

    async fn handle(&self, event: Arc<EventEnvelope>) -> CoordinatorOutcome {
        let payload = &event.payload;
        let action = payload.action.as_deref().unwrap_or("");
        if !REVIEWED_ACTIONS.contains(&action) {
            return CoordinatorOutcome::skipped("action not handled");
        }
        let Some(repository) = &payload.repository else {
            return CoordinatorOutcome::skipped("payload missing repository");
        };
        let Some(pull_request) = &payload.pull_request else {
            return CoordinatorOutcome::skipped("payload missing pull request");
        };
        let Some(installation) = &payload.installation else {
            return CoordinatorOutcome::skipped("no app installation");
        };
        if is_bot_output(pull_request.body.as_deref().unwrap_or("")) {
            return CoordinatorOutcome::skipped("pull request is our own output");
        }

        let task = ReviewTask {
            id: Uuid::new_v4().to_string(),
            repo: repository.full_name.clone(),
            pr_number: pull_request.number,
            head_sha: pull_request.head.sha.clone(),
            model: self.model.clone(),
            status: RecordStatus::Pending,
            progress: None,
            substantive: None,
            summary: None,
            error: None,
            created_at: now_ts(),
            completed_at: None,
        };

        match self.db.insert_review(&task) {
            Ok(true) => {}
            // The primary key is a fresh UUID; a rejection here is a bug.
            Ok(false) => {
                return CoordinatorOutcome::Failed {
                    error: "review task id collision".to_string(),
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
            RecordKind::Review,
            task.id.clone(),
            "review",
            Self::review_pull(
                self.db.clone(),
                self.host.clone(),
                self.engine.clone(),
                self.guard.clone(),
                task.id.clone(),
                installation.id,
                task.repo.clone(),
                task.pr_number,
                task.head_sha.clone(),
            ),
        );

        CoordinatorOutcome::Accepted {
            record_id: Some(task.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::DEFAULT_STALENESS_WINDOW;
    use crate::coordinators::test_support::{pr_event, FakeEngine, FakeHost};
    use octorelay_core::is_bot_output;

    fn coordinator_with(
        host: Arc<FakeHost>,
        engine: Arc<FakeEngine>,
    ) -> (ReviewCoordinator, Arc<SqliteDb>, TaskRunner) {
        let db = Arc::new(SqliteDb::new_in_memory().unwrap());
        let guard = ClaimGuard::new(db.clone(), DEFAULT_STALENESS_WINDOW);
        let runner = TaskRunner::new(4);
        let coordinator = ReviewCoordinator::new(
            db.clone(),
            host,
            engine,
            guard,
            runner.clone(),
            "gpt-4o".to_string(),
        );
        (coordinator, db, runner)
    }

    #[tokio::test]
    async fn test_review_posts_branded_comment() {
        let host = Arc::new(FakeHost::default());
        let engine = Arc::new(FakeEngine::returning(
            r#"{"substantiveComments": true, "summary": "Lock held across await"}"#,
        ));
        let (coordinator, db, runner) = coordinator_with(host.clone(), engine);

        let outcome = coordinator
            .handle(pr_event("opened", "acme/public", 12, "abc123"))
            .await;
        let record_id = match outcome {
            CoordinatorOutcome::Accepted {
                record_id: Some(id),
            } => id,
            other => panic!("expected accepted, got {:?}", other),
        };
        runner.wait_idle().await;

        let task = db.get_review(&record_id).unwrap().unwrap();
        assert_eq!(task.status, RecordStatus::Completed);
        assert_eq!(task.substantive, Some(true));
        assert_eq!(task.summary.as_deref(), Some("Lock held across await"));

        let posted = host.posted_comments.lock().unwrap();
        assert_eq!(posted.len(), 1);
        let (repo, number, body) = &posted[0];
        assert_eq!(repo, "acme/public");
        assert_eq!(*number, 12);
        assert!(body.contains("Lock held across await"));
        assert!(body.contains("abc123"));
        assert!(is_bot_output(body));
    }

    #[tokio::test]
    async fn test_each_push_gets_its_own_task() {
        let host = Arc::new(FakeHost::default());
        let engine = Arc::new(FakeEngine::returning(
            r#"{"substantiveComments": false, "summary": "Fine"}"#,
        ));
        let (coordinator, db, runner) = coordinator_with(host, engine);

        coordinator
            .handle(pr_event("opened", "acme/public", 12, "abc123"))
            .await;
        coordinator
            .handle(pr_event("synchronize", "acme/public", 12, "def456"))
            .await;
        runner.wait_idle().await;

        assert_eq!(db.count(RecordKind::Review).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_closed_action_is_skipped() {
        let host = Arc::new(FakeHost::default());
        let engine = Arc::new(FakeEngine::failing());
        let (coordinator, db, _runner) = coordinator_with(host, engine);

        let outcome = coordinator
            .handle(pr_event("closed", "acme/public", 12, "abc123"))
            .await;
        assert_eq!(outcome, CoordinatorOutcome::skipped("action not handled"));
        assert_eq!(db.count(RecordKind::Review).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_finalizes_failed() {
        let host = Arc::new(FakeHost::default());
        let engine = Arc::new(FakeEngine::failing());
        let (coordinator, db, runner) = coordinator_with(host.clone(), engine);

        let outcome = coordinator
            .handle(pr_event("opened", "acme/public", 3, "abc123"))
            .await;
        let record_id = match outcome {
            CoordinatorOutcome::Accepted {
                record_id: Some(id),
            } => id,
            other => panic!("expected accepted, got {:?}", other),
        };
        runner.wait_idle().await;

        let task = db.get_review(&record_id).unwrap().unwrap();
        assert_eq!(task.status, RecordStatus::Failed);
        assert!(task.error.unwrap().contains("engine timeout"));
        assert!(host.posted_comments.lock().unwrap().is_empty());
    }
}
