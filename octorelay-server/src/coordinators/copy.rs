//! Issue copy coordinator.
//!
//! Mirrors newly opened issues from configured source repositories into
//! their target repository. This is the one coordinator that must be
//! strictly exactly-once: creating the same issue twice in the target is
//! visible damage, so every event goes through the claim protocol keyed on
//! (source repo, source number, target repo).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ToSql;
use tracing::info;
use uuid::Uuid;

use octorelay_core::{brand, is_bot_output};

use crate::claim::{ClaimGuard, ClaimOutcome, FinalOutcome};
use crate::coordinators::{Coordinator, CoordinatorOutcome, EventEnvelope};
use crate::db::{now_ts, SqliteDb};
use crate::github::IssueHost;
use crate::records::{CopyRecord, RecordKind, RecordStatus};
use crate::tasks::TaskRunner;

pub struct CopyCoordinator {
    db: Arc<SqliteDb>,
    host: Arc<dyn IssueHost>,
    guard: ClaimGuard,
    runner: TaskRunner,
    /// source repo (owner/name) -> target repo (owner/name)
    targets: HashMap<String, String>,
}

impl CopyCoordinator {
    pub fn new(
        db: Arc<SqliteDb>,
        host: Arc<dyn IssueHost>,
        guard: ClaimGuard,
        runner: TaskRunner,
        targets: HashMap<String, String>,
    ) -> Self {
        Self {
            db,
            host,
            guard,
            runner,
            targets,
        }
    }

    async fn copy_issue(
        db: Arc<SqliteDb>,
        host: Arc<dyn IssueHost>,
        guard: ClaimGuard,
        record_id: String,
        installation_id: u64,
        source_repo: String,
        source_number: u64,
        target_repo: String,
    ) -> anyhow::Result<()> {
        guard.checkpoint(RecordKind::Copy, &record_id, "fetching source issue")?;
        let issue = host
            .get_issue(installation_id, &source_repo, source_number)
            .await?;

        guard.checkpoint(RecordKind::Copy, &record_id, "creating target issue")?;
        let body = brand(&format!(
            "{}\n\n---\nCopied from {}#{} ({})",
            issue.body.as_deref().unwrap_or("(no description)"),
            source_repo,
            source_number,
            issue.html_url,
        ));
        let target_number = host
            .create_issue(installation_id, &target_repo, &issue.title, &body)
            .await?;

        db.update_row(
            RecordKind::Copy.table(),
            &record_id,
            &[
                ("target_number", &target_number as &dyn ToSql),
                ("progress", &"done" as &dyn ToSql),
            ],
        )?;
        guard.finalize(RecordKind::Copy, &record_id, FinalOutcome::Completed)?;

        info!(
            source_repo,
            source_number, target_repo, target_number, "Copied issue"
        );
        Ok(())
    }
}

#[async_trait]
impl Coordinator for CopyCoordinator {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn handle(&self, event: Arc<EventEnvelope>) -> CoordinatorOutcome {
        let payload = &event.payload;
        if payload.action.as_deref() != Some("opened") {
            return CoordinatorOutcome::skipped("action not handled");
        }
        let Some(repository) = &payload.repository else {
            return CoordinatorOutcome::skipped("payload missing repository");
        };
        let Some(issue) = &payload.issue else {
            return CoordinatorOutcome::skipped("payload missing issue");
        };
        let Some(installation) = &payload.installation else {
            return CoordinatorOutcome::skipped("no app installation");
        };
        if issue.pull_request.is_some() {
            return CoordinatorOutcome::skipped("entity is a pull request");
        }
        if is_bot_output(issue.body.as_deref().unwrap_or("")) {
            return CoordinatorOutcome::skipped("issue is our own output");
        }

        let source_repo = repository.full_name.clone();
        let Some(target_repo) = self.targets.get(&source_repo).cloned() else {
            return CoordinatorOutcome::skipped("no copy target configured");
        };
        let source_number = issue.number;

        let record = CopyRecord {
            id: Uuid::new_v4().to_string(),
            source_repo: source_repo.clone(),
            source_number,
            target_repo: target_repo.clone(),
            title: issue.title.clone().unwrap_or_default(),
            status: RecordStatus::Pending,
            progress: None,
            target_number: None,
            error: None,
            created_at: now_ts(),
            completed_at: None,
        };

        let key: [(&str, &dyn ToSql); 3] = [
            ("source_repo", &source_repo),
            ("source_number", &source_number),
            ("target_repo", &target_repo),
        ];
        let db = self.db.clone();
        let record_for_insert = record.clone();
        let claimed = self.guard.claim(RecordKind::Copy, &key, &record.id, move || {
            db.insert_copy(&record_for_insert)
        });

        let (record_id, reclaimed) = match claimed {
            Ok(ClaimOutcome::Claimed {
                record_id,
                reclaimed,
            }) => (record_id, reclaimed),
            Ok(ClaimOutcome::AlreadyDone { record_id }) => {
                return CoordinatorOutcome::skipped(format!("already copied ({})", record_id));
            }
            Ok(ClaimOutcome::InProgress) => {
                return CoordinatorOutcome::skipped("copy already in progress");
            }
            Ok(ClaimOutcome::Duplicate) => {
                return CoordinatorOutcome::skipped("duplicate delivery");
            }
            Err(e) => {
                return CoordinatorOutcome::Failed {
                    error: format!("{:#}", e),
                };
            }
        };

        if reclaimed {
            info!(record_id, source_repo, source_number, "Retrying abandoned copy");
        }

        self.runner.spawn_finalizing(
            self.guard.clone(),
            RecordKind::Copy,
            record_id.clone(),
            "copy",
            Self::copy_issue(
                self.db.clone(),
                self.host.clone(),
                self.guard.clone(),
                record_id.clone(),
                installation.id,
                source_repo,
                source_number,
                target_repo,
            ),
        );

        CoordinatorOutcome::Accepted {
            record_id: Some(record_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::DEFAULT_STALENESS_WINDOW;
    use crate::coordinators::test_support::{issue_event, FakeHost};
    use octorelay_core::BOT_MARKER;
    use std::sync::atomic::Ordering;

    fn coordinator_with(host: Arc<FakeHost>) -> (CopyCoordinator, Arc<SqliteDb>, TaskRunner) {
        let db = Arc::new(SqliteDb::new_in_memory().unwrap());
        let guard = ClaimGuard::new(db.clone(), DEFAULT_STALENESS_WINDOW);
        let runner = TaskRunner::new(4);
        let mut targets = HashMap::new();
        targets.insert("acme/public".to_string(), "acme/internal".to_string());
        let coordinator = CopyCoordinator::new(
            db.clone(),
            host,
            guard,
            runner.clone(),
            targets,
        );
        (coordinator, db, runner)
    }

    #[tokio::test]
    async fn test_opened_issue_is_copied_once() {
        let host = Arc::new(FakeHost::default());
        let (coordinator, db, runner) = coordinator_with(host.clone());

        let event = issue_event("opened", "acme/public", 42, "please fix");
        let outcome = coordinator.handle(event.clone()).await;
        let record_id = match outcome {
            CoordinatorOutcome::Accepted {
                record_id: Some(id),
            } => id,
            other => panic!("expected accepted, got {:?}", other),
        };
        runner.wait_idle().await;

        let record = db.get_copy(&record_id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.target_number, Some(101));
        assert_eq!(record.target_repo, "acme/internal");
        assert_eq!(host.created_issues.load(Ordering::SeqCst), 1);

        // Redelivery of the same event must not create a second issue.
        let outcome = coordinator.handle(event).await;
        assert!(matches!(outcome, CoordinatorOutcome::Skipped { .. }));
        assert_eq!(host.created_issues.load(Ordering::SeqCst), 1);
        assert_eq!(db.count(RecordKind::Copy).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_repository_is_skipped() {
        let host = Arc::new(FakeHost::default());
        let (coordinator, db, _runner) = coordinator_with(host.clone());

        let outcome = coordinator
            .handle(issue_event("opened", "acme/unmapped", 1, "hello"))
            .await;
        assert_eq!(
            outcome,
            CoordinatorOutcome::skipped("no copy target configured")
        );
        assert_eq!(db.count(RecordKind::Copy).unwrap(), 0);
        assert_eq!(host.created_issues.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_opened_action_is_skipped() {
        let host = Arc::new(FakeHost::default());
        let (coordinator, db, _runner) = coordinator_with(host);

        let outcome = coordinator
            .handle(issue_event("edited", "acme/public", 1, "hello"))
            .await;
        assert_eq!(outcome, CoordinatorOutcome::skipped("action not handled"));
        assert_eq!(db.count(RecordKind::Copy).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_own_output_is_not_copied_back() {
        let host = Arc::new(FakeHost::default());
        let (coordinator, db, _runner) = coordinator_with(host.clone());

        let body = format!("mirrored body\n\n{}", BOT_MARKER);
        let outcome = coordinator
            .handle(issue_event("opened", "acme/public", 7, &body))
            .await;
        assert_eq!(
            outcome,
            CoordinatorOutcome::skipped("issue is our own output")
        );
        assert_eq!(db.count(RecordKind::Copy).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_copy_records_error() {
        let host = Arc::new(FakeHost {
            fail_create: true,
            ..Default::default()
        });
        let (coordinator, db, runner) = coordinator_with(host);

        let outcome = coordinator
            .handle(issue_event("opened", "acme/public", 9, "hello"))
            .await;
        let record_id = match outcome {
            CoordinatorOutcome::Accepted {
                record_id: Some(id),
            } => id,
            other => panic!("expected accepted, got {:?}", other),
        };
        runner.wait_idle().await;

        let record = db.get_copy(&record_id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(record.error.unwrap().contains("host unavailable"));

        // The failed row keeps its key occupied; a redelivery cannot retry.
        let outcome = coordinator
            .handle(issue_event("opened", "acme/public", 9, "hello"))
            .await;
        assert!(matches!(outcome, CoordinatorOutcome::Skipped { .. }));
        assert_eq!(db.count(RecordKind::Copy).unwrap(), 1);
    }
}
