//! Comment scoring coordinator.
//!
//! Rates the signal of new issue comments and records the result. Nothing
//! is posted back, so the only self-loop risk is scoring our own relayed
//! comments; the marker check rejects those before any row is written.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ToSql;
use tracing::info;
use uuid::Uuid;

use octorelay_core::{is_bot_output, parse_score_response, score_system_prompt, score_user_prompt};

use crate::claim::{ClaimGuard, FinalOutcome};
use crate::coordinators::{Coordinator, CoordinatorOutcome, EventEnvelope};
use crate::db::{now_ts, SqliteDb};
use crate::llm::TextEngine;
use crate::records::{RecordKind, RecordStatus, ScoreRecord};
use crate::tasks::TaskRunner;

pub struct ScoreCoordinator {
    db: Arc<SqliteDb>,
    engine: Arc<dyn TextEngine>,
    guard: ClaimGuard,
    runner: TaskRunner,
}

impl ScoreCoordinator {
    pub fn new(
        db: Arc<SqliteDb>,
        engine: Arc<dyn TextEngine>,
        guard: ClaimGuard,
        runner: TaskRunner,
    ) -> Self {
        Self {
            db,
            engine,
            guard,
            runner,
        }
    }

    async fn score_comment(
        db: Arc<SqliteDb>,
        engine: Arc<dyn TextEngine>,
        guard: ClaimGuard,
        record_id: String,
        author: String,
        comment_body: String,
    ) -> anyhow::Result<()> {
        guard.checkpoint(RecordKind::Score, &record_id, "scoring comment")?;
        let content = engine
            .generate(
                &score_system_prompt(),
                &score_user_prompt(&author, &comment_body),
            )
            .await?;
        let parsed = parse_score_response(&content)?;

        db.update_row(
            RecordKind::Score.table(),
            &record_id,
            &[
                ("score", &(parsed.score as u32) as &dyn ToSql),
                ("reasoning", &parsed.reasoning as &dyn ToSql),
                ("progress", &"done" as &dyn ToSql),
            ],
        )?;
        guard.finalize(RecordKind::Score, &record_id, FinalOutcome::Completed)?;

        info!(record_id, score = parsed.score, "Scored comment");
        Ok(())
    }
}

#[async_trait]
impl Coordinator for ScoreCoordinator {
    fn name(&self) -> &'static str {
        "score"
    }

    async fn handle(&self, event: Arc<EventEnvelope>) -> CoordinatorOutcome {
        let payload = &event.payload;
        // Edits and deletions are never rescored.
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
        if is_bot_output(&comment.body) {
            return CoordinatorOutcome::skipped("comment is our own output");
        }

        let record = ScoreRecord {
            id: Uuid::new_v4().to_string(),
            repo: repository.full_name.clone(),
            issue_number: issue.number,
            comment_id: comment.id,
            author: comment.user.login.clone(),
            status: RecordStatus::Pending,
            progress: None,
            score: None,
            reasoning: None,
            error: None,
            created_at: now_ts(),
            completed_at: None,
        };

        match self.db.insert_score(&record) {
            Ok(true) => {}
            Ok(false) => {
                return CoordinatorOutcome::Failed {
                    error: "score record id collision".to_string(),
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
            RecordKind::Score,
            record.id.clone(),
            "score",
            Self::score_comment(
                self.db.clone(),
                self.engine.clone(),
                self.guard.clone(),
                record.id.clone(),
                record.author.clone(),
                comment.body.clone(),
            ),
        );

        CoordinatorOutcome::Accepted {
            record_id: Some(record.id),
        }
    }
}
