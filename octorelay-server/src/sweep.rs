//! Retention sweep.
//!
//! Terminal work records and audit rows older than the configured retention
//! are deleted once an hour. Live rows are never touched: a pending or
//! processing row, however old, still belongs to the claim protocol.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::{error, info};

use crate::db::SqliteDb;
use crate::records::RecordKind;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

const SWEPT_KINDS: [RecordKind; 4] = [
    RecordKind::Copy,
    RecordKind::Review,
    RecordKind::Score,
    RecordKind::CommentSync,
];

/// One sweep pass: delete everything terminal older than `cutoff`.
pub fn sweep_once(db: &SqliteDb, cutoff: &str) -> Result<usize> {
    let mut deleted = 0;
    for kind in SWEPT_KINDS {
        deleted += db.sweep_terminal_before(kind.table(), cutoff)?;
    }
    deleted += db.sweep_events_before(cutoff)?;
    Ok(deleted)
}

/// Hourly retention loop. Runs for the life of the process; a failed pass
/// is logged and retried on the next tick.
pub async fn retention_loop(db: Arc<SqliteDb>, retention: Duration) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;

        let age = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = (Utc::now() - age).to_rfc3339_opts(SecondsFormat::Micros, true);
        match sweep_once(&db, &cutoff) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, cutoff, "Retention sweep deleted old records"),
            Err(e) => error!("Retention sweep failed: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_ts;
    use crate::records::{CopyRecord, RecordStatus, WebhookEventRecord};
    use uuid::Uuid;

    fn copy_row(db: &SqliteDb, number: u64, status: RecordStatus, created_at: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let record = CopyRecord {
            id: id.clone(),
            source_repo: "acme/src".to_string(),
            source_number: number,
            target_repo: "acme/dst".to_string(),
            title: "t".to_string(),
            status,
            progress: None,
            target_number: None,
            error: None,
            created_at: created_at.to_string(),
            completed_at: None,
        };
        assert!(db.insert_copy(&record).unwrap());
        id
    }

    #[test]
    fn test_sweep_deletes_only_old_terminal_rows() {
        let db = SqliteDb::new_in_memory().unwrap();
        let old = "2020-01-01T00:00:00.000000Z";

        copy_row(&db, 1, RecordStatus::Completed, old);
        copy_row(&db, 2, RecordStatus::Failed, old);
        let old_live = copy_row(&db, 3, RecordStatus::Processing, old);
        let recent = copy_row(&db, 4, RecordStatus::Completed, &now_ts());

        let deleted = sweep_once(&db, "2021-01-01T00:00:00.000000Z").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.count(RecordKind::Copy).unwrap(), 2);
        assert!(db.get_copy(&old_live).unwrap().is_some());
        assert!(db.get_copy(&recent).unwrap().is_some());
    }

    #[test]
    fn test_sweep_deletes_old_audit_rows() {
        let db = SqliteDb::new_in_memory().unwrap();
        let event = WebhookEventRecord {
            id: Uuid::new_v4().to_string(),
            event_type: "issues".to_string(),
            action: Some("opened".to_string()),
            delivery_id: None,
            sender: None,
            repo: None,
            entity_number: None,
            coordinators: "[]".to_string(),
            outcome: "ignored".to_string(),
            error: None,
            created_at: "2020-01-01T00:00:00.000000Z".to_string(),
        };
        assert!(db.insert_webhook_event(&event).unwrap());

        let deleted = sweep_once(&db, "2021-01-01T00:00:00.000000Z").unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.count_events().unwrap(), 0);
    }
}
