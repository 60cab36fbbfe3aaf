pub mod api;
pub mod claim;
pub mod config;
pub mod coordinators;
pub mod db;
pub mod github;
pub mod llm;
pub mod records;
pub mod router;
pub mod sweep;
pub mod tasks;

use std::sync::Arc;

use crate::config::Peer;
use crate::coordinators::Coordinator;
use crate::db::SqliteDb;
use crate::tasks::TaskRunner;

pub struct AppState {
    pub db: Arc<SqliteDb>,
    pub coordinators: Vec<Arc<dyn Coordinator>>,
    pub peers: Vec<Peer>,
    /// Client used for peer forwarding, with a short fixed timeout.
    pub http: reqwest::Client,
    pub runner: TaskRunner,
    pub webhook_secret: Option<String>,
}
