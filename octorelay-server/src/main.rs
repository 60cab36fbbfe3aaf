use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

use octorelay_server::claim::ClaimGuard;
use octorelay_server::config::Config;
use octorelay_server::coordinators::{
    CommentSyncCoordinator, Coordinator, CopyCoordinator, ReviewCoordinator, ScoreCoordinator,
};
use octorelay_server::db::SqliteDb;
use octorelay_server::github::GitHubClient;
use octorelay_server::llm::LlmClient;
use octorelay_server::router::webhook_router;
use octorelay_server::tasks::TaskRunner;
use octorelay_server::{api, sweep, AppState};

const PEER_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!(
        version = octorelay_core::service_version(),
        "Starting octorelay"
    );

    let config = Config::from_env().context("Failed to load configuration")?;

    if config.webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET not set; accepting unsigned webhook deliveries");
    }

    let db_path = config.state_dir.join("octorelay-state.db");
    info!("Using state database: {}", db_path.display());
    let db = Arc::new(SqliteDb::new(&db_path).context("Failed to initialize state database")?);

    let github = Arc::new(GitHubClient::new(
        config.github_app_id,
        config.github_private_key.clone(),
    ));
    let llm = Arc::new(LlmClient::new(
        config.openai_api_key.clone(),
        config.llm_model.clone(),
        config.llm_timeout,
    ));

    let guard = ClaimGuard::new(db.clone(), config.staleness_window);
    let runner = TaskRunner::new(config.max_concurrent_tasks);

    let coordinators: Vec<Arc<dyn Coordinator>> = vec![
        Arc::new(CopyCoordinator::new(
            db.clone(),
            github.clone(),
            guard.clone(),
            runner.clone(),
            config.copy_targets.clone(),
        )),
        Arc::new(ReviewCoordinator::new(
            db.clone(),
            github.clone(),
            llm.clone(),
            guard.clone(),
            runner.clone(),
            config.llm_model.clone(),
        )),
        Arc::new(ScoreCoordinator::new(
            db.clone(),
            llm.clone(),
            guard.clone(),
            runner.clone(),
        )),
        Arc::new(CommentSyncCoordinator::new(
            db.clone(),
            github.clone(),
            guard.clone(),
            runner.clone(),
        )),
    ];

    let http = reqwest::Client::builder()
        .user_agent(format!("octorelay/{}", octorelay_core::service_version()))
        .timeout(PEER_FORWARD_TIMEOUT)
        .build()
        .context("Failed to create peer HTTP client")?;

    let app_state = Arc::new(AppState {
        db: db.clone(),
        coordinators,
        peers: config.peers.clone(),
        http,
        runner,
        webhook_secret: config.webhook_secret.clone(),
    });

    if let Some(retention) = config.retention {
        let sweep_db = db.clone();
        tokio::spawn(async move {
            sweep::retention_loop(sweep_db, retention).await;
        });
    }

    let app = api::routes()
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
