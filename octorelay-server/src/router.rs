//! Webhook ingestion and fan-out.
//!
//! The router is the only component that sees transport metadata (delivery
//! id, signature header). It verifies the signature, decides which
//! coordinators care about the event type, runs each one isolated on its own
//! task, forwards the raw body to any configured peer services, writes one
//! audit row per delivery, and acknowledges within the event source's
//! timeout whatever the coordinators did.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::coordinators::{Coordinator, CoordinatorOutcome, EventEnvelope, EventPayload};
use crate::db::now_ts;
use crate::records::WebhookEventRecord;
use crate::AppState;

/// Upper bound on one coordinator's synchronous part. Coordinators only
/// validate, claim and schedule, so hitting this means one is wedged.
const COORDINATOR_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

/// Which local coordinators care about each event type.
fn interested_coordinators(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "pull_request" => &["review"],
        "issues" => &["copy"],
        "issue_comment" => &["score", "comment_sync"],
        _ => &[],
    }
}

/// Verify a GitHub webhook signature (constant-time comparison).
pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(hex_signature) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Middleware rejecting unsigned or mis-signed deliveries.
///
/// With no secret configured every request passes through; startup logs
/// that reduced-security mode once.
pub async fn verify_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.webhook_secret.clone() else {
        return Ok(next.run(request).await);
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&secret, &bytes, signature) {
        warn!("Rejected webhook with invalid signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    // The body was consumed for verification; rebuild the request.
    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Per-coordinator (or per-peer) result, echoed in the response and stored
/// in the audit row.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub coordinator: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub results: Vec<DispatchResult>,
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, StatusCode> {
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_string();
    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    dispatch(&state, &event_type, delivery_id, body)
        .await
        .map(Json)
}

/// Fan one delivery out to every interested local coordinator and peer.
pub async fn dispatch(
    state: &Arc<AppState>,
    event_type: &str,
    delivery_id: Option<String>,
    body: Bytes,
) -> Result<WebhookAck, StatusCode> {
    let payload: EventPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!(event_type, "Rejected undecodable webhook payload: {}", e);
        StatusCode::BAD_REQUEST
    })?;

    let action = payload.action.clone();
    let repo = payload.repository.as_ref().map(|r| r.full_name.clone());
    let sender = payload.sender.as_ref().map(|s| s.login.clone());
    let entity_number = payload
        .issue
        .as_ref()
        .map(|i| i.number)
        .or_else(|| payload.pull_request.as_ref().map(|p| p.number));

    info!(
        event_type,
        action = action.as_deref().unwrap_or(""),
        delivery_id = delivery_id.as_deref().unwrap_or(""),
        repo = repo.as_deref().unwrap_or(""),
        "Received webhook"
    );

    let envelope = Arc::new(EventEnvelope {
        event_type: event_type.to_string(),
        payload,
    });

    let names = interested_coordinators(event_type);
    let mut results = Vec::new();

    // Each coordinator runs on its own task: a panic or hang in one must
    // not affect the others or the acknowledgment.
    let mut handles = Vec::new();
    for coordinator in state
        .coordinators
        .iter()
        .filter(|c| names.contains(&c.name()))
    {
        let coordinator: Arc<dyn Coordinator> = coordinator.clone();
        let envelope = envelope.clone();
        let name = coordinator.name();
        let handle = tokio::spawn(async move { coordinator.handle(envelope).await });
        handles.push((name, handle));
    }

    for (name, handle) in handles {
        let outcome = match tokio::time::timeout(COORDINATOR_TIMEOUT, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => CoordinatorOutcome::Failed {
                error: format!("coordinator panicked: {}", join_error),
            },
            Err(_) => CoordinatorOutcome::Failed {
                error: "coordinator timed out".to_string(),
            },
        };
        if let CoordinatorOutcome::Failed { error } = &outcome {
            error!(coordinator = name, error, "Coordinator failed");
        }
        results.push(DispatchResult {
            coordinator: name.to_string(),
            outcome: outcome.label().to_string(),
            detail: outcome.detail().map(str::to_string),
        });
    }

    // Peers get the raw body so their own parsing and filtering applies.
    for peer in &state.peers {
        let outcome = forward_to_peer(state, peer, event_type, delivery_id.as_deref(), &body).await;
        results.push(outcome);
    }

    let status = if results.is_empty() {
        "ignored"
    } else if results.iter().any(|r| r.outcome == "failed") {
        "failed"
    } else {
        "success"
    };

    record_audit_row(
        state,
        event_type,
        action,
        delivery_id.clone(),
        sender,
        repo,
        entity_number,
        &results,
        status,
    );

    Ok(WebhookAck {
        status: status.to_string(),
        delivery_id,
        results,
    })
}

async fn forward_to_peer(
    state: &Arc<AppState>,
    peer: &crate::config::Peer,
    event_type: &str,
    delivery_id: Option<&str>,
    body: &Bytes,
) -> DispatchResult {
    let mut request = state
        .http
        .post(&peer.url)
        .header("content-type", "application/json")
        .header("x-github-event", event_type)
        .body(body.clone());
    if let Some(delivery_id) = delivery_id {
        request = request.header("x-github-delivery", delivery_id);
    }

    let (outcome, detail) = match request.send().await {
        Ok(response) if response.status().is_success() => ("accepted", None),
        Ok(response) => (
            "failed",
            Some(format!("peer returned {}", response.status())),
        ),
        Err(e) => ("failed", Some(format!("peer unreachable: {}", e))),
    };
    if let Some(detail) = &detail {
        error!(peer = %peer.name, detail, "Peer forward failed");
    }

    DispatchResult {
        coordinator: peer.name.clone(),
        outcome: outcome.to_string(),
        detail,
    }
}

/// Write the per-delivery audit row. Auditing is fault tolerant: a storage
/// error here is logged and the acknowledgment proceeds unchanged.
#[allow(clippy::too_many_arguments)]
fn record_audit_row(
    state: &Arc<AppState>,
    event_type: &str,
    action: Option<String>,
    delivery_id: Option<String>,
    sender: Option<String>,
    repo: Option<String>,
    entity_number: Option<u64>,
    results: &[DispatchResult],
    status: &str,
) {
    let coordinators = serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string());
    let failures: Vec<&str> = results
        .iter()
        .filter(|r| r.outcome == "failed")
        .filter_map(|r| r.detail.as_deref())
        .collect();

    let record = WebhookEventRecord {
        id: Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        action,
        delivery_id,
        sender,
        repo,
        entity_number,
        coordinators,
        outcome: status.to_string(),
        error: if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        },
        created_at: now_ts(),
    };

    if let Err(e) = state.db.insert_webhook_event(&record) {
        error!("Failed to record webhook audit row: {:#}", e);
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/webhook", axum::routing::post(webhook_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            middleware_state,
            verify_signature,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ListFilter, SqliteDb};
    use crate::tasks::TaskRunner;
    use async_trait::async_trait;

    enum StubBehavior {
        Accept,
        Fail,
        Panic,
    }

    struct StubCoordinator {
        name: &'static str,
        behavior: StubBehavior,
    }

    #[async_trait]
    impl Coordinator for StubCoordinator {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, _event: Arc<EventEnvelope>) -> CoordinatorOutcome {
            match self.behavior {
                StubBehavior::Accept => CoordinatorOutcome::Accepted {
                    record_id: Some("stub-record".to_string()),
                },
                StubBehavior::Fail => CoordinatorOutcome::Failed {
                    error: "stub failure".to_string(),
                },
                StubBehavior::Panic => panic!("stub panic"),
            }
        }
    }

    fn state_with(coordinators: Vec<Arc<dyn Coordinator>>) -> Arc<AppState> {
        let db = Arc::new(SqliteDb::new_in_memory().unwrap());
        let runner = TaskRunner::new(2);
        Arc::new(AppState {
            db,
            coordinators,
            peers: Vec::new(),
            http: reqwest::Client::new(),
            runner,
            webhook_secret: None,
        })
    }

    fn comment_body() -> Bytes {
        Bytes::from(
            serde_json::json!({
                "action": "created",
                "repository": {"name": "public", "full_name": "acme/public"},
                "issue": {"number": 5},
                "comment": {"id": 900, "body": "hi", "user": {"id": 2, "login": "bob"}},
                "sender": {"id": 2, "login": "bob"},
                "installation": {"id": 77}
            })
            .to_string(),
        )
    }

    #[test]
    fn test_signature_verification() {
        let secret = "webhook-secret";
        let payload = b"{\"action\":\"opened\"}";

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let valid = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_github_signature(secret, payload, &valid));
        assert!(!verify_github_signature("wrong-secret", payload, &valid));
        assert!(!verify_github_signature(secret, b"tampered", &valid));
        assert!(!verify_github_signature(secret, payload, "sha256=nothex"));
        assert!(!verify_github_signature(secret, payload, "sha1=abcdef"));
    }

    #[test]
    fn test_event_routing_table() {
        assert_eq!(interested_coordinators("pull_request"), &["review"]);
        assert_eq!(interested_coordinators("issues"), &["copy"]);
        assert_eq!(
            interested_coordinators("issue_comment"),
            &["score", "comment_sync"]
        );
        assert!(interested_coordinators("push").is_empty());
        assert!(interested_coordinators("workflow_run").is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_coordinator_does_not_stop_the_others() {
        let state = state_with(vec![
            Arc::new(StubCoordinator {
                name: "score",
                behavior: StubBehavior::Panic,
            }),
            Arc::new(StubCoordinator {
                name: "comment_sync",
                behavior: StubBehavior::Accept,
            }),
        ]);

        let ack = dispatch(
            &state,
            "issue_comment",
            Some("delivery-1".to_string()),
            comment_body(),
        )
        .await
        .unwrap();

        assert_eq!(ack.status, "failed");
        assert_eq!(ack.results.len(), 2);
        let score = ack.results.iter().find(|r| r.coordinator == "score").unwrap();
        assert_eq!(score.outcome, "failed");
        assert!(score.detail.as_deref().unwrap().contains("panicked"));
        let sync = ack
            .results
            .iter()
            .find(|r| r.coordinator == "comment_sync")
            .unwrap();
        assert_eq!(sync.outcome, "accepted");

        // The delivery is still audited with the aggregate outcome.
        let events = state.db.list_webhook_events(&ListFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, "failed");
        assert_eq!(events[0].delivery_id.as_deref(), Some("delivery-1"));
        assert!(events[0].error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_all_coordinators_succeeding_is_success() {
        let state = state_with(vec![
            Arc::new(StubCoordinator {
                name: "score",
                behavior: StubBehavior::Accept,
            }),
            Arc::new(StubCoordinator {
                name: "comment_sync",
                behavior: StubBehavior::Accept,
            }),
        ]);

        let ack = dispatch(&state, "issue_comment", None, comment_body())
            .await
            .unwrap();
        assert_eq!(ack.status, "success");
        assert!(ack.results.iter().all(|r| r.outcome == "accepted"));
    }

    #[tokio::test]
    async fn test_uninterested_coordinators_are_not_invoked() {
        // A "copy" coordinator that would fail loudly if invoked.
        let state = state_with(vec![Arc::new(StubCoordinator {
            name: "copy",
            behavior: StubBehavior::Fail,
        })]);

        let ack = dispatch(&state, "issue_comment", None, comment_body())
            .await
            .unwrap();
        assert_eq!(ack.status, "ignored");
        assert!(ack.results.is_empty());

        let events = state.db.list_webhook_events(&ListFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, "ignored");
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_rejected() {
        let state = state_with(Vec::new());
        let result = dispatch(&state, "issues", None, Bytes::from_static(b"not json")).await;
        assert_eq!(result.unwrap_err(), StatusCode::BAD_REQUEST);

        // Rejected deliveries never reach the audit table.
        assert_eq!(state.db.count_events().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_audit_write_failure_does_not_fail_the_delivery() {
        let state = state_with(vec![Arc::new(StubCoordinator {
            name: "score",
            behavior: StubBehavior::Accept,
        })]);

        // Break the audit table; the delivery must still be acknowledged
        // with the coordinator outcomes intact.
        state.db.exec_raw("DROP TABLE webhook_events").unwrap();

        let ack = dispatch(
            &state,
            "issue_comment",
            Some("delivery-5".to_string()),
            comment_body(),
        )
        .await
        .unwrap();

        assert_eq!(ack.status, "success");
        assert_eq!(ack.results.len(), 1);
        assert_eq!(ack.results[0].outcome, "accepted");
    }

    #[tokio::test]
    async fn test_audit_row_captures_event_metadata() {
        let state = state_with(vec![Arc::new(StubCoordinator {
            name: "score",
            behavior: StubBehavior::Accept,
        })]);

        dispatch(
            &state,
            "issue_comment",
            Some("delivery-9".to_string()),
            comment_body(),
        )
        .await
        .unwrap();

        let events = state.db.list_webhook_events(&ListFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, "issue_comment");
        assert_eq!(event.action.as_deref(), Some("created"));
        assert_eq!(event.repo.as_deref(), Some("acme/public"));
        assert_eq!(event.sender.as_deref(), Some("bob"));
        assert_eq!(event.entity_number, Some(5));
        assert!(event.coordinators.contains("\"score\""));
    }
}
