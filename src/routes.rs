//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod ops;
mod proposals;
mod updates;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    // Build the router
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Signals and the approval queue
        .route("/api/signals", post(proposals::submit_signal))
        .route("/api/proposals", get(proposals::list_pending))
        .route("/api/proposals/{id}", get(proposals::get_proposal))
        .route("/api/proposals/{id}/approve", post(proposals::approve_proposal))
        .route("/api/proposals/{id}/reject", post(proposals::reject_proposal))
        .route("/api/proposals/{id}/defer", post(proposals::defer_proposal))
        .route("/api/history", get(proposals::list_history))
        .route("/api/rules", get(proposals::list_rules))

        // Updates and backups
        .route("/api/updates", get(updates::list_updates).post(updates::apply_update))
        .route("/api/updates/{id}/confirm", post(updates::confirm_update))
        .route("/api/updates/{id}/rollback", post(updates::rollback_update))
        .route("/api/backups", get(updates::list_backups))
        .route("/api/backups/{id}", get(updates::get_backup))

        // Audit and statistics
        .route("/api/audit", get(ops::list_audit))
        .route("/api/stats", get(ops::get_stats))

        // Apply middleware and state
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
            .max_age(Duration::from_secs(3600))
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{ControllerConfig, CorsConfig, PathsConfig, ServerConfig};
    use crate::controller::Controller;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ALERTS: &str = "monitoring/alert_config.json";

    async fn test_router() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            config_dir: dir.path().join("config"),
            data_dir: dir.path().join("data"),
            signal_inbox: None,
        };
        let alerts = paths.config_dir.join(ALERTS);
        std::fs::create_dir_all(alerts.parent().unwrap()).unwrap();
        std::fs::write(&alerts, br#"{"thresholds": {"max_response_time": 10}}"#).unwrap();

        let controller = Controller::open(ControllerConfig::default(), &paths, Arc::new(SystemClock))
            .await
            .unwrap();
        let settings = Settings {
            server: ServerConfig::default(),
            cors: CorsConfig::default(),
            paths,
        };
        let state = Arc::new(AppState::new(Arc::new(controller)));
        (dir, create_router(state, &settings))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn alert_signal() -> Value {
        json!({
            "kind": "alert_frequency",
            "alertType": "performance_degradation",
            "server": "api",
            "count": 9
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = test_router().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_signal_queue_and_approve() {
        let (_dir, app) = test_router().await;

        let (status, body) = send(&app, "POST", "/api/signals", Some(alert_signal())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "queued");
        let id = body["proposalId"].as_str().unwrap().to_string();

        // Same signal again is a conflict
        let (status, body) = send(&app, "POST", "/api/signals", Some(alert_signal())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, body) = send(&app, "GET", "/api/proposals", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["proposals"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", &format!("/api/proposals/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["proposal"]["deferCount"], 0);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/proposals/{}/approve", id),
            Some(json!({"reason": "looks right"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true, "{}", body);
        assert_eq!(body["state"], "applied");

        let (_, body) = send(&app, "GET", "/api/updates", None).await;
        assert_eq!(body["active"].as_array().unwrap().len(), 1);

        let (_, body) = send(&app, "GET", "/api/stats", None).await;
        assert_eq!(body["stats"]["applied"], 1);
        assert_eq!(body["stats"]["pending"], 0);
    }

    #[tokio::test]
    async fn test_unknown_proposal_is_404() {
        let (_dir, app) = test_router().await;
        let uri = format!("/api/proposals/{}/reject", uuid::Uuid::new_v4());
        let (status, body) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_direct_update_and_rollback() {
        let (dir, app) = test_router().await;
        let path = dir.path().join("config").join(ALERTS);
        let original = std::fs::read(&path).unwrap();

        let (status, body) = send(
            &app,
            "POST",
            "/api/updates",
            Some(json!({
                "targetResource": ALERTS,
                "changes": {"thresholds.max_response_time": {"_operation": "multiply", "value": 2}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let update_id = body["update"]["updateId"].as_str().unwrap().to_string();
        let doc: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["thresholds"]["max_response_time"], 20);

        let (status, body) = send(&app, "POST", &format!("/api/updates/{}/rollback", update_id), None).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["update"]["state"], "rolled_back");
        assert_eq!(std::fs::read(&path).unwrap(), original);

        let (_, body) = send(&app, "GET", &format!("/api/backups?resource={}", ALERTS), None).await;
        assert_eq!(body["backups"].as_array().unwrap().len(), 1);
        let backup_id = body["backups"][0]["backupId"].as_str().unwrap().to_string();
        let (status, body) = send(&app, "GET", &format!("/api/backups/{}", backup_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backup"]["targetResource"], ALERTS);

        let (status, _) = send(&app, "GET", "/api/backups/backup_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&app, "GET", "/api/audit?action=update_rolled_back", None).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let (_dir, app) = test_router().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/updates",
            Some(json!({
                "targetResource": ALERTS,
                "changes": [{"op": "set", "path": "thresholds.max_response_time", "value": 500}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }
}
