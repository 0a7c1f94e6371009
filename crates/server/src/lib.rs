//! Ralph dashboard server library.
//!
//! Axum HTTP and WebSocket server over the realtime core: it watches Ralph
//! project directories, pushes change events to subscribed clients and
//! controls each project's agent loop.

pub mod auth;
pub mod config;
pub mod error;
pub mod live;
pub mod registry;
pub mod routes;
pub mod state;
pub mod supervisor;

pub use config::Settings;
pub use error::*;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - API routes (health, projects, control, realtime)
/// - CORS (allows any origin)
/// - Request tracing
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Integration Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use ralph_dashboard_core::project_id_from_path;
    use std::fs;
    use std::path::PathBuf;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct TestApp {
        _scan: tempfile::TempDir,
        _data: tempfile::TempDir,
        root: PathBuf,
        id: String,
        state: Arc<AppState>,
    }

    impl TestApp {
        fn new() -> Self {
            let scan = tempfile::tempdir().unwrap();
            let data = tempfile::tempdir().unwrap();
            let root = scan.path().canonicalize().unwrap().join("demo");
            fs::create_dir_all(root.join(".ralph")).unwrap();
            let settings = Settings::new(SECRET, data.path())
                .with_project_dirs(vec![scan.path().to_path_buf()]);
            Self {
                id: project_id_from_path(&root),
                root,
                state: AppState::new(settings).unwrap(),
                _scan: scan,
                _data: data,
            }
        }

        fn app(&self) -> Router {
            create_app(self.state.clone())
        }
    }

    fn bearer() -> String {
        format!("Bearer {}", auth::tests::token(SECRET, "access", 600))
    }

    /// Helper to make a request to the app, optionally authenticated.
    async fn request(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        authed: bool,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if authed {
            builder = builder.header("Authorization", bearer());
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    // ========================================================================
    // Health Endpoint Tests
    // ========================================================================

    #[tokio::test]
    async fn test_health_endpoint() {
        let t = TestApp::new();
        let (status, json) = request(t.app(), "GET", "/api/health", None, false).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["uptime_secs"].is_number());
    }

    // ========================================================================
    // Project Endpoint Tests
    // ========================================================================

    #[tokio::test]
    async fn test_projects_lists_discovered_project() {
        let t = TestApp::new();
        let (status, json) = request(t.app(), "GET", "/api/projects", None, false).await;

        assert_eq!(status, StatusCode::OK);
        let projects = json.as_array().unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0]["id"], t.id.as_str());
        assert_eq!(projects[0]["status"], "stopped");
    }

    #[tokio::test]
    async fn test_register_requires_auth_and_valid_project() {
        let t = TestApp::new();
        let outside = tempfile::tempdir().unwrap();
        let extra = outside.path().join("extra");
        fs::create_dir_all(extra.join(".ralph")).unwrap();
        let body = serde_json::json!({"path": extra});

        let (status, _) = request(t.app(), "POST", "/api/projects", Some(body.clone()), false).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, json) = request(t.app(), "POST", "/api/projects", Some(body), true).await;
        assert_eq!(status, StatusCode::CREATED);
        let extra_id = json["id"].as_str().unwrap().to_string();

        let (_, json) = request(t.app(), "GET", "/api/projects", None, false).await;
        assert_eq!(json.as_array().unwrap().len(), 2);

        let uri = format!("/api/projects/{}", extra_id);
        let (status, json) = request(t.app(), "DELETE", &uri, None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], true);

        let plain = serde_json::json!({"path": outside.path()});
        let (status, _) = request(t.app(), "POST", "/api/projects", Some(plain), true).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_for_unknown_project() {
        let t = TestApp::new();
        let (status, json) =
            request(t.app(), "GET", "/api/projects/ghost-000000/notifications", None, false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Project not found");
    }

    #[tokio::test]
    async fn test_notifications_history() {
        let t = TestApp::new();
        fs::write(
            t.root.join(".ralph/pending-notification.txt"),
            r#"{"timestamp":"2026-01-01T10:00:00Z","prefix":"ERROR","message":"Tests failing"}"#,
        )
        .unwrap();
        let uri = format!("/api/projects/{}/notifications", t.id);
        let (status, json) = request(t.app(), "GET", &uri, None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["prefix"], "ERROR");
        assert_eq!(json[0]["message"], "Tests failing");
    }

    #[tokio::test]
    async fn test_iterations_history() {
        let t = TestApp::new();
        let uri = format!("/api/projects/{}/iterations", t.id);
        let (status, json) = request(t.app(), "GET", &uri, None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));

        fs::write(
            t.root.join(".ralph/iterations.jsonl"),
            "{\"iteration\":1,\"max\":5,\"start\":\"2026-01-01T10:00:00Z\",\"end\":\"2026-01-01T10:03:00Z\",\"status\":\"success\"}\n{\"iteration\":2,\"max\":5,\"start\":\"2026-01-01T10:03:00Z\"}\n",
        )
        .unwrap();
        let (status, json) = request(t.app(), "GET", &uri, None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["status"], "success");
        assert_eq!(json[1]["number"], 2);
        assert_eq!(json[1]["end_timestamp"], serde_json::Value::Null);

        let (status, _) =
            request(t.app(), "GET", "/api/projects/ghost-000000/iterations", None, false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ========================================================================
    // Control Endpoint Tests
    // ========================================================================

    #[tokio::test]
    async fn test_control_requires_token() {
        let t = TestApp::new();
        let uri = format!("/api/projects/{}/pause", t.id);
        let (status, json) = request(t.app(), "POST", &uri, None, false).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Unauthorized");
        assert!(!t.root.join(".ralph/pause").exists());
    }

    #[tokio::test]
    async fn test_pause_resume_stop() {
        let t = TestApp::new();
        let base = format!("/api/projects/{}", t.id);

        let (status, json) = request(t.app(), "POST", &format!("{base}/pause"), None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["paused"], true);

        let (_, json) = request(t.app(), "POST", &format!("{base}/resume"), None, true).await;
        assert_eq!(json["resumed"], true);

        let (status, json) = request(t.app(), "POST", &format!("{base}/stop"), None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stopped"], false);
    }

    #[tokio::test]
    async fn test_start_without_script_is_bad_request() {
        let t = TestApp::new();
        let uri = format!("/api/projects/{}/start", t.id);
        let (status, json) = request(t.app(), "POST", &uri, None, true).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Loop script not found");
    }

    #[tokio::test]
    async fn test_inject_and_config() {
        let t = TestApp::new();
        let base = format!("/api/projects/{}", t.id);

        let (status, _) = request(
            t.app(),
            "POST",
            &format!("{base}/inject"),
            Some(serde_json::json!({"message": "  "})),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = request(
            t.app(),
            "POST",
            &format!("{base}/inject"),
            Some(serde_json::json!({"message": "Use PostgreSQL"})),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["content"], "Use PostgreSQL\n");

        let config = serde_json::json!({"max_iterations": 5, "cli": "codex", "flags": "", "test_command": "cargo test"});
        let (status, json) =
            request(t.app(), "PUT", &format!("{base}/config"), Some(config.clone()), true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, config);

        let (_, json) = request(t.app(), "GET", &format!("{base}/config"), None, true).await;
        assert_eq!(json, config);
    }

    // ========================================================================
    // CORS / Routing Tests
    // ========================================================================

    #[tokio::test]
    async fn test_cors_headers() {
        let t = TestApp::new();
        let response = t
            .app()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/health")
                    .header("Origin", "http://localhost:3000")
                    .header("Access-Control-Request-Method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(
            response.headers().contains_key("access-control-allow-origin"),
            "Expected access-control-allow-origin header"
        );
    }

    #[tokio::test]
    async fn test_404_for_unknown_route() {
        let t = TestApp::new();
        let (status, _) = request(t.app(), "GET", "/api/nonexistent", None, false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
