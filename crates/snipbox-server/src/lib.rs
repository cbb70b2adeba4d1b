//! HTTP surface for the snipbox execution gateway
//!
//! Submissions are accepted with `POST /execute` and answered immediately
//! with a request id. Progress is collected either by polling
//! `GET /execute/{id}?cursor=N` or by streaming `GET /execute/{id}/events`.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use snipbox::ExecutionGateway;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod api;
pub mod error;
pub mod session;
pub mod sse;

pub use error::ApiError;
pub use session::ClientSession;

/// Shared state of every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub gateway: ExecutionGateway,
    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(gateway: ExecutionGateway, keep_alive: Duration) -> Self {
        Self {
            gateway,
            keep_alive,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.gateway.request_body_limit();
    Router::new()
        .route("/execute", post(api::submit))
        .route("/execute/{id}", get(api::poll).delete(api::cancel))
        .route("/execute/{id}/events", get(api::events))
        .route("/languages", get(api::languages))
        .route("/health", get(api::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop accepting connections and wait
/// for open ones to finish
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode, header};
    use snipbox::Config;
    use snipbox::testing::{Script, ScriptedBackend};
    use tower::ServiceExt;

    fn config() -> Config {
        let mut config = Config::default();
        config.gateway.max_source_bytes = 256;
        config.pool.max_workers = 2;
        config.pool.target_ready = 0;
        config.quota.burst = 2;
        config.quota.refill_interval_ms = 60_000;
        config.quota.max_concurrent_per_session = 10;
        config.quota.abuse_threshold = 3;
        config
    }

    fn app(backend: ScriptedBackend, start: bool) -> (Router, ExecutionGateway) {
        let gateway = ExecutionGateway::new(&config(), Arc::new(backend)).unwrap();
        if start {
            gateway.start();
        }
        let state = AppState::new(gateway.clone(), Duration::from_secs(15));
        (router(state), gateway)
    }

    fn execute(body: serde_json::Value, session: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/execute")
            .header(header::CONTENT_TYPE, "application/json")
            .header(session::SESSION_HEADER, session)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn submit_then_stream_events() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("hi\n")), true);

        let response = app
            .clone()
            .oneshot(execute(
                serde_json::json!({"language": "python", "source": "print('hi')"}),
                "s1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = json(response).await;
        assert_eq!(accepted["queue_position"], 0);
        let id = accepted["request_id"].as_str().unwrap().to_owned();

        let response = app
            .oneshot(get(&format!("/execute/{id}/events")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        let queued = body.find("event: queued").unwrap();
        let started = body.find("event: started").unwrap();
        let stdout = body.find("event: stdout").unwrap();
        let result = body.find("event: result").unwrap();
        assert!(queued < started && started < stdout && stdout < result);
        assert!(body.contains("\"outcome\":\"Completed\""));
        assert!(body.contains("\"exit_code\":0"));
    }

    #[tokio::test]
    async fn poll_returns_events_after_cursor() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let accepted = json(
            app.clone()
                .oneshot(execute(
                    serde_json::json!({"language": "bash", "source": "echo"}),
                    "s1",
                ))
                .await
                .unwrap(),
        )
        .await;
        let id = accepted["request_id"].as_str().unwrap();

        let snapshot = json(
            app.clone()
                .oneshot(get(&format!("/execute/{id}")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(snapshot["status"], "queued");
        assert_eq!(snapshot["events"][0]["type"], "queued");
        assert_eq!(snapshot["next_cursor"], 1);

        let snapshot = json(
            app.oneshot(get(&format!("/execute/{id}?cursor=1")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(snapshot["events"].as_array().unwrap().len(), 0);
        assert!(snapshot["result"].is_null());
    }

    #[tokio::test]
    async fn unknown_language_is_bad_request() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let response = app
            .oneshot(execute(
                serde_json::json!({"language": "cobol", "source": "x"}),
                "s1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["type"], "invalid_language");
    }

    #[tokio::test]
    async fn oversized_source_is_bad_request() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let response = app
            .oneshot(execute(
                serde_json::json!({"language": "python", "source": "x".repeat(257)}),
                "s1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["type"], "payload_too_large");
    }

    #[tokio::test]
    async fn oversized_body_is_payload_too_large() {
        let (app, gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let source = "x".repeat(gateway.request_body_limit() + 1);
        let response = app
            .oneshot(execute(
                serde_json::json!({"language": "python", "source": source}),
                "s1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["type"], "payload_too_large");
        assert_eq!(gateway.stats().tracked_requests, 0);
    }

    #[tokio::test]
    async fn malformed_body_is_json_bad_request() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"language\": "))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["type"], "bad_request");
    }

    #[tokio::test]
    async fn banned_address_stays_banned_under_new_session() {
        let (app, gateway) = app(ScriptedBackend::new(|_| Script::out_of_memory()), true);
        let peer = SocketAddr::from(([10, 0, 0, 7], 4000));
        let from_peer = |session: &str| {
            let mut request = execute(
                serde_json::json!({"language": "python", "source": "x = ' ' * 10**10"}),
                session,
            );
            request.extensions_mut().insert(ConnectInfo(peer));
            request
        };

        // Three sessions from one address each hit the memory ceiling once
        for session in ["a", "b", "c"] {
            let accepted = json(app.clone().oneshot(from_peer(session)).await.unwrap()).await;
            let id: snipbox::RequestId = accepted["request_id"].as_str().unwrap().parse().unwrap();
            let mut events = gateway.subscribe(&id, 0).unwrap();
            while events.next().await.is_some() {}
        }

        let response = app.oneshot(from_peer("fresh")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json(response).await["error"]["type"], "rejected");
    }

    #[tokio::test]
    async fn burst_is_throttled_with_retry_after() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let body = serde_json::json!({"language": "python", "source": "pass"});
        for _ in 0..2 {
            let response = app.clone().oneshot(execute(body.clone(), "s1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        let response = app.clone().oneshot(execute(body.clone(), "s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);

        // A different session has its own bucket
        let response = app.oneshot(execute(body, "s2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let missing = snipbox::RequestId::new();
        let response = app
            .clone()
            .oneshot(get(&format!("/execute/{missing}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/execute/not-an-id")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_cancels_queued_request() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);
        let accepted = json(
            app.clone()
                .oneshot(execute(
                    serde_json::json!({"language": "python", "source": "pass"}),
                    "s1",
                ))
                .await
                .unwrap(),
        )
        .await;
        let id = accepted["request_id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/execute/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let snapshot = json(app.oneshot(get(&format!("/execute/{id}"))).await.unwrap()).await;
        assert_eq!(snapshot["status"], "finished");
        assert_eq!(snapshot["result"]["outcome"], "Cancelled");
    }

    #[tokio::test]
    async fn languages_and_health() {
        let (app, _gateway) = app(ScriptedBackend::new(|_| Script::stdout("")), false);

        let languages = json(app.clone().oneshot(get("/languages")).await.unwrap()).await;
        let ids: Vec<_> = languages
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["id"].as_str().unwrap().to_owned())
            .collect();
        assert!(ids.contains(&"python".to_owned()));
        assert!(ids.contains(&"c".to_owned()));

        let health = json(app.oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["pool"]["max_workers"], 2);
        assert_eq!(health["scheduler"]["queued"], 0);
    }
}
