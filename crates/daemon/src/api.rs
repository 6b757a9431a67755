// Shadowlink - REST API
//
// Thin HTTP layer over the service facade: one dispatch endpoint, a
// status/health pair, and a server-sent event feed of client lifecycle
// changes interleaved with heartbeats.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use shadowlink_common::{ServiceRequest, ServiceResult};

use crate::client::ClientManager;
use crate::service::MainService;

#[cfg(not(test))]
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
#[cfg(test)]
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClientManager>,
    pub service: Arc<MainService>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/service", post(service))
        .route("/api/events", get(events))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let (client_state, active) = state.manager.status().await;
    Json(json!({ "state": client_state, "active": active }))
}

/// Single dispatch endpoint. The transport always answers HTTP 200;
/// success and failure ride in the envelope's `code` field.
async fn service(
    State(state): State<AppState>,
    Json(request): Json<ServiceRequest>,
) -> Json<ServiceResult> {
    Json(state.service.dispatch(request).await)
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client_events = BroadcastStream::new(state.manager.subscribe()).filter_map(|event| async {
        // Lagged receivers skip ahead rather than ending the stream.
        let event = event.ok()?;
        Some(Ok::<_, Infallible>(sse_json(&event)))
    });

    let heartbeat = futures::stream::unfold((), |()| async {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        let event = json!({ "type": "heartbeat", "timestamp": Utc::now() });
        Some((Ok::<_, Infallible>(sse_json(&event)), ()))
    });

    Sse::new(futures::stream::select(client_events, heartbeat)).keep_alive(KeepAlive::default())
}

fn sse_json<T: Serialize>(payload: &T) -> Event {
    Event::default()
        .json_data(payload)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ClipboardReader, QrRenderer};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use shadowlink_common::{ProxyKind, ProxyProfile, Result as CommonResult, Settings};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    struct StubClipboard;

    #[async_trait::async_trait]
    impl ClipboardReader for StubClipboard {
        async fn read_text(&self) -> CommonResult<String> {
            Ok(String::new())
        }
    }

    struct StubQr;

    impl QrRenderer for StubQr {
        fn render_data_url(&self, _contents: &str) -> CommonResult<String> {
            Ok("data:image/svg+xml;base64,c3R1Yg==".into())
        }
    }

    fn test_state() -> AppState {
        let manager = Arc::new(ClientManager::new());
        let service = Arc::new(MainService::new(
            manager.clone(),
            Arc::new(StubClipboard),
            Arc::new(StubQr),
        ));
        AppState { manager, service }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn status_starts_disconnected() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "disconnected");
        assert!(json["active"].is_null());
    }

    #[tokio::test]
    async fn service_endpoint_wraps_dispatch() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/service")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"action":"isConnected"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        // Transport stays 200; the envelope carries the outcome.
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["code"], 200);
        assert_eq!(json["result"], false);
    }

    #[tokio::test]
    async fn events_stream_emits_heartbeats() {
        let response = create_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut stream = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("heartbeat"), "{text}");
    }

    #[tokio::test]
    async fn events_stream_carries_client_events() {
        let state = test_state();
        let response = create_router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let mut stream = response.into_body().into_data_stream();

        // A start against a dead port fails fast and emits events.
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            port
        };
        let manager = state.manager.clone();
        tokio::spawn(async move {
            let profile = ProxyProfile {
                id: None,
                remark: "dead".into(),
                server_host: "127.0.0.1".into(),
                server_port: dead_port,
                password: String::new(),
                encrypt_method: "aes-256-gcm".into(),
                protocol: None,
                protocol_param: None,
                obfs: None,
                obfs_param: None,
                kind: ProxyKind::Ss,
                timeout: 2,
                plugin: None,
            };
            let _ = manager.start(profile, Settings::default()).await;
        });

        let mut saw_failure = false;
        for _ in 0..20 {
            let Ok(Some(Ok(frame))) =
                tokio::time::timeout(Duration::from_millis(500), stream.next()).await
            else {
                break;
            };
            let text = String::from_utf8_lossy(&frame).into_owned();
            if text.contains("start_failed") {
                saw_failure = true;
                break;
            }
        }
        assert!(saw_failure);
    }
}
