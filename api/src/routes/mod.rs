pub mod assets;
pub mod auth;
pub mod uploads;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;
use crate::services::error::LogErr;

/// Build all routes for the API
pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(uploads::routes())
        .merge(assets::routes())
}

/// GET /health - Fails when the session store is unreachable
async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    state
        .uploads
        .store
        .get("health:probe")
        .await
        .log_500("health check: session store unreachable")?;
    Ok(Json(json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jobs::JobStore;
    use crate::domain::merge::MergeCommitter;
    use crate::domain::uploads::tests::{Fixture, fixture, fixture_with};
    use crate::models::JobStatus;
    use crate::services::kv::MemoryKvStore;
    use crate::services::plans::FixedPlan;
    use crate::services::throttle::{ChunkThrottle, ThrottleConfig};
    use crate::storage::BlobStore;
    use crate::worker::JobDispatcher;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Records dispatched job ids instead of running them
    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<String>>,
    }

    impl JobDispatcher for RecordingDispatcher {
        fn dispatch(&self, job_id: String) {
            self.dispatched.lock().unwrap().push(job_id);
        }
    }

    struct TestApp {
        router: Router,
        fixture: Fixture,
        jobs: Arc<JobStore>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn app_from(fixture: Fixture) -> TestApp {
        app_with_throttle(
            fixture,
            ThrottleConfig {
                burst: 1000,
                per_second: 1000.0,
            },
        )
    }

    fn app_with_throttle(fixture: Fixture, throttle: ThrottleConfig) -> TestApp {
        let jobs = Arc::new(JobStore::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(3600),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = Arc::new(AppState {
            uploads: fixture.manager.clone(),
            committer: Arc::new(MergeCommitter::new(fixture.manager.clone(), None)),
            jobs: jobs.clone(),
            dispatcher: dispatcher.clone(),
            assets: fixture.assets.clone(),
            blobs: fixture.blobs.clone(),
            throttle: Arc::new(ChunkThrottle::new(throttle)),
        });
        TestApp {
            router: build_routes().with_state(state),
            fixture,
            jobs,
            dispatcher,
        }
    }

    fn app() -> TestApp {
        app_from(fixture())
    }

    async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
        let resp = app.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body, headers)
    }

    fn json_request(method: &str, uri: &str, user: i64, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str, user: i64) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user.to_string())
            .body(Body::empty())
            .unwrap()
    }

    fn chunk_request(upload_id: &str, user: i64, index: u32, data: &[u8]) -> Request<Body> {
        let boundary = "lectern-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"chunk_index\"\r\n\r\n{i}\r\n\
                 --{b}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                b = boundary,
                i = index
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        Request::builder()
            .method("POST")
            .uri(format!("/uploads/{}/chunks", upload_id))
            .header("x-user-id", user.to_string())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn start(app: &TestApp, size: u64, chunks: u32) -> String {
        let (status, body, _) = send(
            app,
            json_request(
                "POST",
                "/uploads",
                1,
                json!({
                    "file_name": "week1.mp4",
                    "file_size": size,
                    "total_chunks": chunks,
                    "file_type": "video/mp4",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["upload_id"].as_str().unwrap().to_string()
    }

    /// Uploads `parts` out of order and commits, returning the asset id
    async fn committed_asset(app: &TestApp, parts: &[&[u8]]) -> i64 {
        let size = parts.iter().map(|p| p.len() as u64).sum();
        let id = start(app, size, parts.len() as u32).await;
        for (i, part) in parts.iter().enumerate().rev() {
            let (status, _, _) = send(app, chunk_request(&id, 1, i as u32, part)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body, _) =
            send(app, empty_request("POST", &format!("/uploads/{}/complete", id), 1)).await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let app = app();
        let req = Request::builder()
            .method("POST")
            .uri("/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upload_protocol_end_to_end() {
        let app = app();
        let id = start(&app, 9, 3).await;

        let (status, body, _) = send(&app, chunk_request(&id, 1, 2, b"ghi")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "uploaded_chunks": 1, "total_chunks": 3 }));

        // early completion is rejected and leaves the session usable
        let (status, body, _) =
            send(&app, empty_request("POST", &format!("/uploads/{}/complete", id), 1)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "incomplete_upload");

        send(&app, chunk_request(&id, 1, 0, b"abc")).await;
        send(&app, chunk_request(&id, 1, 1, b"def")).await;

        let (status, body, _) =
            send(&app, empty_request("GET", &format!("/uploads/{}/status", id), 1)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uploaded_chunks"], 3);
        assert_eq!(body["file_name"], "week1.mp4");

        let (status, body, _) =
            send(&app, empty_request("POST", &format!("/uploads/{}/complete", id), 1)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["byte_size"], 9);
        let key = body["storage_key"].as_str().unwrap();
        let merged = app.fixture.blobs.get(key).await.unwrap();
        assert_eq!(&merged[..], b"abcdefghi");

        // the session is gone after commit
        let (status, body, _) =
            send(&app, empty_request("GET", &format!("/uploads/{}/status", id), 1)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn test_start_rejections() {
        let app = app();
        let (status, body, _) = send(
            &app,
            json_request(
                "POST",
                "/uploads",
                1,
                json!({ "file_name": "x.pdf", "file_size": 10, "total_chunks": 1, "file_type": "application/pdf" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unsupported_media_type");

        let app = app_from(fixture_with(
            FixedPlan {
                limit_mb: 1,
                used_mb: 1,
            },
            Duration::from_secs(60),
        ));
        let (status, body, _) = send(
            &app,
            json_request(
                "POST",
                "/uploads",
                1,
                json!({ "file_name": "x.mp4", "file_size": 10, "total_chunks": 1, "file_type": "video/mp4" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["used_mb"], 1);
        assert_eq!(body["incoming_mb"], 1);
        assert_eq!(body["limit_mb"], 1);
    }

    #[tokio::test]
    async fn test_chunk_throttle_sets_retry_after() {
        let app = app_with_throttle(
            fixture(),
            ThrottleConfig {
                burst: 1,
                per_second: 0.5,
            },
        );
        let id = start(&app, 4, 2).await;

        let (status, _, _) = send(&app, chunk_request(&id, 1, 0, b"ab")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body, headers) = send(&app, chunk_request(&id, 1, 1, b"cd")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(headers[header::RETRY_AFTER], "2");

        // the refused chunk was never stored
        let (_, body, _) =
            send(&app, empty_request("GET", &format!("/uploads/{}/status", id), 1)).await;
        assert_eq!(body["uploaded_chunks"], 1);
    }

    #[tokio::test]
    async fn test_chunk_errors() {
        let app = app();
        let (status, _, _) = send(&app, chunk_request("missing", 1, 0, b"x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = start(&app, 4, 2).await;
        let (status, body, _) = send(&app, chunk_request(&id, 1, 5, b"x")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_chunk_index");

        // another user cannot see the session
        let (status, _, _) = send(&app, chunk_request(&id, 2, 0, b"x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_always_succeeds() {
        let app = app();
        let id = start(&app, 4, 2).await;
        send(&app, chunk_request(&id, 1, 0, b"ab")).await;

        for _ in 0..2 {
            let (status, _, _) =
                send(&app, empty_request("DELETE", &format!("/uploads/{}", id), 1)).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        assert!(app.fixture.blobs.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_transcription_request_is_deduplicated() {
        let app = app();
        let asset_id = committed_asset(&app, &[b"audio"]).await;
        let uri = format!("/assets/{}/transcriptions", asset_id);

        let (status, first, _) = send(&app, empty_request("POST", &uri, 1)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["status"], "pending");
        assert_eq!(first["progress"], 0);

        let (_, second, _) = send(&app, empty_request("POST", &uri, 1)).await;
        assert_eq!(first["job_id"], second["job_id"]);

        // only the creating request dispatches
        assert_eq!(app.dispatcher.dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transcription_status_views() {
        let app = app();
        let asset_id = committed_asset(&app, &[b"audio"]).await;
        let status_uri = format!("/assets/{}/transcriptions/status", asset_id);

        let (status, body, _) = send(&app, empty_request("GET", &status_uri, 1)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "job_not_found");

        let (_, accepted, _) = send(
            &app,
            empty_request("POST", &format!("/assets/{}/transcriptions", asset_id), 1),
        )
        .await;
        let job_id = accepted["job_id"].as_str().unwrap().to_string();

        app.jobs.claim(&job_id).await.unwrap();
        let (_, body, _) = send(&app, empty_request("GET", &status_uri, 1)).await;
        assert_eq!(body["status"], "processing");
        assert_eq!(body["current_step"], "preparing");
        assert!(body.get("transcript").is_none());

        app.jobs.complete(&job_id, "hello".into()).await.unwrap();
        let (_, body, _) = send(&app, empty_request("GET", &status_uri, 1)).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["progress"], 100);
        assert_eq!(body["transcript"], "hello");
        assert!(body.get("error").is_none());
        assert_eq!(
            app.jobs.get(&job_id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_foreign_asset_is_hidden() {
        let app = app();
        let asset_id = committed_asset(&app, &[b"audio"]).await;

        let (status, _, _) =
            send(&app, empty_request("GET", &format!("/assets/{}", asset_id), 2)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(
            &app,
            empty_request("POST", &format!("/assets/{}/transcriptions", asset_id), 2),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_media_range_reads() {
        let app = app();
        let asset_id = committed_asset(&app, &[b"0123", b"456789"]).await;
        let uri = format!("/assets/{}/media", asset_id);

        let resp = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&uri)
                    .header("x-user-id", "1")
                    .header(header::RANGE, "bytes=2-5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "4");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"2345");

        let resp = app
            .router
            .clone()
            .oneshot(empty_request("GET", &uri, 1))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "10");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"0123456789");

        let resp = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&uri)
                    .header("x-user-id", "1")
                    .header(header::RANGE, "bytes=50-")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn test_duration_backfill_and_delete() {
        let app = app();
        let asset_id = committed_asset(&app, &[b"audio"]).await;
        let uri = format!("/assets/{}/duration", asset_id);

        let (status, _, _) =
            send(&app, json_request("PATCH", &uri, 1, json!({ "duration_secs": -1.0 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body, _) =
            send(&app, json_request("PATCH", &uri, 1, json!({ "duration_secs": 93.5 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["duration_secs"], 93.5);

        let asset_uri = format!("/assets/{}", asset_id);
        let (status, _, _) = send(&app, empty_request("DELETE", &asset_uri, 1)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(app.fixture.blobs.keys().await.is_empty());

        let (status, _, _) = send(&app, empty_request("GET", &asset_uri, 1)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
