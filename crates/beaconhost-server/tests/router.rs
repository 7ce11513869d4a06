//! Drives the beacon host router in-process and checks the event log it
//! leaves behind.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use beaconhost_core::{read_events, Event, EventKind, EventLog, EventRecord, HostConfig};
use beaconhost_server::{router, AppState};
use serde_json::json;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;
use tower::ServiceExt;

struct TestHost {
    app: Router,
    log_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestHost {
    fn new(download: Option<&Path>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("evidence").join("beacons.jsonl");
        let config = HostConfig::resolve(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            8001,
            "/app-debug.apk",
            download,
            &log_path,
        )
        .unwrap();
        let app = router(AppState::new(config, EventLog::new(&log_path).quiet()));
        Self {
            app,
            log_path,
            _dir: dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn head(&self, uri: &str) -> Response {
        self.send(
            Request::builder()
                .method(Method::HEAD)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn post(&self, uri: &str, body: impl Into<Vec<u8>>) -> Response {
        let body = body.into();
        self.send(
            Request::post(uri)
                .header(CONTENT_LENGTH, body.len())
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    fn events(&self) -> Vec<EventRecord> {
        if !self.log_path.exists() {
            return Vec::new();
        }
        read_events(&self.log_path).unwrap()
    }

    /// Download events are appended after the body drains, off the request
    /// path, so they can land a moment after the response is read.
    async fn wait_for_events(&self, expected: usize) -> Vec<EventRecord> {
        for _ in 0..200 {
            let events = self.events();
            if events.len() >= expected {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

/// Upload that delivers a few bytes, then fails as if the peer reset.
struct BrokenUpload {
    delivered: bool,
}

impl AsyncRead for BrokenUpload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.delivered {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        self.delivered = true;
        buf.put_slice(br#"{"status":"encr"#);
        Poll::Ready(Ok(()))
    }
}

fn apk_fixture(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let file = dir.join("build.apk");
    let payload: Vec<u8> = (0..len).map(|n| (n % 251) as u8).collect();
    std::fs::write(&file, &payload).unwrap();
    (file, payload)
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_text(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

fn beacon_body(record: &EventRecord) -> &serde_json::Value {
    match &record.event {
        Event::Beacon { body, .. } => body,
        other => panic!("expected beacon, got {other:?}"),
    }
}

#[tokio::test]
async fn health_answers_ok_without_logging() {
    let host = TestHost::new(None);
    let response = host.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(body_text(response).await, "ok");
    assert!(host.events().is_empty());
    assert!(!host.log_path.exists());
}

#[tokio::test]
async fn lab_scenario_without_download_file() {
    let host = TestHost::new(None);

    let response = host.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");

    assert_eq!(host.get("/app-debug.apk").await.status(), StatusCode::NOT_FOUND);

    let response = host.post("/cb", r#"{"id":1}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");

    let events = host.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.kind(), EventKind::Beacon);
    assert_eq!(beacon_body(&events[0]), &json!({"id": 1}));

    let line = std::fs::read_to_string(&host.log_path).unwrap();
    let raw: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(raw["type"], "beacon");
    assert_eq!(raw["path"], "/cb");
    assert!(raw["ts"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn json_bodies_are_recorded_verbatim() {
    let host = TestHost::new(None);
    let bodies = [
        json!({"model": "Pixel 7", "sdkInt": 34, "status": "encrypted", "nonce": 1_700_000_000_123u64}),
        json!([1, "two", {"three": 3.5}]),
        json!("just a string"),
        json!(12),
        json!(null),
        json!({"nested": {"deep": [true, false]}}),
    ];

    for body in &bodies {
        let response = host.post("/beacon", body.to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let events = host.events();
    assert_eq!(events.len(), bodies.len());
    for (record, expected) in events.iter().zip(&bodies) {
        assert_eq!(beacon_body(record), expected);
    }
}

#[tokio::test]
async fn non_json_bodies_fall_back_to_raw_text() {
    let host = TestHost::new(None);
    host.post("/cb", "status=encrypted; not json").await;
    host.post("/cb", vec![b'o', b'k', 0xfe, b'!']).await;
    host.post("/cb", "").await;

    let events = host.events();
    assert_eq!(events.len(), 3);
    assert_eq!(beacon_body(&events[0])["_raw"], "status=encrypted; not json");
    assert_eq!(beacon_body(&events[1])["_raw"], "ok\u{fffd}!");
    assert_eq!(beacon_body(&events[2])["_raw"], "");
}

#[tokio::test]
async fn missing_content_length_reads_no_body() {
    let host = TestHost::new(None);
    let response = host
        .send(
            Request::post("/cb")
                .body(Body::from(r#"{"ignored":true}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = host.events();
    assert_eq!(events.len(), 1);
    assert_eq!(beacon_body(&events[0]), &json!({"_raw": ""}));
}

#[tokio::test]
async fn upload_failing_mid_body_still_answers_without_logging() {
    let host = TestHost::new(None);
    let request = Request::post("/cb")
        .header(CONTENT_LENGTH, 100)
        .body(Body::from_stream(ReaderStream::new(BrokenUpload {
            delivered: false,
        })))
        .unwrap();

    let response = host.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
    assert!(host.events().is_empty());
    assert!(!host.log_path.exists());

    // The host keeps serving afterwards.
    host.post("/cb", r#"{"id":2}"#).await;
    assert_eq!(host.events().len(), 1);
}

#[tokio::test]
async fn beacon_records_user_agent_remote_and_query() {
    let host = TestHost::new(None);
    let body = r#"{"status":"encrypted"}"#;
    let mut request = Request::post("/beacon?device=7")
        .header(USER_AGENT, "Locker-Beacon/1.0 (SIMULATION)")
        .header(CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 42, 0, 7], 51515))));
    host.send(request).await;

    let events = host.events();
    match &events[0].event {
        Event::Beacon {
            path,
            remote,
            user_agent,
            ..
        } => {
            assert_eq!(path, "/beacon?device=7");
            assert_eq!(remote, "10.42.0.7");
            assert_eq!(user_agent, "Locker-Beacon/1.0 (SIMULATION)");
        }
        other => panic!("expected beacon, got {other:?}"),
    }
}

#[tokio::test]
async fn timestamps_never_decrease() {
    let host = TestHost::new(None);
    for n in 0..20 {
        host.post("/cb", format!(r#"{{"n":{n}}}"#)).await;
    }
    let events = host.events();
    assert_eq!(events.len(), 20);
    assert!(events.windows(2).all(|pair| pair[0].ts <= pair[1].ts));
}

#[tokio::test]
async fn missing_download_file_is_not_found_for_get_and_head() {
    let dir = tempfile::tempdir().unwrap();
    let absent = dir.path().join("app-debug.apk");
    let host = TestHost::new(Some(&absent));

    assert_eq!(host.get("/app-debug.apk").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(host.head("/app-debug.apk").await.status(), StatusCode::NOT_FOUND);
    assert!(host.events().is_empty());

    let disabled = TestHost::new(None);
    assert_eq!(disabled.get("/app-debug.apk").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(disabled.head("/app-debug.apk").await.status(), StatusCode::NOT_FOUND);
    assert!(disabled.events().is_empty());
}

#[tokio::test]
async fn download_streams_whole_file_and_logs_once() {
    let dir = tempfile::tempdir().unwrap();
    // Spans several 64 KiB chunks with a ragged tail.
    let (file, payload) = apk_fixture(dir.path(), 300_001);
    let host = TestHost::new(Some(&file));

    let response = host.get("/app-debug.apk").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_LENGTH], payload.len().to_string().as_str());
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "application/vnd.android.package-archive"
    );
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"app-debug.apk\""
    );
    assert_eq!(body_bytes(response).await, payload);

    let events = host.wait_for_events(1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event,
        Event::download("/app-debug.apk", "unknown", payload.len() as u64)
    );
}

#[tokio::test]
async fn dropped_download_response_is_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let (file, _) = apk_fixture(dir.path(), 1_000_000);
    let host = TestHost::new(Some(&file));

    let response = host.get("/app-debug.apk").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_LENGTH], "1000000");
    drop(response);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(host.events().is_empty());
}

#[tokio::test]
async fn download_aborted_mid_stream_is_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let (file, _) = apk_fixture(dir.path(), 1_000_000);
    let host = TestHost::new(Some(&file));

    let mut body = host.get("/app-debug.apk").await.into_body();
    let frame = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx))
        .await
        .unwrap()
        .unwrap();
    let first = frame.into_data().unwrap();
    assert!(!first.is_empty() && first.len() <= 64 * 1024);
    drop(body);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(host.events().is_empty());
}

#[tokio::test]
async fn empty_download_file_is_logged_with_zero_size() {
    let dir = tempfile::tempdir().unwrap();
    let (file, _) = apk_fixture(dir.path(), 0);
    let host = TestHost::new(Some(&file));

    let response = host.get("/app-debug.apk").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_LENGTH], "0");
    assert!(body_bytes(response).await.is_empty());

    let events = host.wait_for_events(1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, Event::download("/app-debug.apk", "unknown", 0));
}

#[tokio::test]
async fn head_mirrors_download_headers_without_body_or_event() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app-debug.apk");
    std::fs::write(&file, vec![0u8; 4096]).unwrap();
    let host = TestHost::new(Some(&file));

    let response = host.head("/app-debug.apk").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_LENGTH], "4096");
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "application/vnd.android.package-archive"
    );
    assert!(body_bytes(response).await.is_empty());
    assert!(host.events().is_empty());
}

#[tokio::test]
async fn download_availability_is_checked_per_request() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app-debug.apk");
    let host = TestHost::new(Some(&file));

    assert_eq!(host.get("/app-debug.apk").await.status(), StatusCode::NOT_FOUND);
    let page = body_text(host.get("/").await).await;
    assert!(!page.contains("Download APK"));

    std::fs::write(&file, b"PK\x03\x04").unwrap();
    let response = host.get("/app-debug.apk?v=2").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"PK\x03\x04");
    let page = body_text(host.get("/index.html").await).await;
    assert!(page.contains("<a href='/app-debug.apk'>Download APK</a>"));

    let events = host.wait_for_events(1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.path(), "/app-debug.apk?v=2");
}

#[tokio::test]
async fn unmatched_routes_and_methods_still_answer_ok() {
    let host = TestHost::new(None);

    for uri in ["/wp-login.php", "/.env", "/health/extra", "/admin?x=1"] {
        let response = host.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
        assert_eq!(body_text(response).await, "ok");
    }

    let landing = host.get("/").await;
    assert_eq!(landing.status(), StatusCode::OK);
    assert_eq!(landing.headers()[CONTENT_TYPE], "text/html; charset=utf-8");

    for method in [Method::PUT, Method::DELETE, Method::OPTIONS, Method::PATCH] {
        let response = host
            .send(
                Request::builder()
                    .method(method.clone())
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "{method} /anything");
    }

    assert_eq!(host.head("/").await.status(), StatusCode::OK);
    assert!(host.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_beacons_produce_one_clean_line_each() {
    let host = TestHost::new(None);
    let clients = 48;

    let tasks: Vec<_> = (0..clients)
        .map(|client| {
            let app = host.app.clone();
            tokio::spawn(async move {
                let body = json!({"marker": format!("client-{client}"), "pad": "x".repeat(2048)})
                    .to_string();
                let request = Request::post("/cb")
                    .header(CONTENT_LENGTH, body.len())
                    .body(Body::from(body))
                    .unwrap();
                app.oneshot(request).await.unwrap().status()
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    let contents = std::fs::read_to_string(&host.log_path).unwrap();
    let mut markers: Vec<String> = contents
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["body"]["marker"].as_str().unwrap().to_string()
        })
        .collect();
    markers.sort();
    let mut expected: Vec<String> = (0..clients).map(|c| format!("client-{c}")).collect();
    expected.sort();
    assert_eq!(markers, expected);
}
