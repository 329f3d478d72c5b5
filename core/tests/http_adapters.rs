use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use printfleet_core::{
    AdapterSet, AdapterTimeouts, BackoffTracker, ConcurrencyLimiter, Device, Endpoint, Error,
    MoonrakerAdapter, OperationalState, PrinterAdapter, ProtocolKind, PrusaLinkAdapter,
    StatusPoller, UploadRequest,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const MAKER_SECRET: &str = "Basic bWFrZXI6c2VjcmV0";

#[derive(Default)]
struct Seen(Mutex<Vec<String>>);

impl Seen {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("seen lock").push(entry.into());
    }

    fn all(&self) -> Vec<String> {
        self.0.lock().expect("seen lock").clone()
    }
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let address = listener.local_addr().expect("local address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{address}")
}

async fn unused_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let address = listener.local_addr().expect("local address");
    drop(listener);
    format!("http://{address}")
}

fn header_value<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn multipart_file_name(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let start = text.find("filename=\"")? + "filename=\"".len();
    let end = text[start..].find('"')?;
    Some(text[start..start + end].to_string())
}

struct PrusaState {
    printer: Value,
    job: Option<Value>,
    accept_binary: bool,
    seen: Seen,
}

async fn prusa_printer(State(state): State<Arc<PrusaState>>, headers: HeaderMap) -> Response {
    if header_value(&headers, header::AUTHORIZATION) != MAKER_SECRET {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.printer.clone()).into_response()
}

async fn prusa_job(State(state): State<Arc<PrusaState>>, headers: HeaderMap) -> Response {
    if header_value(&headers, header::AUTHORIZATION) != MAKER_SECRET {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match &state.job {
        Some(job) => Json(job.clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn prusa_cancel(
    State(state): State<Arc<PrusaState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.seen.push(format!("job {}", body["command"].as_str().unwrap_or_default()));
    StatusCode::NO_CONTENT
}

async fn prusa_upload(
    State(state): State<Arc<PrusaState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    if header_value(&headers, header::AUTHORIZATION) != MAKER_SECRET {
        state.seen.push("unauthorized");
        return StatusCode::UNAUTHORIZED;
    }
    let content_type = header_value(&headers, header::CONTENT_TYPE);
    if content_type.starts_with("multipart/form-data") {
        let name = multipart_file_name(&body).unwrap_or_default();
        state.seen.push(format!("multipart {name}"));
        return StatusCode::CREATED;
    }
    if !state.accept_binary {
        state.seen.push("binary rejected");
        return StatusCode::UNSUPPORTED_MEDIA_TYPE;
    }
    let name = query.get("filename").cloned().unwrap_or_default();
    state.seen.push(format!("binary {name} {}", body.len()));
    StatusCode::CREATED
}

async fn prusa_select(
    State(state): State<Arc<PrusaState>>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.seen.push(format!(
        "{} {name} print={}",
        body["command"].as_str().unwrap_or_default(),
        body["print"]
    ));
    StatusCode::NO_CONTENT
}

async fn prusa_version() -> Json<Value> {
    Json(json!({"api": "2.0.0", "server": "2.1.2", "text": "PrusaLink", "hostname": "mk4-bay1"}))
}

async fn prusalink_server(printer: Value, job: Option<Value>, accept_binary: bool) -> (String, Arc<PrusaState>) {
    let state = Arc::new(PrusaState {
        printer,
        job,
        accept_binary,
        seen: Seen::default(),
    });
    let router = Router::new()
        .route("/api/printer", get(prusa_printer))
        .route("/api/job", get(prusa_job).post(prusa_cancel))
        .route("/api/files/local", post(prusa_upload))
        .route("/api/files/local/{name}", post(prusa_select))
        .route("/api/version", get(prusa_version))
        .with_state(state.clone());
    (serve(router).await, state)
}

fn prusa_device(base_url: &str) -> Device {
    Device::new("mk4", ProtocolKind::PrusaLink, Endpoint::http(base_url)).with_credential("secret")
}

fn printing_printer() -> Value {
    json!({
        "state": {"text": "Printing", "flags": {"printing": true, "ready": false}},
        "temperature": {"bed": {"actual": 60.1}, "tool0": {"actual": 214.8}}
    })
}

fn prusalink() -> PrusaLinkAdapter {
    PrusaLinkAdapter::new(AdapterTimeouts::default()).expect("client")
}

#[tokio::test]
async fn prusalink_reports_printing_job() {
    let job = json!({
        "state": "PRINTING",
        "time_printing": 120,
        "progress": {"printTimeLeft": 300},
        "file": {"display_name": "cube.bgcode", "refs": {"thumbnail": "/thumb/l/usb/CUBE~1.BGC"}}
    });
    let (base, _) = prusalink_server(printing_printer(), Some(job), true).await;

    let snapshot = prusalink()
        .fetch_status(&prusa_device(&base))
        .await
        .expect("status");

    assert_eq!(snapshot.state, OperationalState::Printing);
    assert_eq!(snapshot.bed_temp_c, Some(60.1));
    assert_eq!(snapshot.tool_temp_c, Some(214.8));
    assert_eq!(snapshot.elapsed_seconds, Some(120));
    assert_eq!(snapshot.remaining_seconds, Some(300));
    assert_eq!(snapshot.job_file_name.as_deref(), Some("cube.bgcode"));
    assert_eq!(
        snapshot.preview_image_url,
        Some(format!("{base}/thumb/l/usb/CUBE~1.BGC"))
    );
}

#[tokio::test]
async fn prusalink_treats_no_content_job_as_idle() {
    let printer = json!({
        "state": {"text": "Operational", "flags": {"printing": false, "ready": true}},
        "temperature": {"bed": {"actual": 23.0}, "tool0": {"actual": 25.5}}
    });
    let (base, _) = prusalink_server(printer, None, true).await;

    let snapshot = prusalink()
        .fetch_status(&prusa_device(&base))
        .await
        .expect("status");

    assert_eq!(snapshot.state, OperationalState::Idle);
    assert_eq!(snapshot.bed_temp_c, Some(23.0));
    assert_eq!(snapshot.job_file_name, None);
    assert_eq!(snapshot.progress, None);
}

#[tokio::test]
async fn prusalink_wrong_secret_is_auth_error() {
    let (base, state) = prusalink_server(printing_printer(), None, true).await;
    let device = Device::new("mk4", ProtocolKind::PrusaLink, Endpoint::http(&base))
        .with_credential("wrong");
    let adapter = prusalink();

    let status = adapter.fetch_status(&device).await;
    assert!(matches!(status, Err(Error::Auth { status: 401, .. })));

    let upload = adapter
        .upload(
            &device,
            UploadRequest {
                remote_name: "cube_1.bgcode".to_string(),
                data: b"GCDE".to_vec(),
            },
        )
        .await;
    assert!(matches!(upload, Err(Error::Auth { .. })));
    assert_eq!(state.seen.all(), vec!["unauthorized"]);
}

#[tokio::test]
async fn prusalink_uploads_binary_body() {
    let (base, state) = prusalink_server(printing_printer(), None, true).await;

    let uploaded = prusalink()
        .upload(
            &prusa_device(&base),
            UploadRequest {
                remote_name: "cube_1.bgcode".to_string(),
                data: b"GCDE0001".to_vec(),
            },
        )
        .await
        .expect("upload");

    assert_eq!(uploaded.bytes, 8);
    assert_eq!(state.seen.all(), vec!["binary cube_1.bgcode 8"]);
}

#[tokio::test]
async fn prusalink_falls_back_to_multipart() {
    let (base, state) = prusalink_server(printing_printer(), None, false).await;

    prusalink()
        .upload(
            &prusa_device(&base),
            UploadRequest {
                remote_name: "cube_1.bgcode".to_string(),
                data: b"GCDE0001".to_vec(),
            },
        )
        .await
        .expect("upload");

    assert_eq!(
        state.seen.all(),
        vec!["binary rejected", "multipart cube_1.bgcode"]
    );
}

#[tokio::test]
async fn prusalink_server_error_is_not_retried_as_multipart() {
    let seen = Arc::new(Seen::default());
    let router = Router::new()
        .route(
            "/api/files/local",
            post(|State(seen): State<Arc<Seen>>, headers: HeaderMap| async move {
                seen.push(header_value(&headers, header::CONTENT_TYPE).to_string());
                StatusCode::SERVICE_UNAVAILABLE
            }),
        )
        .with_state(seen.clone());
    let base = serve(router).await;

    let error = prusalink()
        .upload(
            &prusa_device(&base),
            UploadRequest {
                remote_name: "cube_1.bgcode".to_string(),
                data: b"GCDE0001".to_vec(),
            },
        )
        .await
        .expect_err("storage busy");

    assert!(matches!(error, Error::Http { status: 503, .. }), "{error:?}");
    assert_eq!(seen.all(), vec!["application/octet-stream"]);
}

#[tokio::test]
async fn prusalink_starts_and_cancels_prints() {
    let (base, state) = prusalink_server(printing_printer(), None, true).await;
    let adapter = prusalink();
    let device = prusa_device(&base);

    adapter
        .start_print(&device, "my part_1.bgcode")
        .await
        .expect("start");
    adapter.stop_print(&device).await.expect("stop");

    assert_eq!(
        state.seen.all(),
        vec!["select my part_1.bgcode print=true", "job cancel"]
    );
}

#[tokio::test]
async fn prusalink_connection_check_reads_version() {
    let (base, _) = prusalink_server(printing_printer(), None, true).await;

    let info = prusalink()
        .test_connection(&prusa_device(&base))
        .await
        .expect("version");

    assert_eq!(info.protocol, ProtocolKind::PrusaLink);
    assert_eq!(info.version.as_deref(), Some("2.1.2"));
    assert_eq!(info.hostname.as_deref(), Some("mk4-bay1"));
}

#[tokio::test]
async fn unreachable_device_is_connection_error() {
    let base = unused_base_url().await;

    let error = prusalink()
        .fetch_status(&prusa_device(&base))
        .await
        .expect_err("nothing listens there");

    assert!(error.is_connection(), "{error:?}");
}

struct MoonState {
    status: Value,
    thumbnails: Option<Value>,
    api_key: Option<&'static str>,
    delay: Option<Duration>,
    seen: Seen,
}

impl MoonState {
    fn new(status: Value) -> Self {
        Self {
            status,
            thumbnails: None,
            api_key: None,
            delay: None,
            seen: Seen::default(),
        }
    }

    fn rejects(&self, headers: &HeaderMap) -> bool {
        self.api_key
            .is_some_and(|key| header_value(headers, header::HeaderName::from_static("x-api-key")) != key)
    }
}

async fn moon_query(State(state): State<Arc<MoonState>>, headers: HeaderMap) -> Response {
    if state.rejects(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }
    Json(json!({"result": {"eventtime": 1234.5, "status": state.status.clone()}})).into_response()
}

async fn moon_metadata(
    State(state): State<Arc<MoonState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.seen.push(format!(
        "metadata {}",
        query.get("filename").cloned().unwrap_or_default()
    ));
    match &state.thumbnails {
        Some(thumbnails) => Json(json!({"result": {"thumbnails": thumbnails.clone()}})).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn moon_upload(State(state): State<Arc<MoonState>>, body: Bytes) -> Json<Value> {
    let text = String::from_utf8_lossy(&body);
    let root = if text.contains("name=\"root\"") && text.contains("gcodes") {
        "gcodes"
    } else {
        "?"
    };
    let name = multipart_file_name(&body).unwrap_or_default();
    state.seen.push(format!("upload {root} {name}"));
    Json(json!({"item": {"path": name, "root": "gcodes"}, "action": "create_file"}))
}

async fn moon_start(State(state): State<Arc<MoonState>>, Json(body): Json<Value>) -> Json<Value> {
    state.seen.push(format!(
        "start {}",
        body["filename"].as_str().unwrap_or_default()
    ));
    Json(json!({"result": "ok"}))
}

async fn moon_cancel(State(state): State<Arc<MoonState>>) -> Json<Value> {
    state.seen.push("cancel");
    Json(json!({"result": "ok"}))
}

async fn moon_gcode(State(state): State<Arc<MoonState>>, Json(body): Json<Value>) -> Json<Value> {
    state.seen.push(format!(
        "gcode {}",
        body["script"].as_str().unwrap_or_default()
    ));
    Json(json!({"result": "ok"}))
}

async fn moon_info() -> Json<Value> {
    Json(json!({"result": {"klippy_state": "ready", "moonraker_version": "v0.9.3-12", "hostname": "voron"}}))
}

async fn moonraker_server(state: MoonState) -> (String, Arc<MoonState>) {
    let state = Arc::new(state);
    let router = Router::new()
        .route("/printer/objects/query", get(moon_query))
        .route("/server/files/metadata", get(moon_metadata))
        .route("/server/files/upload", post(moon_upload))
        .route("/printer/print/start", post(moon_start))
        .route("/printer/print/cancel", post(moon_cancel))
        .route("/printer/gcode/script", post(moon_gcode))
        .route("/server/info", get(moon_info))
        .with_state(state.clone());
    (serve(router).await, state)
}

fn moon_device(base_url: &str) -> Device {
    Device::new("voron", ProtocolKind::Moonraker, Endpoint::http(base_url))
}

fn moonraker() -> MoonrakerAdapter {
    MoonrakerAdapter::new(AdapterTimeouts::default()).expect("client")
}

fn printing_status() -> Value {
    json!({
        "print_stats": {"state": "printing", "filename": "parts/bracket.gcode", "print_duration": 600.0},
        "heater_bed": {"temperature": 59.9, "target": 60.0},
        "extruder": {"temperature": 240.2, "target": 240.0},
        "display_status": {"progress": 0.25}
    })
}

#[tokio::test]
async fn moonraker_complete_job_reads_idle() {
    let status = json!({
        "print_stats": {"state": "complete", "filename": "old.gcode", "print_duration": 3600.0},
        "heater_bed": {"temperature": 31.2},
        "extruder": {"temperature": 40.0},
        "display_status": {"progress": 1.0}
    });
    let (base, state) = moonraker_server(MoonState::new(status)).await;

    let snapshot = moonraker()
        .fetch_status(&moon_device(&base))
        .await
        .expect("status");

    assert_eq!(snapshot.state, OperationalState::Idle);
    assert_eq!(snapshot.bed_temp_c, Some(31.2));
    assert_eq!(snapshot.job_file_name, None);
    assert_eq!(snapshot.progress, None);
    assert_eq!(snapshot.elapsed_seconds, None);
    assert_eq!(snapshot.remaining_seconds, None);
    assert!(state.seen.all().is_empty());
}

#[tokio::test]
async fn moonraker_printing_estimates_remaining_and_preview() {
    let mut state = MoonState::new(printing_status());
    state.thumbnails = Some(json!([
        {"width": 32, "height": 32, "relative_path": ".thumbs/bracket-32x32.png"},
        {"width": 300, "height": 300, "relative_path": ".thumbs/bracket-300x300.png"}
    ]));
    let (base, state) = moonraker_server(state).await;

    let snapshot = moonraker()
        .fetch_status(&moon_device(&base))
        .await
        .expect("status");

    assert_eq!(snapshot.state, OperationalState::Printing);
    assert_eq!(snapshot.elapsed_seconds, Some(600));
    assert_eq!(snapshot.remaining_seconds, Some(1800));
    assert_eq!(snapshot.job_file_name.as_deref(), Some("parts/bracket.gcode"));
    assert_eq!(
        snapshot.preview_image_url,
        Some(format!("{base}/server/files/gcodes/parts/.thumbs/bracket-300x300.png"))
    );
    assert_eq!(state.seen.all(), vec!["metadata parts/bracket.gcode"]);
}

#[tokio::test]
async fn moonraker_missing_metadata_keeps_status() {
    let (base, _) = moonraker_server(MoonState::new(printing_status())).await;

    let snapshot = moonraker()
        .fetch_status(&moon_device(&base))
        .await
        .expect("status");

    assert_eq!(snapshot.state, OperationalState::Printing);
    assert_eq!(snapshot.preview_image_url, None);
}

#[tokio::test]
async fn moonraker_sends_api_key() {
    let mut state = MoonState::new(printing_status());
    state.api_key = Some("abc123");
    let (base, _) = moonraker_server(state).await;
    let adapter = moonraker();

    let rejected = adapter.fetch_status(&moon_device(&base)).await;
    assert!(matches!(rejected, Err(Error::Auth { status: 401, .. })));

    let accepted = adapter
        .fetch_status(&moon_device(&base).with_credential("abc123"))
        .await
        .expect("status with key");
    assert_eq!(accepted.state, OperationalState::Printing);
}

#[tokio::test]
async fn moonraker_uploads_then_starts() {
    let (base, state) = moonraker_server(MoonState::new(printing_status())).await;
    let adapter = moonraker();
    let device = moon_device(&base);

    let uploaded = adapter
        .upload(
            &device,
            UploadRequest {
                remote_name: "cube_1-0.gcode".to_string(),
                data: b"G28\n".to_vec(),
            },
        )
        .await
        .expect("upload");
    adapter
        .start_print(&device, &uploaded.remote_name)
        .await
        .expect("start");
    adapter.stop_print(&device).await.expect("cancel");

    assert_eq!(
        state.seen.all(),
        vec!["upload gcodes cube_1-0.gcode", "start cube_1-0.gcode", "cancel"]
    );
}

#[tokio::test]
async fn moonraker_runs_console_gcode() {
    let mut state = MoonState::new(printing_status());
    state.api_key = Some("abc123");
    let (base, state) = moonraker_server(state).await;
    let device = moon_device(&base).with_credential("abc123");

    moonraker()
        .send_gcode(&device, "G28\nM117 homed")
        .await
        .expect("gcode");

    assert_eq!(state.seen.all(), vec!["gcode G28\nM117 homed"]);
}

#[tokio::test]
async fn prusalink_has_no_console_gcode() {
    let (base, state) = prusalink_server(printing_printer(), None, true).await;

    let error = PrinterAdapter::send_gcode(&prusalink(), &prusa_device(&base), "G28")
        .await
        .expect_err("no console endpoint");

    assert!(matches!(
        error,
        Error::Unsupported {
            protocol: ProtocolKind::PrusaLink,
            ..
        }
    ));
    assert!(state.seen.all().is_empty());
}

#[tokio::test]
async fn moonraker_same_answer_gives_same_snapshot() {
    let mut state = MoonState::new(printing_status());
    state.thumbnails = Some(json!([
        {"width": 300, "height": 300, "relative_path": ".thumbs/bracket-300x300.png"}
    ]));
    let (base, _) = moonraker_server(state).await;
    let adapter = moonraker();
    let device = moon_device(&base);

    let first = adapter.fetch_status(&device).await.expect("first poll");
    let mut second = adapter.fetch_status(&device).await.expect("second poll");
    second.captured_at = first.captured_at;

    assert_eq!(first, second);
}

#[tokio::test]
async fn moonraker_connection_check_reads_server_info() {
    let (base, _) = moonraker_server(MoonState::new(printing_status())).await;

    let info = moonraker()
        .test_connection(&moon_device(&base))
        .await
        .expect("server info");

    assert_eq!(info.version.as_deref(), Some("v0.9.3-12"));
    assert_eq!(info.hostname.as_deref(), Some("voron"));
}

#[tokio::test]
async fn moonraker_slow_answer_times_out() {
    let mut state = MoonState::new(printing_status());
    state.delay = Some(Duration::from_secs(3));
    let (base, _) = moonraker_server(state).await;
    let adapter = MoonrakerAdapter::new(AdapterTimeouts {
        status_secs: 1,
        ..AdapterTimeouts::default()
    })
    .expect("client");

    let error = adapter
        .fetch_status(&moon_device(&base))
        .await
        .expect_err("deadline passes first");

    assert!(matches!(error, Error::Timeout { timeout_ms: 1000, .. }), "{error:?}");
    assert!(error.is_connection());
}

#[tokio::test]
async fn poller_backs_off_unreachable_http_device() {
    let base = unused_base_url().await;
    let device = prusa_device(&base);
    let poller = StatusPoller::new(
        AdapterSet::new().with(Arc::new(prusalink())),
        Arc::new(BackoffTracker::new()),
        ConcurrencyLimiter::new("poll", 5),
        Duration::from_secs(30),
    );

    let updates = poller.poll_all(std::slice::from_ref(&device)).await;

    assert_eq!(
        updates[0].snapshot().map(|snapshot| snapshot.state),
        Some(OperationalState::Offline)
    );
    assert_eq!(
        poller.backoff().active(tokio::time::Instant::now()),
        vec![device.id.clone()]
    );
}
