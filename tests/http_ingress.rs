use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use http_body_util::BodyExt;
use qr_attendance::{
    config::QrSettings,
    crypto::{aes, token::TokenCodec},
    events::{bus::EventBus, memory::MemoryEventBus},
    models::{
        attendance::SectionWindow,
        events::{ControlCommand, ControlEvent, ScanValidation, StartCommand, Topic},
        token::Token,
    },
    repositories::memory::MemoryAttendanceRepository,
    routes::router,
    state::AppState,
    storage::{memory::MemoryTokenStore, token_store::TokenStore},
};
use serde_json::json;
use tower::ServiceExt;

struct TestApp {
    state: AppState,
    bus: MemoryEventBus,
    store: MemoryTokenStore,
    repo: MemoryAttendanceRepository,
}

fn setup_test_app() -> TestApp {
    let bus = MemoryEventBus::new();
    let store = MemoryTokenStore::new();
    let repo = MemoryAttendanceRepository::new();
    let now = Utc::now();
    repo.add_teacher("T1")
        .add_student("St1")
        .add_student("St2")
        .add_class("C1")
        .add_module("M1")
        .enroll("St1", "S1")
        .enroll("St2", "S1")
        .set_section_window(
            "S1",
            SectionWindow {
                start: now - ChronoDuration::minutes(5),
                end: now + ChronoDuration::hours(1),
            },
        );

    let state = AppState::from_parts(
        QrSettings::default(),
        TokenCodec::new(aes::generate_key()),
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        Arc::new(repo.clone()),
    );
    TestApp {
        state,
        bus,
        store,
        repo,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router(app.state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, body)
}

fn sample_token() -> Token {
    Token::mint(&StartCommand {
        class_id: "C1".into(),
        teacher_id: "T1".into(),
        section_id: "S1".into(),
        module_id: "M1".into(),
    })
}

/// Stores a fresh token for C1 and runs a scan of it through validation.
async fn record_scan(app: &TestApp, student_id: &str) {
    let token = sample_token();
    let ciphertext = app.state.codec.encrypt(&token).unwrap();
    app.store
        .put("C1", &token.id, &ciphertext, Duration::from_secs(60))
        .await
        .unwrap();

    let payload = ScanValidation::new(&token.id, "C1", student_id, Utc::now())
        .encode()
        .unwrap();
    app.state.validation_listener().handle_message(&payload).await.unwrap();
}

fn manual_entry(student_id: &str) -> serde_json::Value {
    json!({
        "teacher_id": "T1",
        "student_id": student_id,
        "class_id": "C1",
        "section_id": "S1",
        "module_id": "M1"
    })
}

#[tokio::test]
async fn test_start_publishes_control_event() {
    let app = setup_test_app();
    let mut control = app.bus.subscribe(Topic::GenerationControl).await.unwrap();

    let (status, body) = send(
        &app,
        "POST",
        "/api/classes/C1/start",
        Some(json!({ "teacher_id": "T1", "section_id": "S1", "module_id": "M1" })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "starting");
    assert_eq!(body["class_id"], "C1");

    let payload = tokio::time::timeout(Duration::from_secs(1), control.next())
        .await
        .unwrap()
        .unwrap();
    let command = ControlEvent::decode(&payload).unwrap().into_command().unwrap();
    assert!(matches!(command, ControlCommand::Start(ref start) if start.teacher_id == "T1"));
}

#[tokio::test]
async fn test_start_with_missing_teacher_is_rejected() {
    let app = setup_test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/classes/C1/start",
        Some(json!({ "teacher_id": "", "section_id": "S1", "module_id": "M1" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_stop_publishes_control_event() {
    let app = setup_test_app();
    let mut control = app.bus.subscribe(Topic::GenerationControl).await.unwrap();

    let (status, body) = send(&app, "POST", "/api/classes/C1/stop", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "stopping");

    let payload = control.next().await.unwrap();
    let command = ControlEvent::decode(&payload).unwrap().into_command().unwrap();
    assert!(matches!(command, ControlCommand::Stop { ref class_id } if class_id == "C1"));
}

#[tokio::test]
async fn test_scan_with_valid_token_is_queued() {
    let app = setup_test_app();
    let mut scans = app.bus.subscribe(Topic::ScanValidation).await.unwrap();
    let token = sample_token();
    let ciphertext = app.state.codec.encrypt(&token).unwrap();

    let (status, body) = send(
        &app,
        "POST",
        "/api/scan",
        Some(json!({ "encrypted_token": ciphertext, "student_id": "St1" })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["message"], "Validation request submitted");

    let payload = scans.next().await.unwrap();
    let request = ScanValidation::decode(&payload).unwrap();
    assert_eq!(request.token_id, token.id);
    assert_eq!(request.class_id, "C1");
    assert_eq!(request.student_id, "St1");
}

#[tokio::test]
async fn test_scan_with_forged_token_is_rejected() {
    let app = setup_test_app();
    let other = TokenCodec::new(aes::generate_key());
    let forged = other.encrypt(&sample_token()).unwrap();

    for token in [forged.as_str(), "not-base64!", ""] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/scan",
            Some(json!({ "encrypted_token": token, "student_id": "St1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "token {:?}", token);
    }
}

#[tokio::test]
async fn test_current_token() {
    let app = setup_test_app();

    let (status, _) = send(&app, "GET", "/api/classes/C1/token", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.store
        .set_current("C1", "ciphertext", Duration::from_secs(60))
        .await
        .unwrap();
    let (status, body) = send(&app, "GET", "/api/classes/C1/token", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["encrypted_token"], "ciphertext");
}

#[tokio::test]
async fn test_manual_attendance() {
    let app = setup_test_app();
    let entry = manual_entry("St1");

    let (status, body) = send(&app, "POST", "/api/attendance/manual", Some(entry.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["manual"], true);
    assert_eq!(body["student_id"], "St1");

    let (status, _) = send(&app, "POST", "/api/attendance/manual", Some(entry)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_active_classes() {
    let app = setup_test_app();
    let (status, body) = send(&app, "GET", "/api/classes/active", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["classes"], json!([]));

    app.state
        .generator()
        .start(StartCommand {
            class_id: "C1".into(),
            teacher_id: "T1".into(),
            section_id: "S1".into(),
            module_id: "M1".into(),
        })
        .await
        .unwrap();

    let (_, body) = send(&app, "GET", "/api/classes/active", None).await;
    assert_eq!(body["classes"], json!(["C1"]));
    app.state.shutdown.cancel();
}

#[tokio::test]
async fn test_scanned_attendance_reads_back() {
    let app = setup_test_app();
    record_scan(&app, "St1").await;
    let (status, _) = send(&app, "POST", "/api/attendance/manual", Some(manual_entry("St2"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "GET", "/api/attendance?section_id=S1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["section_id"], "S1");
    assert_eq!(body["records"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, "GET", "/api/attendance?section_id=S1&student_id=St1", None).await;
    assert_eq!(status, StatusCode::OK);
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["student_id"], "St1");
    assert_eq!(records[0]["module_id"], "M1");
    assert_eq!(records[0]["manual"], false);

    let (status, body) = send(&app, "GET", "/api/attendance?section_id=S9", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], json!([]));
}

#[tokio::test]
async fn test_attendance_listing_requires_section() {
    let app = setup_test_app();
    let (status, _) = send(&app, "GET", "/api/attendance", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/api/attendance?section_id=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deleting_manual_attendance_keeps_scans() {
    let app = setup_test_app();
    record_scan(&app, "St1").await;
    let (status, _) = send(&app, "POST", "/api/attendance/manual", Some(manual_entry("St2"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "DELETE", "/api/attendance/manual?section_id=S1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["section_id"], "S1");
    assert_eq!(body["deleted"], 1);

    let attendance = app.repo.attendance();
    assert_eq!(attendance.len(), 1);
    assert_eq!(attendance[0].student_id, "St1");
    assert!(!attendance[0].manual);

    let (_, body) = send(&app, "DELETE", "/api/attendance/manual?section_id=S1", None).await;
    assert_eq!(body["deleted"], 0);
}
