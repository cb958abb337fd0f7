#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::json;

use common::{
    TOPIC, app, authenticate, device_request, operator_request, parse_plist, report,
};
use mdmgate_crypto::certs::generate_push_cert;

async fn load_push_cert(app: &common::TestApp) {
    let cert = generate_push_cert(TOPIC, 365).unwrap();
    let (status, _) = app
        .send_json(operator_request(
            Method::PUT,
            "/api/push_certificates/default",
            &app.admin,
            Some(json!({"certificate": cert.cert_pem, "private_key": cert.key_pem})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
}

async fn add_command(app: &common::TestApp, udid: &str, request_type: &str) -> String {
    let (status, command) = app
        .send_json(operator_request(
            Method::POST,
            &format!("/api/devices/{udid}/commands"),
            &app.admin,
            Some(json!({"request_type": request_type, "payload": {"Queries": ["UDID"]}})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{command}");
    assert_eq!(command["status"], "queued");
    command["uuid"].as_str().unwrap().to_string()
}

fn command_uuid(body: &[u8]) -> String {
    parse_plist(body)
        .get("CommandUUID")
        .and_then(plist::Value::as_string)
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn enrollment_stores_hex_push_token() {
    let app = app().await;
    let cert = app.device("udid-1");
    app.enroll("udid-1", &cert).await;

    let device = app.state.db.get_device("udid-1").await.unwrap().unwrap();
    assert_eq!(device.push_token.as_deref(), Some("deadbeef"));
    assert_eq!(device.push_magic.as_deref(), Some("magic-1"));
    assert_eq!(device.topic.as_deref(), Some(TOPIC));
    assert_eq!(device.serial_number.as_deref(), Some("C02TEST"));
}

#[tokio::test]
async fn commands_are_delivered_in_order_until_acknowledged() {
    let app = app().await;
    let cert = app.device("udid-1");
    app.enroll("udid-1", &cert).await;
    load_push_cert(&app).await;

    let first = add_command(&app, "udid-1", "DeviceInformation").await;
    let second = add_command(&app, "udid-1", "ProfileList").await;

    // Idle twice: the in-flight command is delivered again.
    let (status, body) = app
        .send(device_request("/mdm/connect", &cert, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(command_uuid(&body), first);
    let envelope = parse_plist(&body);
    let command = envelope.get("Command").unwrap().as_dictionary().unwrap();
    assert_eq!(
        command.get("RequestType").unwrap().as_string(),
        Some("DeviceInformation")
    );

    let (_, body) = app
        .send(device_request("/mdm/connect", &cert, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(command_uuid(&body), first);

    let (status, body) = app
        .send(device_request(
            "/mdm/connect",
            &cert,
            "udid-1",
            report("udid-1", "Acknowledged", Some(&first)),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(command_uuid(&body), second);

    // A repeated acknowledgement of the first command is stale.
    let (status, _) = app
        .send(device_request(
            "/mdm/connect",
            &cert,
            "udid-1",
            report("udid-1", "Acknowledged", Some(&first)),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .send(device_request(
            "/mdm/connect",
            &cert,
            "udid-1",
            report("udid-1", "Error", Some(&second)),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (_, commands) = app
        .send_json(operator_request(
            Method::GET,
            "/api/devices/udid-1/commands",
            &app.admin,
            None,
        ))
        .await;
    assert_eq!(commands[0]["status"], "acknowledged");
    assert_eq!(commands[0]["result_status"], "Acknowledged");
    assert_eq!(commands[1]["status"], "failed");
    assert_eq!(commands[1]["ordinal"], 2);

    // Each added command woke the device.
    for _ in 0..100 {
        if app.transport.sent.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = app.transport.sent.lock().unwrap();
    assert_eq!(sent[0], (TOPIC.to_string(), "deadbeef".to_string()));
}

#[tokio::test]
async fn not_now_requeues_without_counting_an_attempt() {
    let app = app().await;
    let cert = app.device("udid-1");
    app.enroll("udid-1", &cert).await;
    let uuid = add_command(&app, "udid-1", "InstalledApplicationList").await;

    let (_, body) = app
        .send(device_request("/mdm/connect", &cert, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(command_uuid(&body), uuid);

    let (status, body) = app
        .send(device_request(
            "/mdm/connect",
            &cert,
            "udid-1",
            report("udid-1", "NotNow", Some(&uuid)),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (_, body) = app
        .send(device_request("/mdm/connect", &cert, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(command_uuid(&body), uuid);

    let command = app.state.queue.command_by_uuid(&uuid).await.unwrap().unwrap();
    assert_eq!(command.attempts, 0);
}

#[tokio::test]
async fn idle_with_empty_queue_is_empty_ok() {
    let app = app().await;
    let cert = app.device("udid-1");
    app.enroll("udid-1", &cert).await;

    let (status, body) = app
        .send(device_request("/mdm/connect", &cert, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn malformed_plist_is_bad_request() {
    let app = app().await;
    let cert = app.device("udid-1");

    let (status, _) = app
        .send(device_request(
            "/mdm/checkin",
            &cert,
            "udid-1",
            b"<plist><dict><key>".to_vec(),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_client_certificate_is_unauthorized() {
    let app = app().await;
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/mdm/checkin")
        .body(Body::from(authenticate("udid-1")))
        .unwrap();

    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_device_cannot_connect() {
    let app = app().await;
    let cert = app.device("udid-9");

    let (status, _) = app
        .send(device_request("/mdm/connect", &cert, "udid-9", report("udid-9", "Idle", None)))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn checked_out_device_is_rejected() {
    let app = app().await;
    let cert = app.device("udid-1");
    app.enroll("udid-1", &cert).await;

    let checkout = common::to_plist(vec![
        ("MessageType", plist::Value::String("CheckOut".into())),
        ("UDID", plist::Value::String("udid-1".into())),
    ]);
    let (status, _) = app
        .send(device_request("/mdm/checkin", &cert, "udid-1", checkout))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .send(device_request("/mdm/connect", &cert, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send_json(operator_request(
            Method::POST,
            "/api/devices/udid-1/commands",
            &app.admin,
            Some(json!({"request_type": "DeviceLock"})),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn another_devices_command_uuid_is_conflict() {
    let app = app().await;
    let cert_a = app.device("udid-a");
    let cert_b = app.device("udid-b");
    app.enroll("udid-a", &cert_a).await;
    app.enroll("udid-b", &cert_b).await;
    let uuid = add_command(&app, "udid-a", "DeviceInformation").await;

    let (status, _) = app
        .send(device_request(
            "/mdm/connect",
            &cert_b,
            "udid-b",
            report("udid-b", "Acknowledged", Some(&uuid)),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn enrolled_device_cannot_be_claimed_by_another_certificate() {
    let app = app().await;
    let owner = app.device("udid-1");
    app.enroll("udid-1", &owner).await;

    let intruder = app.device("udid-2");
    let (status, _) = app
        .send(device_request("/mdm/checkin", &intruder, "udid-2", authenticate("udid-1")))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let device = app.state.db.get_device("udid-1").await.unwrap().unwrap();
    assert_eq!(
        device.cert_fingerprint,
        mdmgate_crypto::fingerprint(&owner.cert_der)
    );

    let (status, _) = app
        .send(device_request("/mdm/connect", &owner, "udid-1", report("udid-1", "Idle", None)))
        .await;
    assert_eq!(status, StatusCode::OK);
}
