#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use plist::{Dictionary, Value};
use tower::ServiceExt;

use mdmgate_core::ServerConfig;
use mdmgate_crypto::certs::{CaBundle, CertBundle, generate_device_cert, generate_root_ca};
use mdmgate_server::auth::operator::permission;
use mdmgate_server::http::{self, AppState};
use mdmgate_server::push::{PushTarget, PushTransport, TransportError};
use mdmgate_server::storage::{MdmDatabase, PushCertificateRecord};

pub const TOPIC: &str = "com.apple.mgmt.External.test";
pub const JWT_SECRET: &str = "integration-secret";

/// Push transport that accepts everything and remembers the tokens.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(
        &self,
        certificate: &PushCertificateRecord,
        target: &PushTarget<'_>,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((certificate.topic.clone(), target.token.to_string()));
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub ca: CaBundle,
    pub transport: Arc<RecordingTransport>,
    /// Token carrying every operator permission.
    pub admin: String,
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.api.jwt_secret = JWT_SECRET.to_string();
    config.server.public_url = "https://mdm.example.com/".to_string();
    config.push.initial_delay_ms = 0;
    config.push.max_delay_ms = 0;
    config
}

pub async fn app() -> TestApp {
    app_with(test_config()).await
}

pub async fn app_with(config: ServerConfig) -> TestApp {
    let db = MdmDatabase::open_in_memory().await.unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let state = AppState::build(&config, db, Arc::clone(&transport) as Arc<dyn PushTransport>)
        .unwrap();

    let ca = generate_root_ca("Integration MDM").unwrap();
    state.credentials.load_trust_chain(&ca.cert_pem).unwrap();

    let admin = state
        .jwt
        .issue_token("admin", permission::ALL, 3600)
        .unwrap();
    let router = http::router(state.clone(), config.server.max_body_bytes);

    TestApp {
        state,
        router,
        ca,
        transport,
        admin,
    }
}

impl TestApp {
    pub fn device(&self, udid: &str) -> CertBundle {
        generate_device_cert(&self.ca, udid).unwrap()
    }

    pub fn token_with(&self, permissions: &[&str]) -> String {
        self.state.jwt.issue_token("operator", permissions, 3600).unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = self.router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    pub async fn send_json(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = self.send(request).await;
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    /// Authenticate and register a push token for `udid`.
    pub async fn enroll(&self, udid: &str, cert: &CertBundle) {
        self.enroll_on(udid, cert, TOPIC).await;
    }

    /// Like [`enroll`](Self::enroll) but on an explicit push topic.
    pub async fn enroll_on(&self, udid: &str, cert: &CertBundle, topic: &str) {
        let (status, _) = self
            .send(device_request("/mdm/checkin", cert, udid, authenticate_on(udid, topic)))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = self
            .send(device_request("/mdm/checkin", cert, udid, token_update_on(udid, topic)))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    /// Wait for a spawned sync job to finish and return its JSON.
    pub async fn wait_for_task(&self, task_id: &str) -> serde_json::Value {
        for _ in 0..300 {
            let (status, job) = self
                .send_json(operator_request(
                    Method::GET,
                    &format!("/api/tasks/{task_id}"),
                    &self.admin,
                    None,
                ))
                .await;
            assert_eq!(status, StatusCode::OK);
            if job["unready"] == false {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not finish");
    }
}

fn escape(pem: &str) -> String {
    pem.replace('\n', "%0A")
        .replace(' ', "%20")
        .replace('+', "%2B")
}

pub fn device_request(uri: &str, cert: &CertBundle, udid: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("X-Client-Cert", escape(&cert.cert_pem))
        .header(
            "X-Client-Subject-DN",
            format!("CN={udid},O=mdmgate devices"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn operator_request(
    method: Method,
    uri: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn to_plist(entries: Vec<(&str, Value)>) -> Vec<u8> {
    let mut dict = Dictionary::new();
    for (key, value) in entries {
        dict.insert(key.to_string(), value);
    }
    let mut xml = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
    xml
}

pub fn parse_plist(body: &[u8]) -> Dictionary {
    Value::from_reader_xml(body)
        .unwrap()
        .into_dictionary()
        .unwrap()
}

pub fn authenticate(udid: &str) -> Vec<u8> {
    authenticate_on(udid, TOPIC)
}

pub fn authenticate_on(udid: &str, topic: &str) -> Vec<u8> {
    to_plist(vec![
        ("MessageType", Value::String("Authenticate".into())),
        ("UDID", Value::String(udid.into())),
        ("Topic", Value::String(topic.into())),
        ("SerialNumber", Value::String("C02TEST".into())),
    ])
}

pub fn token_update(udid: &str) -> Vec<u8> {
    token_update_on(udid, TOPIC)
}

pub fn token_update_on(udid: &str, topic: &str) -> Vec<u8> {
    to_plist(vec![
        ("MessageType", Value::String("TokenUpdate".into())),
        ("UDID", Value::String(udid.into())),
        ("Topic", Value::String(topic.into())),
        ("Token", Value::Data(vec![0xde, 0xad, 0xbe, 0xef])),
        ("PushMagic", Value::String("magic-1".into())),
    ])
}

pub fn report(udid: &str, status: &str, command_uuid: Option<&str>) -> Vec<u8> {
    let mut entries = vec![
        ("UDID", Value::String(udid.into())),
        ("Status", Value::String(status.into())),
    ];
    if let Some(uuid) = command_uuid {
        entries.push(("CommandUUID", Value::String(uuid.into())));
    }
    to_plist(entries)
}
