use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use mfagate::{
    app::create_router,
    models::SessionUser,
    repositories::memory::{
        MemoryCredentialStore, MemoryRateLimiter, MemorySecurityEventLog, MemorySessionStore,
    },
    services::{
        MfaService, SecretCipher,
        cipher::sha256_hex,
        clock::{Clock, ManualClock},
        totp,
    },
    state::{AppState, RateLimitPolicy},
};

const TOKEN: &str = "session-token-for-tests";

struct TestApp {
    router: Router,
    clock: Arc<ManualClock>,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_rate_limit(100).await
    }

    async fn with_rate_limit(max_attempts: u32) -> Self {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cipher = SecretCipher::from_base64(&STANDARD.encode([9u8; 32])).unwrap();
        let service = MfaService::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemorySecurityEventLog::new()),
            cipher,
            clock.clone(),
            "ICT Portal".to_string(),
            totp::DEFAULT_WINDOW,
        );

        let sessions = Arc::new(MemorySessionStore::new(clock.clone()));
        sessions
            .insert(
                sha256_hex(TOKEN),
                SessionUser {
                    user_id: Uuid::new_v4(),
                    email: "staff@example.com".to_string(),
                },
                clock.now() + Duration::hours(1),
            )
            .await;

        let state = AppState::from_parts(
            service,
            sessions,
            Arc::new(MemoryRateLimiter::new(clock.clone())),
            RateLimitPolicy {
                max_attempts,
                window: Duration::minutes(15),
            },
        );

        Self {
            router: create_router(state),
            clock,
        }
    }

    async fn call(&self, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let (status, _, value) = self.call_with_headers(token, body).await;
        (status, value)
    }

    async fn call_with_headers(
        &self,
        token: Option<&str>,
        body: Value,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/mfa")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, value)
    }

    async fn action(&self, body: Value) -> (StatusCode, Value) {
        self.call(Some(TOKEN), body).await
    }

    fn current_code(&self, secret: &str) -> String {
        let now = u64::try_from(self.clock.now().unix_timestamp()).unwrap();
        totp::compute_code_at(secret, now, totp::TIME_STEP_SECS, 0)
    }

    async fn setup(&self) -> Value {
        let (status, body) = self.action(json!({ "action": "setup" })).await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}

#[tokio::test]
async fn setup_returns_secret_uri_and_backup_codes() {
    let app = TestApp::new().await;
    let body = app.setup().await;

    let secret = body["secret"].as_str().unwrap();
    assert_eq!(secret.len(), 32);
    assert!(
        secret
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c))
    );

    assert_eq!(
        body["otpauth_uri"],
        format!(
            "otpauth://totp/ICT%20Portal:staff%40example.com?secret={secret}&issuer=ICT%20Portal&algorithm=SHA1&digits=6&period=30"
        )
    );

    let codes = body["backup_codes"].as_array().unwrap();
    assert_eq!(codes.len(), 10);
    assert!(codes.iter().all(|c| c.as_str().unwrap().len() == 8));
}

#[tokio::test]
async fn enable_after_setup_reports_enabled() {
    let app = TestApp::new().await;
    let setup = app.setup().await;
    let code = app.current_code(setup["secret"].as_str().unwrap());

    let (status, body) = app.action(json!({ "action": "enable", "code": code })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["message"].is_string());

    let (status, body) = app.action(json!({ "action": "status" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mfa_enabled"], true);
    assert!(body["setup_at"].is_string());
    assert!(body["verified_at"].is_string());
}

#[tokio::test]
async fn enable_without_setup_is_rejected() {
    let app = TestApp::new().await;

    let (status, body) = app
        .action(json!({ "action": "enable", "code": "000000" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn disable_clears_status() {
    let app = TestApp::new().await;
    let setup = app.setup().await;
    let code = app.current_code(setup["secret"].as_str().unwrap());

    let (status, _) = app.action(json!({ "action": "enable", "code": code })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.action(json!({ "action": "disable", "code": code })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = app.action(json!({ "action": "status" })).await;
    assert_eq!(
        body,
        json!({ "mfa_enabled": false, "setup_at": null, "verified_at": null })
    );
}

#[tokio::test]
async fn backup_code_is_consumed_once() {
    let app = TestApp::new().await;
    let setup = app.setup().await;
    let code = setup["backup_codes"][3].as_str().unwrap().to_string();

    let (status, body) = app
        .action(json!({ "action": "verify_backup", "code": code }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "valid": true, "remaining_codes": 9 }));

    let (status, body) = app
        .action(json!({ "action": "verify_backup", "code": code }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "valid": false }));
}

#[tokio::test]
async fn verify_reports_validity_without_side_effects() {
    let app = TestApp::new().await;
    let setup = app.setup().await;
    let code = app.current_code(setup["secret"].as_str().unwrap());

    let (status, body) = app.action(json!({ "action": "verify", "code": code })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "valid": true }));

    let (_, body) = app.action(json!({ "action": "status" })).await;
    assert_eq!(body["mfa_enabled"], false);
}

#[tokio::test]
async fn malformed_input_is_bad_request() {
    let app = TestApp::new().await;
    app.setup().await;

    for body in [
        json!({ "action": "verify", "code": "12345" }),
        json!({ "action": "verify", "code": "abcdef" }),
        json!({ "action": "enable" }),
        json!({ "action": "verify_backup", "code": "1234" }),
        json!({ "action": "unknown" }),
        json!({ "code": "123456" }),
    ] {
        let (status, response) = app.action(body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert!(response["error"].is_string());
    }
}

#[tokio::test]
async fn missing_or_unknown_session_is_unauthorized() {
    let app = TestApp::new().await;

    let (status, body) = app.call(None, json!({ "action": "status" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = app
        .call(Some("someone-elses-token"), json!({ "action": "status" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn expired_session_is_unauthorized() {
    let app = TestApp::new().await;
    app.clock.advance(Duration::hours(2));

    let (status, _) = app.action(json!({ "action": "status" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn repeated_verification_is_rate_limited() {
    let app = TestApp::with_rate_limit(2).await;
    app.setup().await;

    for _ in 0..2 {
        let (status, _) = app
            .action(json!({ "action": "verify", "code": "000000" }))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = app
        .action(json!({ "action": "verify", "code": "000000" }))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].is_string());

    // status は制限対象外
    let (status, _) = app.action(json!({ "action": "status" })).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rate_limited_response_reports_remaining_lockout() {
    let app = TestApp::with_rate_limit(1).await;
    app.setup().await;

    let (status, _) = app
        .action(json!({ "action": "verify", "code": "000000" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, _) = app
        .call_with_headers(
            Some(TOKEN),
            json!({ "action": "verify", "code": "000000" }),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[header::RETRY_AFTER], "900");

    app.clock.advance(Duration::seconds(600));
    let (status, headers, _) = app
        .call_with_headers(
            Some(TOKEN),
            json!({ "action": "verify", "code": "000000" }),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[header::RETRY_AFTER], "300");

    // ウィンドウ終了後は再び受け付ける
    app.clock.advance(Duration::seconds(300));
    let (status, _) = app
        .action(json!({ "action": "verify", "code": "000000" }))
        .await;
    assert_eq!(status, StatusCode::OK);
}
