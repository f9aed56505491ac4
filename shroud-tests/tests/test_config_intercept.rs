//! End-to-end tests of the configuration-interception proxy against a mock
//! upstream service.

mod common;

use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rstest::rstest;
use shroud::config::Settings;
use shroud::error::{InterceptError, ShroudError};
use shroud::interceptor::{ChatEndpoint, ConfigInterceptor};
use tokio::sync::mpsc;
use tracing_test::traced_test;

use common::spawn_upstream;

const RELAY_PORT: u16 = 54321;

fn config_body() -> String {
    serde_json::json!({
        "chat.host": "chat.default.example.com",
        "chat.port": 5223,
        "chat.affinities": {
            "eu1": "chat.eu1.example.com",
            "na1": "chat.na1.example.com",
        },
        "chat.affinity.enabled": true,
        "chat.allow_bad_cert.enabled": false,
        "other.setting": "untouched",
    })
    .to_string()
}

fn affinity_token(affinity: &str) -> String {
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"affinity":"{affinity}"}}"#));
    format!("e30.{payload}.sig")
}

async fn start_interceptor(
    upstream: &str,
) -> (ConfigInterceptor, mpsc::Receiver<ShroudError>) {
    let mut settings = Settings::default();
    settings.client_config_url = upstream.to_string();
    settings.geo_affinity_url = format!("{upstream}/pas");

    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let interceptor = ConfigInterceptor::start(&settings, RELAY_PORT, fatal_tx)
        .await
        .expect("start interceptor");
    (interceptor, fatal_rx)
}

#[tokio::test]
async fn successful_response_is_rewritten_and_endpoint_discovered() {
    let body = config_body();
    let token = affinity_token("eu1");
    let router = Router::new()
        .route(
            "/pas",
            get(move || {
                let token = token.clone();
                async move { token }
            }),
        )
        .fallback(move || {
            let body = body.clone();
            async move { ([(header::CONTENT_TYPE, "application/json")], body) }
        });
    let upstream = spawn_upstream(router).await;
    let (interceptor, _fatal_rx) = start_interceptor(&upstream).await;

    let response = reqwest::Client::new()
        .get(format!("{}/api/v1/config/player", interceptor.url()))
        .header(header::AUTHORIZATION, "Bearer player-token")
        .send()
        .await
        .expect("request through interceptor");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE.as_str())
            .and_then(|value| value.to_str().ok()),
        Some("application/json")
    );

    let value: serde_json::Value = response.json().await.expect("rewritten body is JSON");
    assert_eq!(value["chat.host"], "127.0.0.1");
    assert_eq!(value["chat.port"], RELAY_PORT);
    assert_eq!(value["chat.affinities"]["eu1"], "127.0.0.1");
    assert_eq!(value["chat.affinities"]["na1"], "127.0.0.1");
    assert_eq!(value["chat.allow_bad_cert.enabled"], true);
    assert_eq!(value["other.setting"], "untouched");

    // The true endpoint uses the affinity-resolved host, not the default.
    let discovered = interceptor.endpoint_receiver().borrow().clone();
    assert_eq!(
        discovered,
        Some(ChatEndpoint {
            host: "chat.eu1.example.com".to_string(),
            port: 5223,
        })
    );
}

#[tokio::test]
async fn affinity_failure_falls_back_to_default_host() {
    let body = config_body();
    let router = Router::new()
        .route(
            "/pas",
            get(|| async { (StatusCode::FORBIDDEN, "no token for you") }),
        )
        .fallback(move || {
            let body = body.clone();
            async move { ([(header::CONTENT_TYPE, "application/json")], body) }
        });
    let upstream = spawn_upstream(router).await;
    let (interceptor, _fatal_rx) = start_interceptor(&upstream).await;

    let response = reqwest::get(format!("{}/config", interceptor.url()))
        .await
        .expect("request through interceptor");
    assert_eq!(response.status().as_u16(), 200);

    let discovered = interceptor.endpoint_receiver().borrow().clone();
    assert_eq!(
        discovered.map(|endpoint| endpoint.host),
        Some("chat.default.example.com".to_string())
    );
}

#[rstest]
#[case(404)]
#[case(503)]
#[tokio::test]
async fn non_success_responses_pass_through_verbatim(#[case] status: u16) {
    let upstream_body = r#"{"error":"try again later"}"#;
    let router = Router::new().fallback(move || async move {
        (
            StatusCode::from_u16(status).unwrap(),
            upstream_body.to_string(),
        )
    });
    let upstream = spawn_upstream(router).await;
    let (interceptor, _fatal_rx) = start_interceptor(&upstream).await;

    let response = reqwest::get(format!("{}/config", interceptor.url()))
        .await
        .expect("request through interceptor");

    assert_eq!(response.status().as_u16(), status);
    let body = response.bytes().await.expect("response body");
    assert_eq!(&body[..], upstream_body.as_bytes());

    // No endpoint event fires for error pages.
    assert_eq!(interceptor.endpoint_receiver().borrow().clone(), None);
}

#[tokio::test]
#[traced_test]
async fn schema_violation_is_fatal() {
    let router =
        Router::new().fallback(|| async { "<html>definitely not the expected schema</html>" });
    let upstream = spawn_upstream(router).await;
    let (interceptor, mut fatal_rx) = start_interceptor(&upstream).await;

    let response = reqwest::get(format!("{}/config", interceptor.url()))
        .await
        .expect("request through interceptor");
    assert_eq!(response.status().as_u16(), 500);

    let fatal = tokio::time::timeout(Duration::from_secs(1), fatal_rx.recv())
        .await
        .expect("fatal error within a second")
        .expect("fatal channel open");
    assert!(matches!(
        fatal,
        ShroudError::Intercept(InterceptError::SchemaViolation { .. })
    ));
    assert!(logs_contain("Configuration rewrite failed"));
}

#[tokio::test]
async fn requests_forward_the_original_path_and_query() {
    let router = Router::new().route(
        "/api/v1/config/player",
        get(|request: axum::extract::Request| async move {
            assert_eq!(request.uri().query(), Some("os=windows&version=1.2.3"));
            (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"chat.host":"h","chat.port":1}"#,
            )
        }),
    );
    let upstream = spawn_upstream(router).await;
    let (interceptor, _fatal_rx) = start_interceptor(&upstream).await;

    let response = reqwest::get(format!(
        "{}/api/v1/config/player?os=windows&version=1.2.3",
        interceptor.url()
    ))
    .await
    .expect("request through interceptor");
    assert_eq!(response.status().as_u16(), 200);

    let discovered = interceptor.endpoint_receiver().borrow().clone();
    assert_eq!(
        discovered,
        Some(ChatEndpoint {
            host: "h".to_string(),
            port: 1,
        })
    );
}
