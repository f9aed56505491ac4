//! Configuration-interception proxy.
//!
//! A minimal HTTP server bound to an ephemeral loopback port. The launcher
//! is started with its configuration URL pointed here; every GET is
//! forwarded to the real configuration service and the JSON answer is
//! rewritten so that all chat endpoints lead back to the local relay. The
//! real chat endpoint observed in the response is published for the
//! session supervisor.
//!
//! Failure policy, from least to most severe:
//! - upstream unreachable: answer 502, the launcher retries;
//! - upstream returned a non-2xx status: relay body and status verbatim;
//! - a 2xx body that no longer matches the expected schema: fatal, because
//!   continuing would silently stop masking the player.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::constants::LOOPBACK_HOST;
use crate::error::{InterceptError, Result, ShroudError};

/// The vendor's true chat server, discovered from a configuration
/// response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEndpoint {
    pub host: String,
    pub port: u16,
}

/// Typed partial schema of a configuration response. Only the fields the
/// rewrite touches are modeled; everything else passes through the
/// flattened map untouched.
#[derive(Debug, Serialize, Deserialize)]
struct ClientConfig {
    #[serde(rename = "chat.host", skip_serializing_if = "Option::is_none")]
    chat_host: Option<String>,
    #[serde(rename = "chat.port", skip_serializing_if = "Option::is_none")]
    chat_port: Option<u16>,
    #[serde(rename = "chat.affinities", skip_serializing_if = "Option::is_none")]
    chat_affinities: Option<BTreeMap<String, String>>,
    #[serde(
        rename = "chat.affinity.enabled",
        skip_serializing_if = "Option::is_none"
    )]
    chat_affinity_enabled: Option<bool>,
    #[serde(
        rename = "chat.allow_bad_cert.enabled",
        skip_serializing_if = "Option::is_none"
    )]
    chat_allow_bad_cert: Option<bool>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

struct InterceptorState {
    upstream_url: String,
    affinity_url: String,
    resolve_affinity: bool,
    relay_port: u16,
    http: reqwest::Client,
    endpoint_tx: watch::Sender<Option<ChatEndpoint>>,
    fatal_tx: mpsc::Sender<ShroudError>,
}

/// Running configuration-interception proxy.
pub struct ConfigInterceptor {
    port: u16,
    endpoint_rx: watch::Receiver<Option<ChatEndpoint>>,
    task: JoinHandle<()>,
}

impl ConfigInterceptor {
    /// Binds an ephemeral loopback port and starts serving.
    ///
    /// `relay_port` is the port the session supervisor listens on; it is
    /// substituted for the real chat port in every rewritten response.
    /// Schema violations are reported through `fatal_tx`.
    pub async fn start(
        settings: &Settings,
        relay_port: u16,
        fatal_tx: mpsc::Sender<ShroudError>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();

        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let state = Arc::new(InterceptorState {
            upstream_url: settings.client_config_url.trim_end_matches('/').to_string(),
            affinity_url: settings.geo_affinity_url.clone(),
            resolve_affinity: settings.resolve_affinity,
            relay_port,
            http: reqwest::Client::new(),
            endpoint_tx,
            fatal_tx,
        });

        let app = Router::new().fallback(intercept).with_state(state);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Configuration proxy stopped serving: {e}");
            }
        });

        info!("Configuration proxy listening on {}:{}", LOOPBACK_HOST, port);

        Ok(Self {
            port,
            endpoint_rx,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL the launcher should be pointed at via its config-url argument.
    pub fn url(&self) -> String {
        format!("http://{}:{}", LOOPBACK_HOST, self.port)
    }

    /// Receiver for the discovered chat endpoint. Holds `None` until the
    /// first field-complete configuration response has been rewritten.
    pub fn endpoint_receiver(&self) -> watch::Receiver<Option<ChatEndpoint>> {
        self.endpoint_rx.clone()
    }
}

impl Drop for ConfigInterceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Headers copied from the launcher's request to the upstream service,
/// which rejects anonymous requests.
const FORWARDED_HEADERS: &[&str] = &["user-agent", "x-riot-entitlements-jwt", "authorization"];

async fn intercept(State(state): State<Arc<InterceptorState>>, request: Request) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream_url, path_and_query);
    debug!("Forwarding configuration request to {url}");

    let mut upstream = state.http.get(&url);
    for name in FORWARDED_HEADERS {
        if let Some(value) = request.headers().get(*name) {
            upstream = upstream.header(*name, value.as_bytes());
        }
    }

    let response = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Configuration upstream unreachable: {e}");
            return (
                StatusCode::BAD_GATEWAY,
                format!("configuration upstream unreachable: {e}"),
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed reading configuration response body: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    // Error pages are relayed verbatim; the launcher retries on its own.
    if !status.is_success() {
        debug!("Upstream answered {status}, relaying without rewrite");
        return json_response(status, body);
    }

    let config: ClientConfig = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => {
            return fatal_schema_violation(&state, format!("response body is not valid JSON: {e}"))
                .await;
        }
    };

    // Resolve the player's true regional chat host before the affinity map
    // is overwritten. Any failure here falls back to the map's default
    // host; it never fails the outer request.
    let mut resolved_affinity = None;
    if state.resolve_affinity
        && config.chat_affinities.is_some()
        && config.chat_affinity_enabled == Some(true)
    {
        resolved_affinity =
            resolve_affinity(&state, request.headers().get(header::AUTHORIZATION)).await;
    }

    match apply_rewrite(config, state.relay_port, resolved_affinity.as_deref()) {
        Ok((mutated, endpoint)) => {
            if let Some(endpoint) = endpoint {
                info!(
                    "Discovered chat endpoint {}:{}",
                    endpoint.host, endpoint.port
                );
                state.endpoint_tx.send_replace(Some(endpoint));
            }
            json_response(status, Bytes::from(mutated))
        }
        Err(e) => fatal_schema_violation(&state, e.to_string()).await,
    }
}

/// Rewrites a parsed configuration response to point every chat endpoint
/// at the local relay. Returns the serialized body and the discovered true
/// endpoint, if the response carried both chat fields.
fn apply_rewrite(
    mut config: ClientConfig,
    relay_port: u16,
    resolved_affinity: Option<&str>,
) -> serde_json::Result<(Vec<u8>, Option<ChatEndpoint>)> {
    let mut true_host = None;
    let mut true_port = None;

    if let Some(host) = config.chat_host.take() {
        true_host = Some(host);
        config.chat_host = Some(LOOPBACK_HOST.to_string());
    }
    if let Some(port) = config.chat_port.take() {
        true_port = Some(port);
        config.chat_port = Some(relay_port);
    }

    if let Some(affinities) = config.chat_affinities.as_mut() {
        if let Some(key) = resolved_affinity {
            match affinities.get(key) {
                Some(host) => true_host = Some(host.clone()),
                None => warn!("Affinity '{key}' missing from the affinity map, keeping default"),
            }
        }
        // Whatever affinity the client later picks, it reaches the relay.
        for host in affinities.values_mut() {
            *host = LOOPBACK_HOST.to_string();
        }
    }

    // The relay's certificate will not verify against a standard chain.
    if config.chat_allow_bad_cert.is_some() {
        config.chat_allow_bad_cert = Some(true);
    }

    let endpoint = true_host
        .zip(true_port)
        .map(|(host, port)| ChatEndpoint { host, port });
    Ok((serde_json::to_vec(&config)?, endpoint))
}

/// Fetches the player's affinity token from the geo service and decodes
/// the regional affinity key from its payload.
async fn resolve_affinity(
    state: &InterceptorState,
    authorization: Option<&HeaderValue>,
) -> Option<String> {
    let mut request = state.http.get(&state.affinity_url);
    if let Some(value) = authorization {
        request = request.header(header::AUTHORIZATION, value.as_bytes());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Affinity service unreachable, keeping default chat host: {e}");
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(
            "Affinity service answered {}, keeping default chat host",
            response.status()
        );
        return None;
    }

    let token = match response.text().await {
        Ok(token) => token,
        Err(e) => {
            warn!("Failed reading affinity token: {e}");
            return None;
        }
    };

    match decode_affinity_claim(token.trim()) {
        Ok(affinity) => {
            debug!("Resolved player affinity '{affinity}'");
            Some(affinity)
        }
        Err(e) => {
            warn!("Failed decoding affinity token, keeping default chat host: {e}");
            None
        }
    }
}

/// Decodes the `affinity` claim from a JWT payload (base64url, padded as
/// needed).
pub fn decode_affinity_claim(token: &str) -> std::result::Result<String, InterceptError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| InterceptError::MalformedAffinityToken {
            reason: "token has no payload segment".to_string(),
        })?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| InterceptError::MalformedAffinityToken {
            reason: format!("payload is not base64: {e}"),
        })?;

    let claims: serde_json::Value =
        serde_json::from_slice(&decoded).map_err(|e| InterceptError::MalformedAffinityToken {
            reason: format!("payload is not JSON: {e}"),
        })?;

    claims
        .get("affinity")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| InterceptError::MalformedAffinityToken {
            reason: "payload carries no affinity claim".to_string(),
        })
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

async fn fatal_schema_violation(state: &InterceptorState, reason: String) -> Response {
    error!("Configuration rewrite failed, the vendor likely changed their schema: {reason}");
    let _ = state
        .fatal_tx
        .send(InterceptError::SchemaViolation { reason }.into())
        .await;
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> ClientConfig {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn rewrite_substitutes_host_and_port() {
        let config = parse(r#"{"chat.host":"chat.na1.example.com","chat.port":5223}"#);
        let (body, endpoint) = apply_rewrite(config, 54321, None).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["chat.host"], "127.0.0.1");
        assert_eq!(value["chat.port"], 54321);
        assert_eq!(
            endpoint,
            Some(ChatEndpoint {
                host: "chat.na1.example.com".to_string(),
                port: 5223,
            })
        );
    }

    #[test]
    fn rewrite_without_chat_fields_discovers_nothing() {
        let config = parse(r#"{"some.other":"field"}"#);
        let (body, endpoint) = apply_rewrite(config, 54321, None).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["some.other"], "field");
        assert_eq!(endpoint, None);
    }

    #[test]
    fn rewrite_overrides_default_host_with_affinity() {
        let config = parse(
            r#"{"chat.host":"chat.default.example.com","chat.port":5223,
                "chat.affinity.enabled":true,
                "chat.affinities":{"eu1":"chat.eu1.example.com","na1":"chat.na1.example.com"}}"#,
        );
        let (body, endpoint) = apply_rewrite(config, 1000, Some("eu1")).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["chat.affinities"]["eu1"], "127.0.0.1");
        assert_eq!(value["chat.affinities"]["na1"], "127.0.0.1");
        assert_eq!(
            endpoint.unwrap().host,
            "chat.eu1.example.com".to_string()
        );
    }

    #[test]
    fn rewrite_keeps_default_host_for_unknown_affinity() {
        let config = parse(
            r#"{"chat.host":"chat.default.example.com","chat.port":5223,
                "chat.affinities":{"eu1":"chat.eu1.example.com"}}"#,
        );
        let (_, endpoint) = apply_rewrite(config, 1000, Some("br1")).unwrap();
        assert_eq!(endpoint.unwrap().host, "chat.default.example.com");
    }

    #[test]
    fn rewrite_forces_bad_cert_acceptance() {
        let config = parse(r#"{"chat.allow_bad_cert.enabled":false}"#);
        let (body, _) = apply_rewrite(config, 1000, None).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["chat.allow_bad_cert.enabled"], true);
    }

    #[test]
    fn rewrite_passes_unknown_fields_through() {
        let config = parse(
            r#"{"chat.host":"h","chat.port":1,"lol.feature_flag":true,"nested":{"a":[1,2]}}"#,
        );
        let (body, _) = apply_rewrite(config, 1000, None).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["lol.feature_flag"], true);
        assert_eq!(value["nested"]["a"][1], 2);
    }

    #[test]
    fn affinity_claim_decodes_from_unpadded_payload() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"affinity":"eu2"}"#);
        let token = format!("e30.{payload}.sig");
        assert_eq!(decode_affinity_claim(&token).unwrap(), "eu2");
    }

    #[test]
    fn affinity_claim_decodes_from_padded_payload() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode(r#"{"affinity":"na3"}"#);
        let token = format!("e30.{padded}.sig");
        assert_eq!(decode_affinity_claim(&token).unwrap(), "na3");
    }

    #[test]
    fn affinity_claim_rejects_malformed_tokens() {
        assert!(decode_affinity_claim("no-dots-here").is_err());
        assert!(decode_affinity_claim("a.!!!.b").is_err());

        let payload = URL_SAFE_NO_PAD.encode(r#"{"other":"claim"}"#);
        assert!(decode_affinity_claim(&format!("e30.{payload}.s")).is_err());
    }
}
