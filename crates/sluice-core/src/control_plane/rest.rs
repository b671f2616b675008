//! HTTP transport for the control plane.

use super::protocol::{
    ChannelStatusRequest, ChannelStatusResponse, ConfigureRequest, ConfigureResponse,
    DropChannelRequest, DropChannelResponse, OpenChannelRequest, OpenChannelResponse,
    RegisterBlobRequest, RegisterBlobResponse,
};
use super::transport::ControlPlaneTransport;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::ControlPlaneConfig;
use crate::error::{Error, TransportError};
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONFIGURE_ENDPOINT: &str = "/v1/streaming/client/configure/";
pub const OPEN_CHANNEL_ENDPOINT: &str = "/v1/streaming/channels/open/";
pub const CHANNEL_STATUS_ENDPOINT: &str = "/v1/streaming/channels/status/";
pub const DROP_CHANNEL_ENDPOINT: &str = "/v1/streaming/channels/drop/";
pub const REGISTER_BLOB_ENDPOINT: &str = "/v1/streaming/channels/write/blobs/";

const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Supplies the bearer token for each request.
///
/// Token signing happens outside this crate; providers only hand out
/// whatever credential is current.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed token.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable on every request, so an
/// external signer can rotate it in place.
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn token(&self) -> Result<String> {
        std::env::var(&self.var).map_err(|e| {
            Error::Transport(TransportError::Auth(format!(
                "cannot read token from ${}: {}",
                self.var, e
            )))
        })
    }
}

/// Build the token provider named by the configuration.
pub fn token_provider_from_config(config: &ControlPlaneConfig) -> Result<Arc<dyn TokenProvider>> {
    match (&config.token, &config.token_env) {
        (Some(token), _) => Ok(Arc::new(StaticTokenProvider::new(token.clone()))),
        (None, Some(var)) => Ok(Arc::new(EnvTokenProvider::new(var.clone()))),
        (None, None) => Err(Error::Config(
            "control_plane.token or control_plane.token_env is required".into(),
        )),
    }
}

/// `reqwest`-backed control-plane transport.
pub struct RestTransport {
    client: Client,
    base_url: String,
    token_type: String,
    tokens: Arc<dyn TokenProvider>,
    circuit_breaker: CircuitBreaker,
    closed: AtomicBool,
}

impl RestTransport {
    /// Create a transport for `account` using the control-plane settings.
    pub fn new(
        config: &ControlPlaneConfig,
        account: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Self::with_base_url(config, config.base_url(account), tokens)
    }

    /// Create a transport against an explicit base URL.
    pub fn with_base_url(
        config: &ControlPlaneConfig,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let circuit_breaker = CircuitBreaker::new(CircuitBreakerConfig::from_settings(
            "control-plane",
            &config.circuit_breaker,
        ));

        info!(url = %base_url, "Control-plane transport initialized");
        Ok(Self {
            client,
            base_url,
            token_type: config.token_type.clone(),
            tokens,
            circuit_breaker,
            closed: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str, request_id: Option<&str>) -> String {
        match request_id {
            Some(id) => format!(
                "{}{}?requestId={}",
                self.base_url,
                endpoint,
                urlencoding::encode(id)
            ),
            None => format!("{}{}", self.base_url, endpoint),
        }
    }

    async fn post<Req, Resp>(
        &self,
        endpoint: &'static str,
        request_id: Option<&str>,
        body: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport(TransportError::Request {
                endpoint: endpoint.to_string(),
                message: "transport closed".into(),
            }));
        }

        let url = self.url(endpoint, request_id);
        let token = self.tokens.token().await?;

        self.circuit_breaker
            .execute(|| async move {
                debug!(endpoint, request_id = request_id.unwrap_or(""), "Control-plane request");
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&token)
                    .header(TOKEN_TYPE_HEADER, &self.token_type)
                    .header("Accept", "application/json")
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| {
                        Error::Transport(TransportError::Request {
                            endpoint: endpoint.to_string(),
                            message: e.to_string(),
                        })
                    })?;

                let status = response.status();
                let text = response.text().await.map_err(|e| {
                    Error::Transport(TransportError::Request {
                        endpoint: endpoint.to_string(),
                        message: e.to_string(),
                    })
                })?;

                if !status.is_success() {
                    return Err(handle_error_response(endpoint, status, &text));
                }

                serde_json::from_str(&text).map_err(|e| {
                    Error::Transport(TransportError::Decode {
                        endpoint: endpoint.to_string(),
                        message: e.to_string(),
                    })
                })
            })
            .await
    }
}

/// Map a non-2xx response onto a transport error.
fn handle_error_response(endpoint: &str, status: StatusCode, body: &str) -> Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(endpoint, status = status.as_u16(), "Control-plane rejected credentials");
        return Error::Transport(TransportError::Auth(format!(
            "{} returned {}",
            endpoint, status
        )));
    }

    let mut body = body.trim().to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Error::Transport(TransportError::Http {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ControlPlaneTransport for RestTransport {
    async fn configure(&self, request: &ConfigureRequest) -> Result<ConfigureResponse> {
        self.post(CONFIGURE_ENDPOINT, None, request).await
    }

    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<OpenChannelResponse> {
        self.post(OPEN_CHANNEL_ENDPOINT, Some(&request.request_id), request)
            .await
    }

    async fn channel_status(
        &self,
        request: &ChannelStatusRequest,
    ) -> Result<ChannelStatusResponse> {
        self.post(CHANNEL_STATUS_ENDPOINT, None, request).await
    }

    async fn drop_channel(&self, request: &DropChannelRequest) -> Result<DropChannelResponse> {
        self.post(DROP_CHANNEL_ENDPOINT, Some(&request.request_id), request)
            .await
    }

    async fn register_blob(&self, request: &RegisterBlobRequest) -> Result<RegisterBlobResponse> {
        self.post(REGISTER_BLOB_ENDPOINT, Some(&request.request_id), request)
            .await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        debug!(url = %self.base_url, "Control-plane transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Seen {
        request_ids: Vec<String>,
        auth: Vec<String>,
        token_types: Vec<String>,
    }

    async fn configure_handler(
        State(seen): State<Arc<Mutex<Seen>>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let mut seen = seen.lock();
        seen.auth.push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        );
        seen.token_types.push(
            headers
                .get(TOKEN_TYPE_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        );
        Json(serde_json::json!({
            "status_code": 0,
            "message": "ok",
            "prefix": format!("pfx-{}", body["role"].as_str().unwrap_or_default()),
            "deployment_id": 7,
            "stage_location": {"locationType": "LOCAL_FS", "location": "/tmp/stage"}
        }))
    }

    async fn drop_handler(
        State(seen): State<Arc<Mutex<Seen>>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        seen.lock()
            .request_ids
            .push(query.get("requestId").cloned().unwrap_or_default());
        Json(serde_json::json!({"status_code": 0, "message": "dropped"}))
    }

    async fn failing_handler() -> (axum::http::StatusCode, &'static str) {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "try later")
    }

    async fn spawn_server(seen: Arc<Mutex<Seen>>) -> String {
        let router = Router::new()
            .route(CONFIGURE_ENDPOINT, post(configure_handler))
            .route(DROP_CHANNEL_ENDPOINT, post(drop_handler))
            .route(CHANNEL_STATUS_ENDPOINT, post(failing_handler))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{}", addr)
    }

    fn transport(base_url: &str) -> RestTransport {
        let mut config = ControlPlaneConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        RestTransport::with_base_url(
            &config,
            base_url,
            Arc::new(StaticTokenProvider::new("signed-jwt")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_configure_sends_auth_headers() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let transport = transport(&spawn_server(seen.clone()).await);

        let response = transport
            .configure(&ConfigureRequest {
                role: "LOADER".into(),
            })
            .await
            .unwrap();

        assert_eq!(response.prefix, "pfx-LOADER");
        assert_eq!(response.deployment_id, 7);
        assert_eq!(
            response.stage_location.unwrap().location_type,
            "LOCAL_FS"
        );
        let seen = seen.lock();
        assert_eq!(seen.auth, vec!["Bearer signed-jwt".to_string()]);
        assert_eq!(seen.token_types, vec!["KEYPAIR_JWT".to_string()]);
    }

    #[tokio::test]
    async fn test_request_id_query_parameter() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let transport = transport(&spawn_server(seen.clone()).await);

        transport
            .drop_channel(&DropChannelRequest {
                request_id: "pfx_7 x_3".into(),
                role: "LOADER".into(),
                channel: "events".into(),
                database: "DB".into(),
                schema: "PUBLIC".into(),
                table: "T".into(),
            })
            .await
            .unwrap();

        assert_eq!(seen.lock().request_ids, vec!["pfx_7 x_3".to_string()]);
    }

    #[tokio::test]
    async fn test_server_errors_open_circuit() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let transport = transport(&spawn_server(seen).await);
        let request = ChannelStatusRequest {
            role: "LOADER".into(),
            channels: vec![],
        };

        for _ in 0..2 {
            let err = transport.channel_status(&request).await.unwrap_err();
            assert!(matches!(
                err,
                Error::Transport(TransportError::Http { status: 503, ref body, .. }) if body == "try later"
            ));
        }
        let err = transport.channel_status(&request).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_requests() {
        let transport = transport("http://127.0.0.1:9");
        transport.close().await.unwrap();
        let err = transport
            .configure(&ConfigureRequest { role: "R".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transport closed"));
    }

    #[test]
    fn test_token_provider_selection() {
        let mut config = ControlPlaneConfig::default();
        assert!(token_provider_from_config(&config).is_err());

        config.token_env = Some("SLUICE_TEST_TOKEN_UNSET".into());
        assert!(token_provider_from_config(&config).is_ok());

        config.token = Some("abc".into());
        assert!(token_provider_from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_env_token_provider_missing_var() {
        let provider = EnvTokenProvider::new("SLUICE_TEST_TOKEN_DEFINITELY_UNSET");
        let err = provider.token().await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_body_truncated() {
        let body = "x".repeat(2000);
        let err = handle_error_response("/x", StatusCode::BAD_GATEWAY, &body);
        match err {
            Error::Transport(TransportError::Http { body, status, .. }) => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            handle_error_response("/x", StatusCode::UNAUTHORIZED, ""),
            Error::Transport(TransportError::Auth(_))
        ));
    }
}
