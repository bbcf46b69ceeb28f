//! HTTP Router for luagate
//!
//! Maps the script routes onto the [`Gateway`] and turns [`GateError`]s into
//! HTTP statuses with a JSON error body.
//!
//! # Routes
//!
//! | Method | Path | Success |
//! |--------|------|---------|
//! | POST | `/runLuaFile/{scriptName}` | 200 `text/plain` return value, plus script headers |
//! | POST | `/runLuaFileAsync/{scriptName}` | 200 `text/plain` job id |
//! | GET | `/status/{jobId}` | 200 JSON poll snapshot |
//! | GET | `/__health` | 200 `OK` |
//!
//! Every route except `/__health` passes through admission control first.
//!
//! # Client identity
//!
//! Admission buckets are keyed on `X-Client-Id` when it is present. The
//! header is taken at face value, so a caller that can set it freely can
//! rotate it for a fresh bucket per request. Deploy behind a credential gate
//! that strips or overwrites `X-Client-Id`; without one, callers are only
//! held to their limits when they omit the header and fall back to the peer
//! IP.

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use luagate_common::error::GateError;
use luagate_common::protocol::{ErrorBody, ExecuteRequest, HeaderSet, PollResponse};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::gateway::Gateway;

/// Header an upstream credential gate uses to name the caller.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Longest `X-Client-Id` value used as an identity; longer values are
/// ignored.
pub const MAX_CLIENT_ID_LEN: usize = 128;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Identity the admission controller keys its buckets on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl ClientIdentity {
    /// `X-Client-Id` if present, non-empty and at most
    /// [`MAX_CLIENT_ID_LEN`] bytes, else the peer IP, else `"unknown"`.
    pub fn from_request(req: &Request) -> Self {
        let from_header = req
            .headers()
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && s.len() <= MAX_CLIENT_ID_LEN)
            .map(str::to_string);

        let identity = from_header
            .or_else(|| {
                req.extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Self(identity)
    }
}

/// A [`GateError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GateError::InvalidName(_) | GateError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            GateError::NotFound(_) | GateError::JobNotFound(_) => StatusCode::NOT_FOUND,
            GateError::ScriptFault(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GateError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::HostCallFailure(_) => StatusCode::BAD_GATEWAY,
            GateError::JobAlreadyCompleted(_)
            | GateError::Transport(_)
            | GateError::JsonSerialization(_)
            | GateError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }

        let mut response = (status, Json(ErrorBody::from(&self.0))).into_response();
        if let GateError::RateLimited { retry_after } = &self.0 {
            // Retry-After is whole seconds, never zero
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

/// Builds the application router around a shared [`Gateway`].
pub fn router(gateway: Arc<Gateway>) -> Router {
    let max_payload_bytes = gateway.limits().max_payload_bytes;

    let scripts = Router::new()
        .route("/runLuaFile/{script_name}", post(run_script))
        .route("/runLuaFileAsync/{script_name}", post(run_script_async))
        .route("/status/{job_id}", get(job_status))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&gateway), admission))
        .layer(DefaultBodyLimit::max(max_payload_bytes));

    Router::new()
        .merge(scripts)
        .route("/__health", get(health_check))
        .with_state(gateway)
}

/// Rejects callers whose token bucket is empty and records their identity
/// for the handlers.
async fn admission(State(gateway): State<Arc<Gateway>>, mut req: Request, next: Next) -> Response {
    let identity = ClientIdentity::from_request(&req);
    if let Err(e) = gateway.admit(&identity.0).await {
        tracing::info!(client = %identity.0, path = %req.uri().path(), "admission denied");
        return ApiError(e).into_response();
    }
    req.extensions_mut().insert(identity);
    next.run(req).await
}

fn parse_request(
    gateway: &Gateway,
    script_name: String,
    body: Result<Bytes, BytesRejection>,
    identity: ClientIdentity,
) -> Result<ExecuteRequest, ApiError> {
    let body = body.map_err(|e| GateError::InvalidPayload(format!("failed to read body: {}", e)))?;
    let limit = gateway.limits().max_payload_bytes;
    if body.len() > limit {
        return Err(GateError::InvalidPayload(format!("body exceeds {} bytes", limit)).into());
    }
    Ok(ExecuteRequest::from_body(script_name, &body, identity.0)?)
}

async fn run_script(
    State(gateway): State<Arc<Gateway>>,
    Path(script_name): Path<String>,
    Extension(identity): Extension<ClientIdentity>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    crate::script_store::validate_script_name(&script_name)?;
    let request = parse_request(&gateway, script_name, body, identity)?;
    let output = gateway.execute(request).await?;

    let mut response = (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], output.return_value).into_response();
    apply_script_headers(&mut response, &output.headers);
    Ok(response)
}

async fn run_script_async(
    State(gateway): State<Arc<Gateway>>,
    Path(script_name): Path<String>,
    Extension(identity): Extension<ClientIdentity>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    crate::script_store::validate_script_name(&script_name)?;
    let request = parse_request(&gateway, script_name, body, identity)?;
    let job_id = gateway.submit(request).await?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], job_id).into_response())
}

async fn job_status(
    State(gateway): State<Arc<Gateway>>,
    Path(job_id): Path<String>,
) -> Result<Json<PollResponse>, ApiError> {
    let result = gateway.poll(&job_id).await?;
    Ok(Json(PollResponse::from(result)))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn apply_script_headers(response: &mut Response, headers: &HeaderSet) {
    for (key, value) in headers {
        match (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %key, "skipping invalid script header"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::resource_limits::ResourceLimits;
    use axum::body::Body;
    use axum::http;
    use http_body_util::BodyExt;
    use luagate_common::error::FailureKind;
    use luagate_common::rate_limit::RateLimitConfig;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        router: Router,
    }

    fn app(scripts: &[(&str, &str)], rate_limit: RateLimitConfig) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        for (name, source) in scripts {
            std::fs::write(dir.path().join(name), source).unwrap();
        }
        let limits = ResourceLimits::new()
            .with_execution_timeout(Duration::from_millis(300))
            .with_max_payload_bytes(1024);
        let gateway = Gateway::new(
            GatewayConfig::new(dir.path())
                .with_limits(limits)
                .with_rate_limit(rate_limit),
        )
        .unwrap();
        TestApp {
            _dir: dir,
            router: router(Arc::new(gateway)),
        }
    }

    fn post(uri: &str, body: &str) -> Request {
        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(CLIENT_ID_HEADER, "router-test")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request {
        http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_kind(response: Response) -> FailureKind {
        let body: ErrorBody = serde_json::from_str(&body_string(response).await).unwrap();
        body.error
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_script_returns_plain_text_and_headers() {
        let app = app(
            &[("greet.lua", "setResponseHeader('X-Greeting', 'yes') return 'hello ' .. payload.name")],
            RateLimitConfig::disabled(),
        );

        let response = app
            .router
            .oneshot(post("/runLuaFile/greet.lua", r#"{"name":"ada"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-greeting"], "yes");
        assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
        assert_eq!(body_string(response).await, "hello ada");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_script_header_is_skipped() {
        let app = app(
            &[("bad_header.lua", "setResponseHeader('Bad Header', 'x') setResponseHeader('X-Ok', '1') return 'ok'")],
            RateLimitConfig::disabled(),
        );

        let response = app.router.oneshot(post("/runLuaFile/bad_header.lua", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ok"], "1");
    }

    #[tokio::test]
    async fn test_status_codes_for_rejections() {
        let app = app(&[("ok.lua", "return 'ok'")], RateLimitConfig::disabled());

        let cases = [
            (post("/runLuaFile/..secret.lua", "{}"), StatusCode::BAD_REQUEST, FailureKind::InvalidName),
            (post("/runLuaFile/ok.lua", "[1, 2]"), StatusCode::BAD_REQUEST, FailureKind::InvalidPayload),
            (post("/runLuaFile/ok.lua", "not json"), StatusCode::BAD_REQUEST, FailureKind::InvalidPayload),
            (post("/runLuaFile/missing.lua", "{}"), StatusCode::NOT_FOUND, FailureKind::NotFound),
            (get_req("/status/no-such-job"), StatusCode::NOT_FOUND, FailureKind::JobNotFound),
        ];

        for (request, status, kind) in cases {
            let uri = request.uri().to_string();
            let response = app.router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), status, "{}", uri);
            assert_eq!(error_kind(response).await, kind, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_oversized_body_is_invalid_payload() {
        let app = app(&[("ok.lua", "return 'ok'")], RateLimitConfig::disabled());
        let body = format!(r#"{{"blob":"{}"}}"#, "x".repeat(4096));

        let response = app.router.oneshot(post("/runLuaFile/ok.lua", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, FailureKind::InvalidPayload);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_fault_and_timeout_statuses() {
        let app = app(
            &[("boom.lua", "error('boom')"), ("spin.lua", "while true do end")],
            RateLimitConfig::disabled(),
        );

        let response = app.router.clone().oneshot(post("/runLuaFile/boom.lua", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error_kind(response).await, FailureKind::ScriptFault);

        let response = app.router.oneshot(post("/runLuaFile/spin.lua", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error_kind(response).await, FailureKind::Timeout);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_submit_then_poll() {
        let app = app(&[("later.lua", "return { done = true }")], RateLimitConfig::disabled());

        let response = app
            .router
            .clone()
            .oneshot(post("/runLuaFileAsync/later.lua", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job_id = body_string(response).await;
        assert!(!job_id.is_empty());

        let mut finished = None;
        for _ in 0..50 {
            let response = app.router.clone().oneshot(get_req(&format!("/status/{}", job_id))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let poll: PollResponse = serde_json::from_str(&body_string(response).await).unwrap();
            if let PollResponse::Finished { result, error, .. } = poll {
                finished = Some((result, error));
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (result, error) = finished.expect("job did not finish");
        assert_eq!(result, r#"{"done":true}"#);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_admission_denies_fourth_request_with_retry_after() {
        let app = app(&[("ok.lua", "return 'ok'")], RateLimitConfig::new(1.0, 3));

        for _ in 0..3 {
            let response = app.router.clone().oneshot(get_req("/status/whatever")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        let response = app.router.clone().oneshot(get_req("/status/whatever")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(error_kind(response).await, FailureKind::RateLimited);

        // Another identity and the health check are unaffected
        let response = app.router.clone().oneshot(post("/runLuaFileAsync/ok.lua", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.router.oneshot(get_req("/__health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_client_identity_resolution() {
        let with_header = http::Request::builder()
            .header(CLIENT_ID_HEADER, " tenant-7 ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(ClientIdentity::from_request(&with_header).0, "tenant-7");

        let mut with_peer = http::Request::builder().body(Body::empty()).unwrap();
        with_peer
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 9], 5555))));
        assert_eq!(ClientIdentity::from_request(&with_peer).0, "203.0.113.9");

        let bare = http::Request::builder().body(Body::empty()).unwrap();
        assert_eq!(ClientIdentity::from_request(&bare).0, "unknown");
    }

    #[test]
    fn test_oversized_client_id_falls_back_to_peer() {
        let mut request = http::Request::builder()
            .header(CLIENT_ID_HEADER, "x".repeat(MAX_CLIENT_ID_LEN + 1))
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 4], 4000))));
        assert_eq!(ClientIdentity::from_request(&request).0, "198.51.100.4");

        let at_limit = "y".repeat(MAX_CLIENT_ID_LEN);
        let request = http::Request::builder()
            .header(CLIENT_ID_HEADER, at_limit.as_str())
            .body(Body::empty())
            .unwrap();
        assert_eq!(ClientIdentity::from_request(&request).0, at_limit);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError(GateError::Timeout(5)).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError(GateError::RateLimited { retry_after: Duration::from_millis(1500) }).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError(GateError::Transport("x".into())).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
