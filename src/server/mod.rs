//! HTTP boundary: admission, download streaming, metadata probe and visit beacon.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, Query, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER, USER_AGENT},
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::gate::{validate_url, Rejection, RequestGate};
use crate::media::{
    DownloadError, DownloadRequest, FailureReason, MediaDownloader, OutputFormat, Platform,
};
use crate::notify::{Notice, Notifier, Visitor};
use crate::utils::{describe_device, sanitize_ascii_filename};

pub const X_PLATFORM: HeaderName = HeaderName::from_static("x-platform");

pub struct AppState {
    gate: RequestGate,
    downloader: MediaDownloader,
    notifier: Notifier,
    trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(
        gate: RequestGate,
        downloader: MediaDownloader,
        notifier: Notifier,
        trust_proxy_headers: bool,
    ) -> Self {
        Self {
            gate,
            downloader,
            notifier,
            trust_proxy_headers,
        }
    }
}

pub fn router(state: Arc<AppState>, allowed_origins: &[String]) -> Result<Router> {
    Ok(Router::new()
        .route("/api/download", get(download))
        .route("/api/info", post(media_info))
        .route("/api/visit", post(visit))
        .route("/api/health", get(health))
        .layer(build_cors_layer(allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let origins = allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin.trim())
                    .with_context(|| format!("Invalid CORS origin: {origin:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .expose_headers([CONTENT_DISPOSITION, CONTENT_LENGTH, X_PLATFORM]))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: &'static str,
    hint: Option<String>,
    platform: Option<Platform>,
    retry_after_seconds: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            hint: None,
            platform: None,
            retry_after_seconds: None,
        }
    }

    fn invalid_format(value: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "INVALID_FORMAT",
            format!("unsupported format {value:?}, expected mp4 or mp3"),
        )
    }

    fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    fn from_download(err: &DownloadError, platform: Platform) -> Self {
        let (status, code) = match err {
            DownloadError::ToolUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "TOOL_UNAVAILABLE")
            }
            DownloadError::AllStrategiesFailed { reason, .. } if reason.is_specific() => {
                (StatusCode::BAD_REQUEST, reason.code())
            }
            DownloadError::AllStrategiesFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, FailureReason::Unknown.code())
            }
        };

        let hint = match err {
            DownloadError::ToolUnavailable(_) => {
                "The downloader is not installed on the server.".to_string()
            }
            DownloadError::AllStrategiesFailed { reason, .. } => reason.hint(platform),
        };

        Self {
            status,
            message: err.to_string(),
            code,
            hint: Some(hint),
            platform: Some(platform),
            retry_after_seconds: None,
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::MissingUrl => {
                Self::new(StatusCode::BAD_REQUEST, "MISSING_URL", rejection.to_string())
            }
            Rejection::InvalidUrl(_) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_URL", rejection.to_string())
            }
            Rejection::RateLimited { retry_after } => {
                let mut err = Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    rejection.to_string(),
                );
                err.retry_after_seconds = Some(retry_after.as_secs().max(1));
                err
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            hint: self.hint,
            platform: self.platform,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    header("x-forwarded-for")
        .and_then(|forwarded| {
            forwarded
                .split(',')
                .next()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        })
        .or_else(|| header("x-real-ip"))
}

fn client_ip(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    if trust_proxy_headers {
        forwarded_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn visitor(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> Visitor {
    Visitor {
        ip: client_ip(state.trust_proxy_headers, headers, addr),
        device: describe_device(&user_agent(headers)),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    format: Option<String>,
}

async fn download(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let visitor = visitor(&state, &headers, addr);

    // Malformed requests are rejected before they can use up the client's budget
    validate_url(query.url.as_deref())?;
    let format = OutputFormat::parse(query.format.as_deref())
        .ok_or_else(|| ApiError::invalid_format(query.format.as_deref().unwrap_or_default()))?;
    let url = state.gate.admit(&visitor.ip, query.url.as_deref())?;

    let request = DownloadRequest::new(url, format);
    info!(
        client = %visitor.ip,
        platform = %request.platform,
        format = format.extension(),
        "Download requested: {}",
        request.source_url
    );
    state.notifier.notify(Notice::DownloadStarted {
        visitor: visitor.clone(),
        platform: request.platform,
        url: request.source_url.to_string(),
        format,
    });

    let result = match state.downloader.download(&request).await {
        Ok(result) => result,
        Err(e) => {
            if matches!(e, DownloadError::ToolUnavailable(_)) {
                error!(client = %visitor.ip, "Download failed: {}", e);
                state.notifier.notify(Notice::Error {
                    context: "download".to_string(),
                    message: e.to_string(),
                });
            } else {
                warn!(
                    client = %visitor.ip,
                    platform = %request.platform,
                    reason = e.reason().code(),
                    "Download failed: {}",
                    e
                );
            }
            state.notifier.notify(Notice::DownloadFailed {
                visitor,
                platform: request.platform,
                reason: e.reason(),
                error: e.to_string(),
            });
            return Err(ApiError::from_download(&e, request.platform));
        }
    };

    state.notifier.notify(Notice::DownloadCompleted {
        visitor,
        platform: result.platform,
        filename: result.filename.clone(),
        size: result.size,
    });

    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_ascii_filename(&result.filename)
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, result.format.content_type())
        .header(CONTENT_LENGTH, result.size)
        .header(CONTENT_DISPOSITION, disposition)
        .header(X_PLATFORM, result.platform.tag())
        .body(Body::from_stream(result.stream))
        .map_err(|e| ApiError::internal("DOWNLOAD_FAILED", format!("failed to build response: {e}")))
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    title: String,
    thumbnail: Option<String>,
    duration: Option<u64>,
    uploader: Option<String>,
    id: String,
    platform: Platform,
    download_url: String,
}

async fn media_info(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<Json<InfoResponse>, ApiError> {
    let client = client_ip(state.trust_proxy_headers, &headers, addr);
    let requested = body.ok().and_then(|Json(body)| body.url);
    let url = state.gate.admit(&client, requested.as_deref())?;
    let platform = Platform::detect(&url);

    let metadata = state.downloader.probe(&url).await.map_err(|e| {
        warn!(client = %client, platform = %platform, "Metadata probe failed: {:#}", e);
        let mut err = ApiError::internal("INFO_FAILED", format!("{e:#}"));
        err.platform = Some(platform);
        err
    })?;

    let download_url = download_link(&url);

    Ok(Json(InfoResponse {
        title: metadata.title,
        thumbnail: metadata.thumbnail,
        duration: metadata.duration,
        uploader: metadata.author,
        id: metadata.id,
        platform,
        download_url,
    }))
}

fn download_link(url: &url::Url) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", url.as_str())
        .finish();
    format!("/api/download?{query}")
}

async fn visit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> StatusCode {
    let visitor = visitor(&state, &headers, addr);
    info!(client = %visitor.ip, device = %visitor.device, "Visit");
    state.notifier.notify(Notice::Visit {
        visitor,
        user_agent: user_agent(&headers),
    });
    StatusCode::NO_CONTENT
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
