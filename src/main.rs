use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{
            CONTENT_SECURITY_POLICY, REFERRER_POLICY, RETRY_AFTER, STRICT_TRANSPORT_SECURITY,
            X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
        },
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Clone)]
struct AppState {
    rate_limiter: Arc<RateLimiter>,
    auth: AuthMode,
    templates: Arc<LinkTemplates>,
    trust_proxy_headers: bool,
}

const TAG: &str = "powered by ytlinks";
const DEFAULT_RATE_LIMIT: u32 = 30;
const DEFAULT_RATE_WINDOW_SECONDS: u64 = 60;
const STALE_WINDOW_MULTIPLIER: u32 = 2;
const DEFAULT_PRIMARY_PROVIDER_BASE: &str = "https://api.vevioz.com/api/button";
const DEFAULT_ALT_PROVIDER_BASE: &str = "https://p.oceansaver.in/api/button";
const UNKNOWN_CLIENT_IP: &str = "unknown";

trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

#[derive(Debug)]
enum Admission {
    Admitted,
    Rejected { retry_after: Duration },
}

struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, RateWindow>,
    clock: Box<dyn Clock>,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, Box::new(SystemClock))
    }

    fn with_clock(limit: u32, window: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            clock,
        }
    }

    // An empty key is an ordinary map key: all callers without a usable
    // address share the same bucket.
    fn consume(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 1;
            entry.window_start = now;
            return Admission::Admitted;
        }

        if entry.count < self.limit {
            entry.count += 1;
            return Admission::Admitted;
        }

        let elapsed = now.duration_since(entry.window_start);
        Admission::Rejected {
            retry_after: self.window - elapsed,
        }
    }

    fn cleanup_stale_windows(&self) -> usize {
        let now = self.clock.now();
        let stale_after = self.window * STALE_WINDOW_MULTIPLIER;
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.window_start) < stale_after);
        before.saturating_sub(self.windows.len())
    }
}

fn schedule_stale_window_cleanup(rate_limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(rate_limiter.window);
        loop {
            ticker.tick().await;
            let evicted = rate_limiter.cleanup_stale_windows();
            if evicted > 0 {
                debug!("Ventanas de limite inactivas eliminadas: {evicted}");
            }
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quality {
    Q360,
    Q720,
    Best,
}

impl Quality {
    fn normalize(raw: Option<&str>) -> Self {
        match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("360") | Some("360p") => Self::Q360,
            Some("720") | Some("720p") => Self::Q720,
            _ => Self::Best,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Q360 => "360",
            Self::Q720 => "720",
            Self::Best => "best",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkMode {
    Audio,
    Video,
    All,
}

impl LinkMode {
    fn normalize(raw: Option<&str>) -> Self {
        match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("audio") => Self::Audio,
            Some("video") => Self::Video,
            _ => Self::All,
        }
    }
}

#[derive(Debug, Clone)]
struct LinkTemplates {
    primary_base: String,
    alt_base: String,
}

impl LinkTemplates {
    fn from_env() -> Self {
        let primary_base = std::env::var("PROVIDER_PRIMARY_BASE")
            .ok()
            .and_then(|value| non_empty(&value).map(|base| base.trim_end_matches('/').to_string()))
            .unwrap_or_else(|| DEFAULT_PRIMARY_PROVIDER_BASE.to_string());
        let alt_base = std::env::var("PROVIDER_ALT_BASE")
            .ok()
            .and_then(|value| non_empty(&value).map(|base| base.trim_end_matches('/').to_string()))
            .unwrap_or_else(|| DEFAULT_ALT_PROVIDER_BASE.to_string());

        Self {
            primary_base,
            alt_base,
        }
    }

    fn build_links(&self, url: &str) -> LinkSet {
        let encoded = urlencoding::encode(url);

        LinkSet {
            audio: AudioLinks {
                best: format!("{}/mp3?url={encoded}", self.primary_base),
                alt: format!("{}/mp3?url={encoded}", self.alt_base),
            },
            video: VideoLinks {
                q360: format!("{}/mp4/360?url={encoded}", self.primary_base),
                q720: format!("{}/mp4/720?url={encoded}", self.primary_base),
                best: format!("{}/mp4?url={encoded}", self.primary_base),
                alt: format!("{}/mp4?url={encoded}", self.alt_base),
            },
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct LinkSet {
    audio: AudioLinks,
    video: VideoLinks,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct AudioLinks {
    best: String,
    alt: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct VideoLinks {
    #[serde(rename = "360p")]
    q360: String,
    #[serde(rename = "720p")]
    q720: String,
    best: String,
    alt: String,
}

impl VideoLinks {
    fn select(&self, quality: Quality) -> &str {
        match quality {
            Quality::Q360 => &self.q360,
            Quality::Q720 => &self.q720,
            Quality::Best => &self.best,
        }
    }
}

#[derive(Debug, Clone)]
enum AuthMode {
    Disabled,
    RequireKey(String),
}

impl AuthMode {
    fn from_env() -> Self {
        match std::env::var("API_KEY")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
        {
            Some(expected) => Self::RequireKey(expected),
            None => Self::Disabled,
        }
    }

    fn admits(&self, presented: Option<&str>) -> bool {
        match self {
            Self::Disabled => true,
            Self::RequireKey(expected) => presented.is_some_and(|key| key == expected),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LinksRequest {
    url: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    tag: &'static str,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    fn invalid_api_key() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Invalid API key".to_string(),
            retry_after_seconds: None,
        }
    }

    fn too_many_requests(retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Too many requests".to_string(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            retry_after_seconds: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = if self.status.is_server_error() {
            error!("Error interno: {}", self.message);
            "Internal server error".to_string()
        } else {
            self.message
        };

        let body = Json(ErrorBody {
            status: "error",
            message,
            tag: TAG,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytlinks=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let rate_limit = read_u32_env("RATE_LIMIT")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_RATE_LIMIT);
    let rate_window_seconds = read_u64_env("RATE_WINDOW_SECS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_RATE_WINDOW_SECONDS);
    let trust_proxy_headers = read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false);
    let auth = AuthMode::from_env();
    let templates = LinkTemplates::from_env();

    if !trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: se usara la IP del socket para limitar peticiones.");
    }
    match &auth {
        AuthMode::RequireKey(_) => info!("API_KEY configurada: toda peticion debe incluirla."),
        AuthMode::Disabled => warn!("API_KEY no configurada. El API queda abierto."),
    }
    info!("Limite de peticiones: {rate_limit} por {rate_window_seconds}s por cliente.");

    let rate_limiter = Arc::new(RateLimiter::new(
        rate_limit,
        Duration::from_secs(rate_window_seconds),
    ));
    schedule_stale_window_cleanup(Arc::clone(&rate_limiter));

    let state = AppState {
        rate_limiter,
        auth,
        templates: Arc::new(templates),
        trust_proxy_headers,
    };

    let cors = build_cors_layer()?;
    let app = build_router(state, cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("No se pudo iniciar el puerto {addr}: {error}"))
    })?;

    info!("API de enlaces lista en http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/yt", get(build_yt_links))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn service_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "YouTube link API online",
        "endpoints": [
            "/health",
            "/yt?url=<yt_url>&type=audio|video&quality=360|720|best",
        ],
        "tag": TAG,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339(),
        "tag": TAG,
    }))
}

async fn build_yt_links(
    State(state): State<AppState>,
    Query(params): Query<LinksRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = params.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() || !is_supported_video_url(url) {
        return Err(ApiError::bad_request("Invalid or missing YouTube URL"));
    }

    let mode = LinkMode::normalize(params.media_type.as_deref());
    let quality = Quality::normalize(params.quality.as_deref());
    let links = state.templates.build_links(url);

    let body = match mode {
        LinkMode::Audio => serde_json::json!({
            "status": "ok",
            "input_url": url,
            "audio": links.audio,
            "tag": TAG,
        }),
        LinkMode::Video => {
            let selected = links.video.select(quality).to_string();
            serde_json::json!({
                "status": "ok",
                "input_url": url,
                "quality": quality.as_str(),
                "video": {
                    "url": selected,
                    "all": links.video,
                },
                "tag": TAG,
            })
        }
        LinkMode::All => serde_json::json!({
            "status": "ok",
            "input_url": url,
            "audio": links.audio,
            "video": links.video,
            "tag": TAG,
        }),
    };

    Ok(Json(body))
}

async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client_ip = client_ip_for_request(&state, &request);
    match state.rate_limiter.consume(&client_ip) {
        Admission::Admitted => Ok(next.run(request).await),
        Admission::Rejected { retry_after } => {
            let retry_after_seconds = retry_after.as_secs().max(1);
            warn!(
                "Limite de peticiones superado para {client_ip}: reintento en {retry_after_seconds}s"
            );
            Err(ApiError::too_many_requests(retry_after_seconds))
        }
    }
}

async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = presented_api_key(&request);
    if state.auth.admits(presented.as_deref()) {
        return Ok(next.run(request).await);
    }

    Err(ApiError::invalid_api_key())
}

fn presented_api_key(request: &Request) -> Option<String> {
    if let Some(header_key) = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(header_key.to_string());
    }

    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.into_owned())
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(state: &AppState, request: &Request) -> String {
    if state.trust_proxy_headers
        && let Some(ip) = extract_client_ip(request.headers())
    {
        return ip;
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT_IP.to_string())
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u32_env(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:3000".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS no esta configurado. Se permitira cualquier origen.");
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET])
            .allow_headers(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    let configured_origin_list = allowed_origins.iter().cloned().collect::<Vec<_>>();
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        configured_origin_list.len(),
        configured_origin_list
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers(Any))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

fn is_supported_video_url(input: &str) -> bool {
    let parsed = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    const SUPPORTED_DOMAINS: [&str; 2] = ["youtube.com", "youtu.be"];

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
