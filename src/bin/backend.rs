#![forbid(unsafe_code)]

//! Axum backend for the grabtube web UI.
//!
//! Every request either proxies the yt-dlp binary (metadata lookups and
//! streamed downloads) or serves the bundled front-end. Download bytes flow
//! from the child process straight into the HTTP response without touching
//! the disk, while a shared tracker keeps per-session progress for the UI.

use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use env_logger::Env;
use futures_util::StreamExt;
use grabtube::catalog::{CatalogEntry, VideoInfo, build_catalog};
use grabtube::config::{DEFAULT_ENV_PATH, RuntimeOverrides, read_env_file, resolve_runtime_paths};
use grabtube::extractor::{Extractor, StreamKind, parse_info};
use grabtube::security::{ensure_not_root, validate_source_url};
use grabtube::tracker::{DownloadSession, DownloadTracker};
use mime_guess::MimeGuess;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader},
    signal,
};
use tokio_util::io::ReaderStream;

// Saved UI preferences relative to the data root.
const SETTINGS_FILE: &str = "download_settings.json";

#[derive(Debug, Clone)]
struct BackendArgs {
    data_root: PathBuf,
    www_root: PathBuf,
    grabtube_port: u16,
    listen_host: IpAddr,
    ytdlp: PathBuf,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut ytdlp_override: Option<PathBuf> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--ytdlp=") {
                ytdlp_override = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    data_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--ytdlp" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--ytdlp requires a value"))?;
                    ytdlp_override = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            data_root: data_root_override.clone(),
            www_root: www_root_override.clone(),
            ..RuntimeOverrides::default()
        })?;
        let data_root = data_root_override.unwrap_or(runtime_paths.data_root);
        let www_root = www_root_override.unwrap_or(runtime_paths.www_root);
        let grabtube_port = port_override.unwrap_or(runtime_paths.grabtube_port);
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&runtime_paths.grabtube_host)?,
        };
        let ytdlp = ytdlp_override.unwrap_or(runtime_paths.ytdlp);

        Ok(Self {
            data_root,
            www_root,
            grabtube_port,
            listen_host,
            ytdlp,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum QualityPreference {
    Highest,
    Lowest,
    Custom,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum FormatPreference {
    Mp4,
    Mp3,
    Webm,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum AudioQualityPreference {
    Highest,
    Lowest,
}

/// UI preferences, persisted as JSON under the data root. The backend only
/// stores and echoes them; the front-end applies them when it picks a format.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct DownloadSettings {
    download_path: String,
    quality: QualityPreference,
    format: FormatPreference,
    audio_quality: AudioQualityPreference,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_path: String::new(),
            quality: QualityPreference::Highest,
            format: FormatPreference::Mp4,
            audio_quality: AudioQualityPreference::Highest,
        }
    }
}

impl DownloadSettings {
    fn from_env(file_vars: &HashMap<String, String>) -> Self {
        let download_path =
            env_or_file_value("GRABTUBE_DOWNLOAD_PATH", file_vars).unwrap_or_default();
        Self {
            download_path,
            ..Self::default()
        }
    }
}

struct SettingsStore {
    path: PathBuf,
    current: RwLock<DownloadSettings>,
}

impl SettingsStore {
    fn load(data_root: &Path, defaults: DownloadSettings) -> Self {
        let path = data_root.join(SETTINGS_FILE);
        let current = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or(defaults),
            Err(_) => defaults,
        };

        Self {
            path,
            current: RwLock::new(current),
        }
    }

    fn get(&self) -> DownloadSettings {
        self.current.read().clone()
    }

    fn update(&self, settings: DownloadSettings) -> Result<DownloadSettings> {
        write_json_atomic(&self.path, &settings)?;
        *self.current.write() = settings.clone();
        Ok(settings)
    }
}

/// Shared state injected into every Axum handler.
///
/// * `tracker` keeps live progress for every running download session.
/// * `extractor` wraps the yt-dlp binary resolved at startup.
/// * `settings` persists UI preferences under the data root.
#[derive(Clone)]
struct AppState {
    tracker: DownloadTracker,
    extractor: Arc<Extractor>,
    settings: Arc<SettingsStore>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "success": false,
            "message": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInfoResponse {
    success: bool,
    video_info: VideoInfo,
    video_formats: Vec<CatalogEntry>,
    audio_formats: Vec<CatalogEntry>,
}

/// Download request body. Extra fields (the UI echoes its settings object
/// along) are ignored.
#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    title: Option<String>,
    format: Option<CatalogEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let BackendArgs {
        data_root,
        www_root,
        grabtube_port,
        listen_host,
        ytdlp,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    // Allow overriding the bind address via environment variables while
    // retaining the easy defaults for local testing.
    let port = std::env::var("GRABTUBE_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(grabtube_port);

    let host = match std::env::var("GRABTUBE_HOST") {
        Ok(value) if !value.trim().is_empty() => parse_host_arg(value.trim())?,
        _ => listen_host,
    };

    let env_vars = read_env_file(Path::new(DEFAULT_ENV_PATH)).unwrap_or_default();
    let settings_defaults = DownloadSettings::from_env(&env_vars);
    let settings_store = Arc::new(SettingsStore::load(&data_root, settings_defaults));

    let state = AppState {
        tracker: DownloadTracker::new(),
        extractor: Arc::new(Extractor::new(ytdlp)),
        settings: settings_store,
        www_root: Arc::new(www_root),
    };

    let app = Router::new()
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(download))
        .route("/api/downloads", get(list_downloads).delete(clear_downloads))
        .route("/api/downloads/{id}", delete(cancel_download))
        .route("/api/settings", get(get_settings).put(update_settings))
        .fallback(static_fallback)
        .with_state(state);

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    log::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        log::error!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path, req.headers()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<DownloadSettings>> {
    Ok(Json(state.settings.get()))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(payload): Json<DownloadSettings>,
) -> ApiResult<Json<DownloadSettings>> {
    let updated = state
        .settings
        .update(payload)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(updated))
}

async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> ApiResult<Json<VideoInfoResponse>> {
    let url = match payload.url.as_deref() {
        Some(value) if !value.is_empty() => value,
        _ => return Err(ApiError::bad_request("URL is required")),
    };

    if let Err(err) = validate_source_url(url) {
        log::warn!("Rejected metadata URL {:?}: {:#}", url, err);
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let raw_json = match state.extractor.fetch_info_json(url).await {
        Ok(raw) => raw,
        Err(err) => {
            log::warn!("Metadata fetch failed for {}: {:#}", url, err);
            return Err(ApiError::internal(
                "Failed to fetch video information. Please check the URL and try again.",
            ));
        }
    };

    let info = match parse_info(&raw_json) {
        Ok(info) => info,
        Err(err) => {
            log::warn!("Metadata parse failed for {}: {:#}", url, err);
            return Err(ApiError::internal("Failed to parse video information."));
        }
    };

    let catalog = build_catalog(&info, url);
    log::info!(
        "Resolved {} formats for {} ({} video, {} audio)",
        catalog.video_formats.len() + catalog.audio_formats.len(),
        info.id,
        catalog.video_formats.len(),
        catalog.audio_formats.len()
    );

    Ok(Json(VideoInfoResponse {
        success: true,
        video_info: catalog.video_info,
        video_formats: catalog.video_formats,
        audio_formats: catalog.audio_formats,
    }))
}

async fn download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let DownloadRequest { url, title, format } = payload;
    let url = match url {
        Some(value) if !value.is_empty() => value,
        _ => return Err(ApiError::bad_request("URL and format are required")),
    };
    let Some(entry) = format else {
        return Err(ApiError::bad_request("URL and format are required"));
    };

    if let Err(err) = validate_source_url(&url) {
        log::warn!("Rejected download URL {:?}: {:#}", url, err);
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }
    if entry.format_id.is_empty() {
        return Err(ApiError::bad_request("Missing format id"));
    }

    // Audio entries always leave as mp3, everything else as mp4; the actual
    // container is decided by the extractor invocation below.
    let extension = if entry.extension == "mp3" { "mp3" } else { "mp4" };
    let kind = StreamKind::for_entry(&entry.extension, entry.has_video);

    let mut child = match state.extractor.spawn_stream(&entry.format_id, kind, &url) {
        Ok(child) => child,
        Err(err) => {
            log::error!("Failed to start extractor for {}: {:#}", url, err);
            return Err(ApiError::internal("Download failed. Please try again."));
        }
    };
    let Some(stdout) = child.stdout.take() else {
        log::error!("Extractor stdout was not captured for {}", url);
        return Err(ApiError::internal("Download failed. Please try again."));
    };

    // Drain stderr so a chatty run never fills the pipe and stalls the child.
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("yt-dlp: {}", line);
            }
        });
    }

    let title = title.unwrap_or_default();
    let started = state
        .tracker
        .start(&title, &entry.format_id, extension, &entry.size_display);
    log::info!(
        "Started download {} (format {}, {})",
        started.id,
        entry.format_id,
        extension
    );

    // Watch the child independently of the response body: the session is
    // marked complete on a clean exit, removed on failure, and the process
    // is killed as soon as the cancellation token fires.
    let watcher_tracker = state.tracker.clone();
    let watcher_id = started.id.clone();
    let total_display = entry.size_display.clone();
    let token = started.token.clone();
    let watched_url = url.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                if let Err(err) = child.kill().await {
                    log::warn!("Failed to kill extractor for {}: {}", watcher_id, err);
                }
                log::info!("Cancelled download {}", watcher_id);
            }
            status = child.wait() => match status {
                Ok(status) if status.success() => {
                    watcher_tracker.complete(&watcher_id, &total_display);
                    log::info!("Completed download {}", watcher_id);
                }
                Ok(status) => {
                    watcher_tracker.cancel(&watcher_id);
                    log::warn!("Extractor for {} exited with {}", watched_url, status);
                }
                Err(err) => {
                    watcher_tracker.cancel(&watcher_id);
                    log::warn!("Extractor wait failed for {}: {}", watched_url, err);
                }
            },
        }
    });

    // Count bytes as they stream through so the tracker always reflects what
    // actually reached the client. The advertised catalog size stands in for
    // the total because the extractor pipe carries no content length.
    let progress_tracker = state.tracker.clone();
    let progress_id = started.id.clone();
    let expected_total = entry.size_bytes;
    let mut loaded: u64 = 0;
    let stream = ReaderStream::new(stdout).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            loaded += bytes.len() as u64;
            progress_tracker.on_progress_now(&progress_id, loaded, expected_total);
        }
        chunk
    });

    let filename = format!("download_{}.{}", unix_millis(), extension);
    let content_type = if extension == "mp3" {
        "audio/mpeg"
    } else {
        "video/mp4"
    };

    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{filename}\"")
            .parse()
            .unwrap(),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    Ok(response)
}

async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Vec<DownloadSession>>> {
    Ok(Json(state.tracker.sessions()))
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> StatusCode {
    if state.tracker.cancel(&id).is_none() {
        log::debug!("Cancel requested for unknown download {}", id);
    }
    StatusCode::NO_CONTENT
}

async fn clear_downloads(State(state): State<AppState>) -> StatusCode {
    state.tracker.reset();
    StatusCode::NO_CONTENT
}

async fn serve_www_path(
    root: &Path,
    request_path: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html"), None).await,
        Ok(_) => stream_file(target, Some(headers)).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                stream_file(root.join("index.html"), None).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no file extension and fall back to the SPA shell;
/// anything that looks like an asset 404s honestly.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    let candidate = Path::new(trimmed);
    let has_extension = candidate.extension().is_some();
    !has_extension
}

async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        body.into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

fn env_or_file_value(key: &str, file_vars: &HashMap<String, String>) -> Option<String> {
    std::env::var(key)
        .ok()
        .and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .or_else(|| file_vars.get(key).cloned())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}
