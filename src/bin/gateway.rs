#![forbid(unsafe_code)]

//! HTTP gateway around an external media-extraction tool.
//!
//! Every route is a thin wrapper over the same few moves: validate the
//! request before anything is spawned, run the tool in pipe or file mode,
//! and turn the outcome into a streamed body or a classified error. The
//! narrower routes (`/download-tiktok-direct`, `/stream-audio`,
//! `/download-webpage`, `/test-write`) isolate single features so failures
//! can be bisected without touching the full download path.
//!
//! One caveat clients must know about: once a streamed response has begun,
//! a tool failure can no longer change the status code. The gateway aborts
//! the connection instead of finishing the body, so clients observe a
//! transport error rather than a plausible-looking truncated file.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use mediagate::{
    archive,
    assemble,
    config::{DEFAULT_CONFIG_PATH, GatewayConfig},
    error::{GatewayError, GatewayResult},
    security::refuse_root,
    session::SessionProfile,
    stream::{ScratchStream, spawn_streaming},
    transcode, transcript,
    ytdlp::{self, AUDIO_STREAM_FORMAT, DEFAULT_LANG, DownloadOptions},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP gateway around an external media-extraction tool.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the key=value config file"
    )]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen host")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    config: Arc<GatewayConfig>,
    session: Arc<SessionProfile>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    refuse_root("gateway")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mediagate=info,gateway=info,tower_http=info")),
        )
        .init();

    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate().context("validating configuration")?;

    // Fail fast: a gateway whose tool cannot even report a version would
    // only discover that one failed request at a time.
    match ytdlp::version(&config.ytdlp_bin, config.subprocess_timeout).await {
        Ok(version) => info!("extraction tool {} version {version}", config.ytdlp_bin),
        Err(err) => anyhow::bail!("extraction tool {} is not usable: {err}", config.ytdlp_bin),
    }

    let session = SessionProfile::new(config.profile_dir.clone(), config.cookies_file.clone());
    if session.is_usable() {
        info!("session profile available; authenticated downloads enabled");
    } else {
        info!("no session profile; downloads run unauthenticated");
    }

    let state = AppState {
        config: Arc::new(config),
        session: Arc::new(session),
    };

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .context("parsing listen address")?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gateway")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ytdlp-version", get(tool_version))
        .route("/download", get(download))
        .route("/get-transcript", get(get_transcript))
        .route("/download-tiktok-direct", get(download_tiktok_direct))
        .route("/stream-audio", get(stream_audio))
        .route("/download-webpage", get(download_webpage))
        .route("/test-write", get(test_write))
        .route("/transcode", post(transcode_media))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: Option<String>,
    format: Option<String>,
    lang: Option<String>,
    audioformat: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UrlParams {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptParams {
    url: Option<String>,
    lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscodeRequest {
    #[serde(rename = "inputUrl")]
    input_url: String,
    preset: String,
}

/// How `/download` delivers its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadMode {
    /// Media bytes straight from the tool's stdout.
    Stream,
    /// File mode, artifacts bundled into a zip.
    Zip,
    /// File mode, artifacts kept on the server, JSON descriptor returned.
    Save,
}

impl DownloadMode {
    fn parse(value: Option<&str>) -> GatewayResult<Self> {
        match value.unwrap_or("stream") {
            "stream" => Ok(Self::Stream),
            "zip" => Ok(Self::Zip),
            "save" => Ok(Self::Save),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown mode {other:?}; expected stream, zip or save"
            ))),
        }
    }
}

/// Validates the `url` parameter before anything is spawned.
fn require_url(raw: &Option<String>) -> GatewayResult<Url> {
    let raw = raw
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("missing url parameter".into()))?;
    let url = Url::parse(raw)
        .map_err(|err| GatewayError::InvalidRequest(format!("malformed url: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(GatewayError::InvalidRequest(format!(
            "unsupported url scheme {:?}",
            url.scheme()
        )));
    }
    Ok(url)
}

fn attachment(body: Body, content_type: &str, filename: &str) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{filename}\"").parse().unwrap(),
    );
    response
}

async fn health() -> &'static str {
    "OK"
}

async fn tool_version(State(state): State<AppState>) -> GatewayResult<String> {
    ytdlp::version(&state.config.ytdlp_bin, state.config.subprocess_timeout).await
}

async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> GatewayResult<Response> {
    let url = require_url(&params.url)?;
    let mode = DownloadMode::parse(params.mode.as_deref())?;

    let mut opts = DownloadOptions::new(url);
    if let Some(format) = params.format.filter(|value| !value.is_empty()) {
        opts.format = format;
    }
    if let Some(lang) = params.lang.filter(|value| !value.is_empty()) {
        opts.lang = lang;
    }
    if let Some(audio_format) = params.audioformat.filter(|value| !value.is_empty()) {
        opts.audio_format = audio_format;
    }

    match mode {
        DownloadMode::Stream => stream_media(&state, &opts, "video/mp4", "video.mp4").await,
        DownloadMode::Zip => file_download(&state, &opts, false).await,
        DownloadMode::Save => file_download(&state, &opts, true).await,
    }
}

/// Pipe mode shared by the streaming routes. Headers go out only once the
/// first chunk exists, so everything before that still gets a status code.
async fn stream_media(
    state: &AppState,
    opts: &DownloadOptions,
    content_type: &str,
    filename: &str,
) -> GatewayResult<Response> {
    let args = ytdlp::pipe_args(opts, &state.session, state.config.proxy_url.as_deref());
    let stream = spawn_streaming(
        &state.config.ytdlp_bin,
        &args,
        state.config.subprocess_timeout,
    )
    .await?;
    Ok(attachment(Body::from_stream(stream), content_type, filename))
}

/// File mode: run the tool into a per-request scratch directory, recover
/// the identifier, probe for artifacts, then either zip or keep them.
async fn file_download(state: &AppState, opts: &DownloadOptions, keep: bool) -> GatewayResult<Response> {
    let scratch = tempfile::Builder::new()
        .prefix("req-")
        .tempdir_in(&state.config.download_dir)
        .map_err(|err| GatewayError::Configuration(format!("creating scratch dir: {err}")))?;

    let args = ytdlp::file_mode_args(
        opts,
        scratch.path(),
        &state.session,
        state.config.proxy_url.as_deref(),
    );
    let output = ytdlp::run_capture(
        &state.config.ytdlp_bin,
        &args,
        state.config.subprocess_timeout,
    )
    .await?;

    let mut warning = None;
    if !output.success() {
        if ytdlp::is_soft_subtitle_failure(&output.stderr) {
            // Partial success: the media is there, the captions are not.
            warning = Some(format!("subtitles unavailable for {}", opts.lang));
        } else {
            return Err(ytdlp::classify_failure(
                &state.config.ytdlp_bin,
                output.status,
                output.stderr,
            ));
        }
    }

    let id = assemble::recover_identifier(&output.stdout, &opts.url);
    let artifacts = assemble::probe_artifacts(scratch.path(), &id, &opts.audio_format, &opts.lang);
    // Exit code zero does not imply output exists; this check is never skipped.
    if artifacts.is_empty() {
        return Err(GatewayError::ArtifactMissing);
    }

    if let Some(warning) = &warning {
        warn!("{warning} ({})", opts.url);
    }

    if keep {
        let directory = scratch.keep();
        let mut files = Vec::new();
        for artifact in &artifacts {
            let bytes = std::fs::metadata(&artifact.path).map(|meta| meta.len()).unwrap_or(0);
            let mime = MimeGuess::from_path(&artifact.path)
                .first()
                .map(|mime| mime.to_string());
            files.push(json!({
                "name": artifact.name,
                "path": artifact.path,
                "bytes": bytes,
                "mime": mime,
            }));
        }
        return Ok(Json(json!({
            "success": true,
            "id": id,
            "warning": warning,
            "directory": directory,
            "savedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "artifacts": files,
        }))
        .into_response());
    }

    let zip_path = scratch.path().join(format!("{id}.zip"));
    archive::bundle(artifacts, zip_path.clone()).await?;
    let file = tokio::fs::File::open(&zip_path)
        .await
        .map_err(|err| GatewayError::Archive(format!("opening archive: {err}")))?;
    let filename = format!("{id}.zip");
    // The scratch dir travels with the body and is deleted when it drops.
    let body = Body::from_stream(ScratchStream::new(file, scratch));
    Ok(attachment(body, "application/zip", &filename))
}

async fn get_transcript(
    State(state): State<AppState>,
    Query(params): Query<TranscriptParams>,
) -> GatewayResult<Response> {
    let url = require_url(&params.url)?;
    let lang = params
        .lang
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_LANG.to_string());
    let entries = transcript::fetch_transcript(&state.config, &state.session, &url, &lang).await?;
    Ok(Json(json!({
        "success": true,
        "transcript": entries,
    }))
    .into_response())
}

async fn download_tiktok_direct(
    State(state): State<AppState>,
    Query(params): Query<UrlParams>,
) -> GatewayResult<Response> {
    let url = require_url(&params.url)?;
    let host = url.host_str().unwrap_or_default();
    if host != "tiktok.com" && !host.ends_with(".tiktok.com") {
        return Err(GatewayError::InvalidRequest(
            "only tiktok.com urls are supported on this route".into(),
        ));
    }
    let mut opts = DownloadOptions::new(url);
    opts.format = "mp4".into();
    stream_media(&state, &opts, "video/mp4", "tiktok.mp4").await
}

async fn stream_audio(
    State(state): State<AppState>,
    Query(params): Query<UrlParams>,
) -> GatewayResult<Response> {
    let url = require_url(&params.url)?;
    let mut opts = DownloadOptions::new(url);
    opts.format = AUDIO_STREAM_FORMAT.into();
    stream_media(&state, &opts, "audio/mp4", "audio.m4a").await
}

/// Connectivity probe: fetches the raw page through the same proxy path the
/// tool would use, so "the site is unreachable" can be separated from "the
/// tool is broken" without involving the tool at all.
async fn download_webpage(
    State(state): State<AppState>,
    Query(params): Query<UrlParams>,
) -> GatewayResult<Response> {
    let url = require_url(&params.url)?;
    let proxy = state.config.proxy_url.clone();
    let page = tokio::task::spawn_blocking(move || fetch_page(&url, proxy.as_deref()))
        .await
        .map_err(|err| GatewayError::Configuration(format!("fetch task failed: {err}")))??;
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        page,
    )
        .into_response())
}

fn fetch_page(url: &Url, proxy: Option<&str>) -> GatewayResult<String> {
    let mut builder = ureq::AgentBuilder::new().timeout(std::time::Duration::from_secs(30));
    if let Some(proxy) = proxy {
        let proxy = ureq::Proxy::new(proxy)
            .map_err(|err| GatewayError::Configuration(format!("proxy URL: {err}")))?;
        builder = builder.proxy(proxy);
    }
    let agent = builder.build();
    let response = agent
        .get(url.as_str())
        .call()
        .map_err(|err| GatewayError::UpstreamBlocked {
            stderr: err.to_string(),
        })?;
    response
        .into_string()
        .map_err(|err| GatewayError::UpstreamBlocked {
            stderr: err.to_string(),
        })
}

/// Disk probe: proves the download directory is writable without running
/// the tool.
async fn test_write(State(state): State<AppState>) -> GatewayResult<Response> {
    let path = state
        .config
        .download_dir
        .join(format!("write-probe-{}.txt", Utc::now().timestamp_millis()));
    let payload: &[u8] = b"mediagate write probe";

    tokio::fs::write(&path, payload)
        .await
        .map_err(|err| GatewayError::Configuration(format!("writing {}: {err}", path.display())))?;
    let read_back = tokio::fs::read(&path)
        .await
        .map_err(|err| GatewayError::Configuration(format!("reading {}: {err}", path.display())))?;
    tokio::fs::remove_file(&path)
        .await
        .map_err(|err| GatewayError::Configuration(format!("removing {}: {err}", path.display())))?;

    Ok(Json(json!({
        "success": read_back == payload,
        "path": path,
        "bytes": read_back.len(),
    }))
    .into_response())
}

async fn transcode_media(
    State(state): State<AppState>,
    Json(request): Json<TranscodeRequest>,
) -> GatewayResult<Response> {
    let url = Url::parse(&request.input_url)
        .map_err(|err| GatewayError::InvalidRequest(format!("malformed inputUrl: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(GatewayError::InvalidRequest(format!(
            "unsupported inputUrl scheme {:?}",
            url.scheme()
        )));
    }
    let preset = transcode::preset(&request.preset).ok_or_else(|| {
        let known: Vec<&str> = transcode::PRESETS.iter().map(|preset| preset.name).collect();
        GatewayError::InvalidRequest(format!(
            "unknown preset {:?}; known presets: {}",
            request.preset,
            known.join(", ")
        ))
    })?;

    let args = transcode::ffmpeg_args(&url, preset);
    let stream = spawn_streaming(
        &state.config.ffmpeg_bin,
        &args,
        state.config.subprocess_timeout,
    )
    .await?;
    Ok(attachment(
        Body::from_stream(stream),
        preset.content_type,
        preset.filename,
    ))
}
