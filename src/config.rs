//! Startup configuration for the gateway.
//!
//! Everything the handlers need is resolved exactly once, at startup, into a
//! [`GatewayConfig`] that is shared behind an `Arc`. Values come from an
//! optional key=value config file, then `MEDIAGATE_*` environment variables,
//! then built-in defaults. Handlers never read the process environment.

use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mediagate-env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_DOWNLOAD_DIR: &str = "/var/lib/mediagate/downloads";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Raw values as read from the config file, before environment overrides and
/// defaults are applied. Everything is optional at this stage.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub ytdlp_bin: Option<String>,
    pub ffmpeg_bin: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout_secs: Option<u64>,
}

/// Fully resolved configuration, constructed once and passed by reference.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub download_dir: PathBuf,
    pub profile_dir: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub subprocess_timeout: Duration,
}

/// Parses a `KEY=value` file, ignoring blank lines and `#` comments. Returns
/// `Ok(None)` when the file does not exist so the defaults apply cleanly.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key {
                "YTDLP_BIN" => cfg.ytdlp_bin = Some(value.to_string()),
                "FFMPEG_BIN" => cfg.ffmpeg_bin = Some(value.to_string()),
                "DOWNLOAD_DIR" => cfg.download_dir = Some(PathBuf::from(value)),
                "PROFILE_DIR" => cfg.profile_dir = Some(PathBuf::from(value)),
                "COOKIES_FILE" => cfg.cookies_file = Some(PathBuf::from(value)),
                "PROXY_URL" => cfg.proxy_url = Some(value.to_string()),
                "HOST" => cfg.host = Some(value.to_string()),
                "PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("parsing PORT from {}", path.display()))?;
                    cfg.port = Some(port);
                }
                "TIMEOUT_SECS" => {
                    let secs: u64 = value
                        .parse()
                        .with_context(|| format!("parsing TIMEOUT_SECS from {}", path.display()))?;
                    cfg.timeout_secs = Some(secs);
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

/// Overlays `MEDIAGATE_*` environment variables (plus plain `PORT`, which
/// hosting platforms commonly inject) on top of the file values.
fn apply_environment(cfg: &mut EnvConfig, env: &HashMap<String, String>) -> Result<()> {
    let get = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    if let Some(value) = get("MEDIAGATE_YTDLP_BIN") {
        cfg.ytdlp_bin = Some(value.to_string());
    }
    if let Some(value) = get("MEDIAGATE_FFMPEG_BIN") {
        cfg.ffmpeg_bin = Some(value.to_string());
    }
    if let Some(value) = get("MEDIAGATE_DOWNLOAD_DIR") {
        cfg.download_dir = Some(PathBuf::from(value));
    }
    if let Some(value) = get("MEDIAGATE_PROFILE_DIR") {
        cfg.profile_dir = Some(PathBuf::from(value));
    }
    if let Some(value) = get("MEDIAGATE_COOKIES_FILE") {
        cfg.cookies_file = Some(PathBuf::from(value));
    }
    if let Some(value) = get("MEDIAGATE_PROXY_URL") {
        cfg.proxy_url = Some(value.to_string());
    }
    if let Some(value) = get("MEDIAGATE_HOST") {
        cfg.host = Some(value.to_string());
    }
    if let Some(value) = get("MEDIAGATE_PORT").or_else(|| get("PORT")) {
        let port: u16 = value
            .parse()
            .with_context(|| format!("parsing port value {value:?}"))?;
        cfg.port = Some(port);
    }
    if let Some(value) = get("MEDIAGATE_TIMEOUT_SECS") {
        let secs: u64 = value
            .parse()
            .with_context(|| format!("parsing MEDIAGATE_TIMEOUT_SECS value {value:?}"))?;
        cfg.timeout_secs = Some(secs);
    }
    Ok(())
}

impl GatewayConfig {
    /// Resolves the configuration from a file path plus the current process
    /// environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_with_env(path, &env)
    }

    pub fn load_with_env(path: impl AsRef<Path>, env: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = read_env_config(path.as_ref())?.unwrap_or_default();
        apply_environment(&mut cfg, env)?;
        Ok(Self::from_env_config(cfg))
    }

    fn from_env_config(cfg: EnvConfig) -> Self {
        Self {
            ytdlp_bin: cfg.ytdlp_bin.unwrap_or_else(|| DEFAULT_YTDLP_BIN.into()),
            ffmpeg_bin: cfg.ffmpeg_bin.unwrap_or_else(|| DEFAULT_FFMPEG_BIN.into()),
            download_dir: cfg
                .download_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            profile_dir: cfg.profile_dir,
            cookies_file: cfg.cookies_file,
            proxy_url: cfg.proxy_url,
            host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.into()),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            subprocess_timeout: Duration::from_secs(
                cfg.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        }
    }

    /// Fail-fast checks that the original design deferred to request time:
    /// the download directory must be creatable and the proxy URL, when set,
    /// must parse.
    pub fn validate(&self) -> Result<()> {
        fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("creating download dir {}", self.download_dir.display()))?;
        if let Some(proxy) = &self.proxy_url {
            Url::parse(proxy).with_context(|| format!("parsing proxy URL {proxy:?}"))?;
        }
        if self.subprocess_timeout.is_zero() {
            bail!("subprocess timeout must be greater than zero");
        }
        Ok(())
    }
}
