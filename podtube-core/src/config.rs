use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::classify::UnavailableKind;
use crate::error::{ConfigError, Result};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:15000";
pub const DEFAULT_URL_TEMPLATE: &str = "https://www.youtube.com/watch?v={key}";
/// Upper bound for cache TTLs: one hundred years.
pub const MAX_TTL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PodtubeConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub conversion: ConversionSection,
    pub cache: CacheSection,
    pub classification: ClassificationSection,
}

impl PodtubeConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .map_err(|err| ConfigError::invalid("server.listen", format!("{err}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.conversion.max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "conversion.max_concurrent",
                "must be at least 1",
            ));
        }
        if self.conversion.tick_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "conversion.tick_interval_seconds",
                "must be greater than zero",
            ));
        }
        if self.conversion.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "conversion.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.conversion.chunk_size_bytes == 0 {
            return Err(ConfigError::invalid(
                "conversion.chunk_size_bytes",
                "must be greater than zero",
            ));
        }
        for (field, seconds) in [
            ("cache.audio_ttl_seconds", self.cache.audio_ttl_seconds),
            ("cache.verdict_ttl_seconds", self.cache.verdict_ttl_seconds),
        ] {
            if seconds > MAX_TTL_SECONDS {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be at most {MAX_TTL_SECONDS} seconds"),
                ));
            }
        }
        if self.cache.sweep_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "cache.sweep_interval_seconds",
                "must be greater than zero",
            ));
        }
        if !self.conversion.url_template.contains("{key}") {
            return Err(ConfigError::invalid(
                "conversion.url_template",
                "must contain a {key} placeholder",
            ));
        }
        url::Url::parse(&self.conversion.source_url("probe")).map_err(|err| {
            ConfigError::invalid("conversion.url_template", format!("not a URL: {err}"))
        })?;
        self.listen_addr()?;
        Ok(())
    }

    /// Applies `PODTUBE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(listen) = get("PODTUBE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(dir) = get("PODTUBE_AUDIO_DIR") {
            self.paths.audio_dir = PathBuf::from(dir);
        }
        if let Some(cookies) = get("PODTUBE_COOKIES_FILE") {
            self.paths.cookies_file = Some(PathBuf::from(cookies));
        }
        if let Some(proxy) = get("PODTUBE_PROXY") {
            self.conversion.proxy = Some(proxy);
        }
        if let Some(value) = get("PODTUBE_MAX_CONCURRENT") {
            self.conversion.max_concurrent = parse_override("PODTUBE_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = get("PODTUBE_TICK_INTERVAL_SECONDS") {
            self.conversion.tick_interval_seconds =
                parse_override("PODTUBE_TICK_INTERVAL_SECONDS", &value)?;
        }
        if let Some(value) = get("PODTUBE_AUDIO_TTL_SECONDS") {
            self.cache.audio_ttl_seconds = parse_override("PODTUBE_AUDIO_TTL_SECONDS", &value)?;
        }
        if let Some(value) = get("PODTUBE_VERDICT_TTL_SECONDS") {
            self.cache.verdict_ttl_seconds =
                parse_override("PODTUBE_VERDICT_TTL_SECONDS", &value)?;
        }
        if let Some(value) = get("PODTUBE_SWEEP_INTERVAL_SECONDS") {
            self.cache.sweep_interval_seconds =
                parse_override("PODTUBE_SWEEP_INTERVAL_SECONDS", &value)?;
        }
        Ok(())
    }
}

fn parse_override<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| ConfigError::invalid(name, format!("{value:?}: {err}")))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
    pub audio_route_prefix: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            audio_route_prefix: "/youtube/audio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsSection {
    pub audio_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            audio_dir: PathBuf::from("./youtube/audio"),
            cookies_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConversionSection {
    pub max_concurrent: usize,
    pub tick_interval_seconds: u64,
    pub poll_interval_ms: u64,
    pub chunk_size_bytes: usize,
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub proxy: Option<String>,
    pub extractor_lang: Option<String>,
    pub url_template: String,
}

impl ConversionSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn source_url(&self, key: &str) -> String {
        self.url_template.replace("{key}", key)
    }
}

impl Default for ConversionSection {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            tick_interval_seconds: 1,
            poll_interval_ms: 500,
            chunk_size_bytes: 1024 * 1024,
            yt_dlp: PathBuf::from("yt-dlp"),
            ffmpeg: PathBuf::from("ffmpeg"),
            proxy: None,
            extractor_lang: None,
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
    pub audio_ttl_seconds: u64,
    pub verdict_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl CacheSection {
    pub fn audio_ttl(&self) -> chrono::Duration {
        ttl(self.audio_ttl_seconds)
    }

    pub fn verdict_ttl(&self) -> chrono::Duration {
        ttl(self.verdict_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

// Clamped so an unvalidated section still yields a usable duration.
fn ttl(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_TTL_SECONDS) as i64)
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            audio_ttl_seconds: 3 * 24 * 60 * 60,
            verdict_ttl_seconds: 60 * 60,
            sweep_interval_seconds: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassificationSection {
    /// Replaces the built-in table when non-empty. Order matters: first match wins.
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub kind: UnavailableKind,
    pub message: String,
}

pub fn load_podtube_config<P: AsRef<Path>>(path: P) -> Result<PodtubeConfig> {
    let config: PodtubeConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
