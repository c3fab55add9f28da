mod error;

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PodtubeConfig;

pub use error::{ConvertError, ConvertResult};

/// Prefix of the per-attempt staging directories created next to artifacts.
pub const STAGING_PREFIX: &str = ".podtube-staging-";

const LIVE_STATES: &[&str] = &["is_live", "is_upcoming", "is_premiere"];
const AUDIO_FORMAT: &str = "m4a/bestaudio/best";
const VIDEO_FORMAT: &str = "bestvideo+bestaudio/best";

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// Produces the audio artifact for a key at `destination`.
///
/// Implementations must never leave a partial file at `destination`.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, key: &str, destination: &Path) -> ConvertResult<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct YtDlpOptions {
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub url_template: String,
    pub proxy: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub extractor_lang: Option<String>,
}

impl YtDlpOptions {
    pub fn from_config(config: &PodtubeConfig) -> Self {
        Self {
            yt_dlp: config.conversion.yt_dlp.clone(),
            ffmpeg: config.conversion.ffmpeg.clone(),
            url_template: config.conversion.url_template.clone(),
            proxy: config.conversion.proxy.clone(),
            cookies_file: config.paths.cookies_file.clone(),
            extractor_lang: config.conversion.extractor_lang.clone(),
        }
    }

    fn source_url(&self, key: &str) -> String {
        self.url_template.replace("{key}", key)
    }
}

/// Fetches audio with yt-dlp, falling back to a full video download plus an
/// ffmpeg transcode when the audio-only path fails.
pub struct YtDlpConverter {
    options: YtDlpOptions,
    executor: Arc<dyn CommandExecutor>,
}

impl YtDlpConverter {
    pub fn new(options: YtDlpOptions) -> Self {
        Self {
            options,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    async fn run_tool(&self, program: &Path, args: &[String]) -> ConvertResult<Output> {
        self.executor
            .run(program, args)
            .await
            .map_err(|source| ConvertError::Command {
                program: program.display().to_string(),
                source,
            })
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--extractor-retries".to_string(),
            "1".to_string(),
            "--mark-watched".to_string(),
            "--ffmpeg-location".to_string(),
            self.options.ffmpeg.display().to_string(),
        ];
        if let Some(proxy) = &self.options.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &self.options.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
        if let Some(lang) = &self.options.extractor_lang {
            args.push("--extractor-args".to_string());
            args.push(format!("youtube:lang={lang};player_skip=webpage"));
        }
        args
    }

    async fn probe_live_status(&self, key: &str, url: &str) -> ConvertResult<()> {
        let mut args = self.base_args();
        args.extend([
            "--skip-download".to_string(),
            "--print".to_string(),
            "live_status".to_string(),
            url.to_string(),
        ]);
        let output = self.run_tool(&self.options.yt_dlp, &args).await?;
        if !output.status.success() {
            return Err(ConvertError::Download(failure_text(&output)));
        }
        let status = String::from_utf8_lossy(&output.stdout);
        let status = status.trim();
        debug!(key = %key, live_status = %status, "probed video");
        if LIVE_STATES.contains(&status) {
            return Err(ConvertError::Download(format!(
                "Video is Live Stream or Premiere: {key}"
            )));
        }
        Ok(())
    }

    async fn fetch_audio(&self, key: &str, url: &str, staging: &Path) -> ConvertResult<PathBuf> {
        let mut args = self.base_args();
        args.extend([
            "-f".to_string(),
            AUDIO_FORMAT.to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
            "-o".to_string(),
            staging.join(format!("{key}.%(ext)s")).display().to_string(),
            url.to_string(),
        ]);
        let output = self.run_tool(&self.options.yt_dlp, &args).await?;
        if !output.status.success() {
            return Err(ConvertError::Download(failure_text(&output)));
        }
        let audio = staging.join(format!("{key}.mp3"));
        match tokio::fs::metadata(&audio).await {
            Ok(_) => Ok(audio),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                ConvertError::Download(format!("no audio produced for {key}")),
            ),
            Err(source) => Err(ConvertError::io(audio, source)),
        }
    }

    async fn fetch_video(&self, key: &str, url: &str, staging: &Path) -> ConvertResult<PathBuf> {
        let mut args = self.base_args();
        args.extend([
            "-f".to_string(),
            VIDEO_FORMAT.to_string(),
            "-o".to_string(),
            staging
                .join(format!("{key}.video.%(ext)s"))
                .display()
                .to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            url.to_string(),
        ]);
        let output = self.run_tool(&self.options.yt_dlp, &args).await?;
        if !output.status.success() {
            return Err(ConvertError::Download(failure_text(&output)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let video = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|path| path.exists())
            .ok_or_else(|| ConvertError::Download(format!("no video produced for {key}")))?;
        Ok(video)
    }

    async fn transcode(&self, video: &Path, audio: &Path) -> ConvertResult<()> {
        let args = vec![
            "-loglevel".to_string(),
            "panic".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            video.display().to_string(),
            "-vn".to_string(),
            "-f".to_string(),
            "mp3".to_string(),
            audio.display().to_string(),
        ];
        let output = self.run_tool(&self.options.ffmpeg, &args).await?;
        if !output.status.success() {
            return Err(ConvertError::Transcode(failure_text(&output)));
        }
        if !audio.exists() {
            return Err(ConvertError::Transcode(format!(
                "ffmpeg produced no output at {}",
                audio.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Converter for YtDlpConverter {
    async fn convert(&self, key: &str, destination: &Path) -> ConvertResult<PathBuf> {
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConvertError::io(parent, source))?;
        // Staging lives beside the artifact so the final rename stays on one filesystem.
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)
            .map_err(|source| ConvertError::io(parent, source))?;

        let url = self.options.source_url(key);
        debug!(key = %key, url = %url, "starting conversion");
        self.probe_live_status(key, &url).await?;

        let audio = match self.fetch_audio(key, &url, staging.path()).await {
            Ok(audio) => audio,
            Err(err) if err.is_filesystem() => return Err(err),
            Err(err) => {
                warn!(key = %key, error = %err, "direct audio download failed, transcoding video");
                let video = self.fetch_video(key, &url, staging.path()).await?;
                let audio = staging.path().join(format!("{key}.mp3"));
                self.transcode(&video, &audio).await?;
                audio
            }
        };

        tokio::fs::rename(&audio, destination)
            .await
            .map_err(|source| ConvertError::io(destination, source))?;
        info!(key = %key, path = %destination.display(), "audio ready");
        Ok(destination.to_path_buf())
    }
}

fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        debug!(stderr = %stderr, "tool reported failure");
        stderr.to_string()
    }
}
