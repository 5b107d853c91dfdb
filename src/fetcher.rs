use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, sync::Semaphore, time::timeout};
use tracing::{debug, info, warn};

/// Metadata parsed from the yt-dlp info sidecar. Every field is optional so
/// a sparse sidecar still parses; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub upload_date: Option<String>,
    pub view_count: Option<i64>,
    pub format: Option<String>,
    pub filename: Option<String>,
    pub filesize: Option<i64>,
    pub url: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
}

/// Caller-supplied knobs translated into yt-dlp arguments. None of these are
/// validated beyond presence; yt-dlp gets the final say.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    pub format: Option<String>,
    pub audio_only: bool,
    pub video_only: bool,
    pub quality: Option<String>,
    /// Accepted for API compatibility; output always goes to the per-job
    /// directory, so this is never translated into an argument.
    pub output_path: Option<String>,
    pub max_file_size: Option<String>,
    /// Escape hatch: each entry is appended verbatim as `--<key> <value>`.
    /// Not a stable contract.
    pub extra_args: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    Tool { command: String, stderr: String },
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to parse video info: {0}")]
    InvalidInfo(#[from] serde_json::Error),
    #[error("video file not found after download")]
    FileNotFound,
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("downloader is unavailable")]
    Unavailable,
}

/// Wraps yt-dlp invocations. All calls contend on an injected semaphore so
/// the number of concurrently running yt-dlp processes stays bounded
/// (capacity 1 in production).
pub struct Fetcher {
    command: String,
    tmp_root: PathBuf,
    permits: Arc<Semaphore>,
}

impl Fetcher {
    pub fn new(
        command: impl Into<String>,
        tmp_root: impl Into<PathBuf>,
        permits: Arc<Semaphore>,
    ) -> std::io::Result<Self> {
        let tmp_root = tmp_root.into();
        std::fs::create_dir_all(&tmp_root)?;

        Ok(Self {
            command: command.into(),
            tmp_root,
            permits,
        })
    }

    /// Fetches metadata without downloading anything, via `--dump-json`.
    ///
    /// `limit` is an absolute deadline: time spent waiting for a permit
    /// counts against it.
    pub async fn video_info(&self, url: &str, limit: Duration) -> Result<VideoInfo, FetchError> {
        let started = Instant::now();
        let _permit = timeout(limit, self.permits.acquire())
            .await
            .map_err(|_| FetchError::TimedOut(limit))?
            .map_err(|_| FetchError::Unavailable)?;

        info!(url, "getting video info");

        let output = self
            .run_tool(
                vec![
                    "--dump-json".to_string(),
                    "--no-playlist".to_string(),
                    url.to_string(),
                ],
                limit.saturating_sub(started.elapsed()),
            )
            .await?;

        let info: VideoInfo = serde_json::from_slice(&output.stdout)?;
        info!(url, title = ?info.title, "video info retrieved");
        Ok(info)
    }

    /// Downloads the video into a directory unique to this invocation and
    /// returns the media file path plus the parsed sidecar, if any. The job
    /// directory is removed on every failure path; on success its removal is
    /// the caller's responsibility via [`Fetcher::cleanup_file`].
    ///
    /// `limit` is an absolute deadline: time spent waiting for a permit
    /// counts against it.
    pub async fn download(
        &self,
        url: &str,
        options: Option<&DownloadOptions>,
        limit: Duration,
    ) -> Result<(PathBuf, Option<VideoInfo>), FetchError> {
        let started = Instant::now();
        let _permit = timeout(limit, self.permits.acquire())
            .await
            .map_err(|_| FetchError::TimedOut(limit))?
            .map_err(|_| FetchError::Unavailable)?;

        info!(url, "starting video download");

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let job_dir = self.tmp_root.join(format!("download_{nanos}"));
        tokio::fs::create_dir_all(&job_dir).await?;

        let args = build_download_args(&job_dir, url, options);

        if let Err(error) = self
            .run_tool(args, limit.saturating_sub(started.elapsed()))
            .await
        {
            remove_dir_best_effort(&job_dir).await;
            return Err(error);
        }

        let (media_file, info_file) = match scan_job_dir(&job_dir).await {
            Ok(found) => found,
            Err(error) => {
                remove_dir_best_effort(&job_dir).await;
                return Err(error);
            }
        };

        let Some(media_file) = media_file else {
            remove_dir_best_effort(&job_dir).await;
            return Err(FetchError::FileNotFound);
        };

        let info = match info_file {
            Some(path) => parse_info_sidecar(&path).await,
            None => None,
        };

        info!(url, file = %media_file.display(), "video downloaded");
        Ok((media_file, info))
    }

    /// Opens the downloaded file for streaming and reports its size.
    pub async fn video_reader(
        &self,
        path: &Path,
    ) -> Result<(tokio::fs::File, u64), FetchError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Removes the job directory that owns `path`. Best-effort: failures are
    /// logged and swallowed so they never mask the request outcome.
    pub async fn cleanup_file(&self, path: &Path) {
        let dir = path.parent().unwrap_or(path);
        remove_dir_best_effort(dir).await;
        debug!(path = %dir.display(), "cleaned up download directory");
    }

    async fn run_tool(&self, args: Vec<String>, limit: Duration) -> Result<Output, FetchError> {
        let command_future = Command::new(&self.command)
            .args(&args)
            .kill_on_drop(true)
            .output();

        let output = timeout(limit, command_future)
            .await
            .map_err(|_| FetchError::TimedOut(limit))?
            .map_err(|source| FetchError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(FetchError::Tool {
                command: self.command.clone(),
                stderr: last_stderr_line(&output.stderr),
            });
        }

        Ok(output)
    }
}

fn build_download_args(
    job_dir: &Path,
    url: &str,
    options: Option<&DownloadOptions>,
) -> Vec<String> {
    let output_template = job_dir.join("%(title)s.%(ext)s");
    let mut args = vec![
        "--no-playlist".to_string(),
        "--output".to_string(),
        output_template.to_string_lossy().into_owned(),
        "--write-info-json".to_string(),
    ];

    if let Some(options) = options {
        if let Some(format) = &options.format {
            args.push("--format".to_string());
            args.push(format.clone());
        }
        if options.audio_only {
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
        }
        if options.video_only {
            args.push("--format".to_string());
            args.push("best[height<=720]".to_string());
        }
        if let Some(quality) = &options.quality {
            args.push("--format".to_string());
            args.push(format!("best[height<={quality}]"));
        }
        if let Some(max_file_size) = &options.max_file_size {
            args.push("--max-filesize".to_string());
            args.push(max_file_size.clone());
        }
        for (key, value) in &options.extra_args {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
    }

    args.push(url.to_string());
    args
}

/// Finds the media file and the info sidecar among the job directory's
/// immediate entries. The `.json` entry is the sidecar; the first regular
/// non-json entry is the media file.
async fn scan_job_dir(
    job_dir: &Path,
) -> Result<(Option<PathBuf>, Option<PathBuf>), FetchError> {
    let mut media_file = None;
    let mut info_file = None;

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            info_file = Some(path);
        } else if entry.file_type().await?.is_file() && media_file.is_none() {
            media_file = Some(path);
        }
    }

    Ok((media_file, info_file))
}

async fn parse_info_sidecar(path: &Path) -> Option<VideoInfo> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to read info file");
            return None;
        }
    };

    match serde_json::from_slice(&data) {
        Ok(info) => Some(info),
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to parse info file");
            None
        }
    }
}

async fn remove_dir_best_effort(dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!(path = %dir.display(), %error, "failed to remove download directory");
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("the downloader exited with an error")
        .to_string()
}
