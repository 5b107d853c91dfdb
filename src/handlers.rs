use std::{path::Path, sync::Arc, time::Duration};

use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA,
        },
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::error::ApiError;
use crate::fetcher::{DownloadOptions, Fetcher, VideoInfo};
use crate::files;
use crate::storage::{S3Uploader, UploadResult};

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct AppState {
    pub fetcher: Arc<Fetcher>,
    pub uploader: Arc<S3Uploader>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
    #[serde(default)]
    options: Option<DownloadOptions>,
    /// Seconds; bounds the whole fetch.
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    url: String,
    s3_key: String,
    #[serde(default)]
    options: Option<DownloadOptions>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<UploadResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl UploadResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// `POST /download` — fetches the video and streams it back.
pub async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload
        .map_err(|rejection| ApiError::bad_request(format!("Invalid request body: {rejection}")))?;

    let url = request.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }

    let limit = effective_timeout(request.timeout, DEFAULT_DOWNLOAD_TIMEOUT);
    info!(url, ?limit, "starting video download");

    let (path, video_info) = state
        .fetcher
        .download(url, request.options.as_ref(), limit)
        .await
        .map_err(|fetch_error| {
            error!(error = %fetch_error, url, "failed to download video");
            ApiError::from(fetch_error)
        })?;

    let (file, size) = match state.fetcher.video_reader(&path).await {
        Ok(reader) => reader,
        Err(read_error) => {
            error!(error = %read_error, file = %path.display(), "failed to open downloaded file");
            state.fetcher.cleanup_file(&path).await;
            return Err(ApiError::file_read_error("Failed to read downloaded file"));
        }
    };
    // The open descriptor keeps the bytes readable after the unlink, so the
    // job directory can go away before the body finishes streaming.
    state.fetcher.cleanup_file(&path).await;

    let filename = download_filename(&path, video_info.as_ref());
    let content_type = files::content_type_for_path(&path);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::internal("Failed to build Content-Length header"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Failed to build Content-Disposition header"))?,
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));

    info!(filename = %filename, size, "streaming video file");

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// `POST /upload` — fetches the video and stores it plus its metadata
/// sidecar in the bucket.
pub async fn upload(
    State(state): State<AppState>,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(UploadResponse::failure(format!(
                    "Invalid request body: {rejection}"
                ))),
            )
                .into_response();
        }
    };

    let url = request.url.trim();
    let requested_key = request.s3_key.trim();
    if url.is_empty() || requested_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(UploadResponse::failure("url and s3_key are required")),
        )
            .into_response();
    }

    let limit = effective_timeout(request.timeout, DEFAULT_UPLOAD_TIMEOUT);
    let started = Instant::now();
    info!(url, s3_key = requested_key, ?limit, "starting video download and upload");

    let (path, video_info) = match state
        .fetcher
        .download(url, request.options.as_ref(), limit)
        .await
    {
        Ok(downloaded) => downloaded,
        Err(fetch_error) => {
            error!(error = %fetch_error, url, "failed to download video");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(UploadResponse::failure(format!(
                    "Failed to download video: {fetch_error}"
                ))),
            )
                .into_response();
        }
    };

    let key = unique_s3_key(requested_key, &path);
    let remaining = limit.saturating_sub(started.elapsed());

    let upload_result = state
        .uploader
        .upload_video_with_metadata(&path, &key, video_info.as_ref(), remaining)
        .await;
    state.fetcher.cleanup_file(&path).await;

    match upload_result {
        Ok(result) => {
            info!(
                video_key = %result.video_upload.key,
                total_size = result.total_size,
                "video uploaded to storage"
            );
            (
                StatusCode::OK,
                Json(UploadResponse {
                    success: true,
                    message: Some("Video uploaded successfully to S3-compatible storage".to_string()),
                    result: Some(result),
                    error: None,
                }),
            )
                .into_response()
        }
        Err(storage_error) => {
            error!(error = %storage_error, key = %key, "failed to upload to storage");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(UploadResponse::failure(format!(
                    "Failed to upload to S3: {storage_error}"
                ))),
            )
                .into_response()
        }
    }
}

fn effective_timeout(seconds: Option<u64>, default: Duration) -> Duration {
    match seconds {
        Some(seconds) if seconds > 0 => Duration::from_secs(seconds),
        _ => default,
    }
}

/// Sanitized video title (or a fixed fallback) plus the media file's real
/// extension.
fn download_filename(path: &Path, video_info: Option<&VideoInfo>) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| ".mp4".to_string());

    let base = video_info
        .and_then(|info| info.title.as_deref())
        .filter(|title| !title.trim().is_empty())
        .map(files::sanitize_filename)
        .unwrap_or_else(|| "video".to_string());

    format!("{base}{extension}")
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

/// Collision-resistant storage key: the requested key (given the media
/// file's extension when it has none) sanitized and prefixed with a
/// timestamp and random suffix.
fn unique_s3_key(requested_key: &str, media_path: &Path) -> String {
    let media_extension = media_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    let (_, requested_extension) = files::split_extension(requested_key);
    let keyed = if requested_extension.is_empty() {
        format!("{requested_key}{media_extension}")
    } else {
        requested_key.to_string()
    };

    // sanitize the whole key, extension included, before deriving the
    // unique name
    files::generate_unique_key(&files::sanitize_filename(&keyed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S3Config;
    use axum::{Router, routing::post};
    use http_body_util::BodyExt;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    fn stub_tool(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn router(root: &Path, tool_body: &str) -> Router {
        let tool = stub_tool(root, tool_body);
        let fetcher = Fetcher::new(
            tool.to_string_lossy().into_owned(),
            root.join("downloads"),
            Arc::new(Semaphore::new(1)),
        )
        .unwrap();
        let uploader = S3Uploader::new(&S3Config {
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            region: "us-east-1".to_string(),
            bucket: "videos".to_string(),
            endpoint: Some("http://127.0.0.1:1".to_string()),
        });

        Router::new()
            .route("/download", post(download))
            .route("/upload", post(upload))
            .with_state(AppState {
                fetcher: Arc::new(fetcher),
                uploader: Arc::new(uploader),
            })
    }

    async fn post_json(router: Router, uri: &str, body: &str) -> Response {
        router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn download_rejects_malformed_body() {
        let root = TempDir::new().unwrap();
        let response = post_json(router(root.path(), "exit 0"), "/download", "{not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn download_requires_url() {
        let root = TempDir::new().unwrap();
        let router = router(root.path(), "exit 0");

        let response = post_json(router.clone(), "/download", "{}").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = post_json(router, "/download", r#"{"url":"  "}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn download_streams_file_with_headers_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let script = r#"
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
dir=$(dirname "$out")
printf 'media-bytes' > "$dir/clip.mp4"
printf '{"title":"My Clip"}' > "$dir/clip.info.json"
"#;
        let response = post_json(
            router(root.path(), script),
            "/download",
            r#"{"url":"https://example/video"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[CONTENT_LENGTH], "11");
        assert_eq!(headers[PRAGMA], "no-cache");
        assert_eq!(headers[CACHE_CONTROL], "no-cache, no-store, must-revalidate");
        let disposition = headers[CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.contains("attachment"));
        assert!(disposition.contains("My_Clip.mp4"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"media-bytes");

        // eager cleanup: the job dir is gone even while bytes were in flight
        assert_eq!(
            std::fs::read_dir(root.path().join("downloads")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn download_failure_returns_structured_error() {
        let root = TempDir::new().unwrap();
        let response = post_json(
            router(root.path(), "echo 'ERROR: no video' >&2\nexit 1"),
            "/download",
            r#"{"url":"https://example/video"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "download_failed");
        assert!(body["message"].as_str().unwrap().contains("no video"));
    }

    #[tokio::test]
    async fn upload_requires_url_and_key() {
        let root = TempDir::new().unwrap();
        let router = router(root.path(), "exit 0");

        let response = post_json(router.clone(), "/upload", r#"{"url":"https://x"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);

        let response = post_json(router, "/upload", r#"{"url":"https://x","s3_key":""}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_download_failure_reports_error_body() {
        let root = TempDir::new().unwrap();
        let response = post_json(
            router(root.path(), "exit 1"),
            "/upload",
            r#"{"url":"https://example/video","s3_key":"clip"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .starts_with("Failed to download video")
        );
    }

    #[test]
    fn download_filename_prefers_sanitized_title() {
        let info = VideoInfo {
            title: Some("My Video: part 1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            download_filename(Path::new("/tmp/x/raw.webm"), Some(&info)),
            "My_Video__part_1.webm"
        );
        assert_eq!(download_filename(Path::new("/tmp/x/raw.webm"), None), "video.webm");
        assert_eq!(download_filename(Path::new("/tmp/x/raw"), None), "video.mp4");
    }

    #[test]
    fn unique_s3_key_inherits_media_extension() {
        let key = unique_s3_key("my clip", Path::new("/tmp/x/raw.webm"));
        assert!(key.ends_with(".webm"));
        assert!(key.contains("my_clip"));

        let key = unique_s3_key("clip.mp4", Path::new("/tmp/x/raw.webm"));
        assert!(key.ends_with(".mp4"));
    }

    #[test]
    fn unique_s3_key_sanitizes_the_extension() {
        let key = unique_s3_key("clip.mp 4", Path::new("/tmp/x/raw.webm"));
        assert!(!key.contains(' '));
        assert!(key.ends_with(".mp_4"));
        assert!(
            key.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        );
    }

    #[test]
    fn effective_timeout_falls_back_to_default() {
        assert_eq!(
            effective_timeout(None, DEFAULT_DOWNLOAD_TIMEOUT),
            DEFAULT_DOWNLOAD_TIMEOUT
        );
        assert_eq!(
            effective_timeout(Some(0), DEFAULT_DOWNLOAD_TIMEOUT),
            DEFAULT_DOWNLOAD_TIMEOUT
        );
        assert_eq!(
            effective_timeout(Some(7), DEFAULT_DOWNLOAD_TIMEOUT),
            Duration::from_secs(7)
        );
    }
}
