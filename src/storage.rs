use std::{path::Path, time::Duration};

use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::S3Config;
use crate::fetcher::VideoInfo;
use crate::files;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to upload {key}: {message}")]
    Upload { key: String, message: String },
    #[error("failed to delete {key}: {message}")]
    Delete { key: String, message: String },
    #[error("storage call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to encode metadata document: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Outcome of a single object upload.
#[derive(Debug, Clone, Serialize)]
pub struct FileUploadResult {
    pub key: String,
    pub bucket: String,
    pub location: String,
    pub etag: String,
    pub size: u64,
    pub content_type: String,
    pub md5_hash: String,
}

/// Outcome of a video + metadata pair upload. Only ever constructed once
/// both objects are stored.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub video_upload: FileUploadResult,
    pub metadata_upload: FileUploadResult,
    pub total_size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct MetadataDocument<'a> {
    original_filename: &'a str,
    upload_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_info: Option<&'a VideoInfo>,
}

/// Uploads downloaded videos and their metadata sidecars to an
/// S3-compatible bucket.
pub struct S3Uploader {
    client: Client,
    bucket: String,
    endpoint: Option<String>,
    region: String,
}

impl S3Uploader {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "ytdlp-http",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
        }
    }

    /// Uploads the video and a derived metadata document as sibling objects.
    /// If the metadata upload fails after the video object was stored, the
    /// video object is deleted (best-effort) and the metadata error is
    /// surfaced, so storage never ends up with a video lacking its sidecar.
    pub async fn upload_video_with_metadata(
        &self,
        path: &Path,
        key: &str,
        video_info: Option<&VideoInfo>,
        limit: Duration,
    ) -> Result<UploadResult, StorageError> {
        info!(file = %path.display(), key, "starting video and metadata upload");

        let video_upload = self.upload_file(path, key, limit).await?;

        let metadata_key = metadata_key(key);
        let original_filename = file_name(path);
        let document = serde_json::to_vec_pretty(&MetadataDocument {
            original_filename: &original_filename,
            upload_timestamp: Utc::now().to_rfc3339(),
            video_info,
        })?;

        let metadata_upload = match self
            .put_object(
                &metadata_key,
                document,
                "application/json",
                &original_filename,
                limit,
            )
            .await
        {
            Ok(result) => result,
            Err(upload_error) => {
                error!(
                    error = %upload_error,
                    key,
                    "metadata upload failed, removing video object"
                );
                if let Err(delete_error) = self.delete_file(key, limit).await {
                    error!(
                        error = %delete_error,
                        key,
                        "failed to remove video object after metadata upload failure"
                    );
                }
                return Err(upload_error);
            }
        };

        let result = UploadResult {
            total_size: video_upload.size + metadata_upload.size,
            uploaded_at: Utc::now(),
            video_upload,
            metadata_upload,
        };

        info!(
            video_key = %result.video_upload.key,
            metadata_key = %result.metadata_upload.key,
            total_size = result.total_size,
            "video and metadata uploaded"
        );

        Ok(result)
    }

    /// Reads the file fully, hashes it, and stores it in a single put.
    async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        limit: Duration,
    ) -> Result<FileUploadResult, StorageError> {
        let data = tokio::fs::read(path).await.map_err(|source| StorageError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let content_type = files::content_type_for_path(path);
        self.put_object(key, data, content_type, &file_name(path), limit)
            .await
    }

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        original_filename: &str,
        limit: Duration,
    ) -> Result<FileUploadResult, StorageError> {
        let size = data.len() as u64;
        let md5_hash = format!("{:x}", Md5::digest(&data));

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .content_length(size as i64)
            .metadata("original-filename", original_filename)
            .metadata("upload-timestamp", Utc::now().to_rfc3339());

        let output = tokio::time::timeout(limit, request.send())
            .await
            .map_err(|_| StorageError::TimedOut(limit))?
            .map_err(|sdk_error| StorageError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&sdk_error).to_string(),
            })?;

        let etag = output
            .e_tag()
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();

        info!(key, size, content_type, "object uploaded");

        Ok(FileUploadResult {
            key: key.to_string(),
            bucket: self.bucket.clone(),
            location: self.location(key),
            etag,
            size,
            content_type: content_type.to_string(),
            md5_hash,
        })
    }

    pub async fn delete_file(&self, key: &str, limit: Duration) -> Result<(), StorageError> {
        let request = self.client.delete_object().bucket(&self.bucket).key(key);

        tokio::time::timeout(limit, request.send())
            .await
            .map_err(|_| StorageError::TimedOut(limit))?
            .map_err(|sdk_error| StorageError::Delete {
                key: key.to_string(),
                message: DisplayErrorContext(&sdk_error).to_string(),
            })?;

        info!(key, "object deleted");
        Ok(())
    }

    /// Deletes a video object and its metadata sibling. Both deletions are
    /// attempted independently, each bounded by `limit`; failures are
    /// aggregated into one error.
    pub async fn delete_video_and_metadata(
        &self,
        video_key: &str,
        limit: Duration,
    ) -> Result<(), StorageError> {
        let metadata_key = metadata_key(video_key);
        let mut failures = Vec::new();

        if let Err(error) = self.delete_file(video_key, limit).await {
            failures.push(error.to_string());
        }
        if let Err(error) = self.delete_file(&metadata_key, limit).await {
            failures.push(error.to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Delete {
                key: video_key.to_string(),
                message: failures.join("; "),
            })
        }
    }

    fn location(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => {
                format!("{}/{}/{key}", endpoint.trim_end_matches('/'), self.bucket)
            }
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{key}",
                self.bucket, self.region
            ),
        }
    }
}

/// Derives the sibling metadata key: the video key with its extension
/// replaced by `.json`.
pub fn metadata_key(video_key: &str) -> String {
    let (base, _ext) = files::split_extension(video_key);
    format!("{base}.json")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| files::FALLBACK_NAME.to_string())
}
