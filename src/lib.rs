//! HTTP façade around yt-dlp: downloads a video on request and either
//! streams it back to the caller or uploads it together with a JSON
//! metadata sidecar to an S3-compatible bucket.

pub mod auth;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod files;
pub mod handlers;
pub mod storage;
