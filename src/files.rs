use std::path::Path;

use chrono::Utc;
use uuid::Uuid;

/// Fallback base name when a filename sanitizes down to nothing.
pub const FALLBACK_NAME: &str = "file";

const MAX_SANITIZED_LEN: usize = 100;

pub fn content_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "m4v" => "video/x-m4v",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "opus" => "audio/opus",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Replaces everything outside `[a-zA-Z0-9-_.]` with `_`, caps the result at
/// 100 characters, and strips leading/trailing underscores. Idempotent:
/// truncation happens before the trim so a second pass is a no-op.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len().min(MAX_SANITIZED_LEN));

    for character in name.chars().take(MAX_SANITIZED_LEN) {
        if character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.') {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Prefixes a sanitized key with a unix timestamp and a short random hex
/// string so repeated uploads of the same name never collide.
pub fn generate_unique_key(original: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let random = Uuid::new_v4().simple().to_string();

    let (base, ext) = split_extension(original);
    let safe_base = sanitize_filename(base);

    format!("{timestamp}_{}_{safe_base}{ext}", &random[..8])
}

/// Splits `name` into (stem, extension-with-dot). A name without a dot after
/// the last separator has an empty extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    let start = name.rfind('/').map_or(0, |index| index + 1);
    match name[start..].rfind('.') {
        Some(dot) if dot > 0 => name.split_at(start + dot),
        _ => (name, ""),
    }
}
