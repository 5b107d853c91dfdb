use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVar(&'static str),
    #[error("AUTH_API_KEY is required when auth is enabled")]
    MissingApiKey,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub s3: S3Config,
    pub auth: AuthConfig,
    pub ytdlp_path: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    /// SHA-256 hex digest of the expected bearer token. The raw token is
    /// never configured or stored.
    pub api_key_hash: String,
}

/// Loads configuration from the environment. Missing required values are
/// startup-fatal; the process should log and exit.
pub fn load() -> Result<Config, ConfigError> {
    let auth = AuthConfig {
        enabled: read_bool_env("AUTH_ENABLED").unwrap_or(false),
        api_key_hash: read_env("AUTH_API_KEY").unwrap_or_default(),
    };
    if auth.enabled && auth.api_key_hash.is_empty() {
        return Err(ConfigError::MissingApiKey);
    }

    let s3 = S3Config {
        access_key_id: read_env("S3_ACCESS_KEY_ID")
            .ok_or(ConfigError::MissingVar("S3_ACCESS_KEY_ID"))?,
        secret_access_key: read_env("S3_SECRET_ACCESS_KEY")
            .ok_or(ConfigError::MissingVar("S3_SECRET_ACCESS_KEY"))?,
        region: read_env("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        bucket: read_env("S3_BUCKET").ok_or(ConfigError::MissingVar("S3_BUCKET"))?,
        endpoint: read_env("S3_ENDPOINT"),
    };

    Ok(Config {
        server: ServerConfig {
            addr: read_env("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        },
        s3,
        auth,
        ytdlp_path: read_env("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
    })
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
