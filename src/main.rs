use std::sync::Arc;

use axum::{Router, middleware::from_fn_with_state, routing::post};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use ytdlp_http::{
    auth, config,
    fetcher::Fetcher,
    handlers::{self, AppState},
    storage::S3Uploader,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytdlp_http=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(startup_error) = run().await {
        error!("server error: {startup_error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config::load()?;

    let tmp_root = std::env::temp_dir().join("ytdlp-downloads");
    let fetcher = Fetcher::new(
        config.ytdlp_path.clone(),
        tmp_root,
        // degree-1 admission: one yt-dlp process at a time, process-wide
        Arc::new(Semaphore::new(1)),
    )?;
    let uploader = S3Uploader::new(&config.s3);

    let state = AppState {
        fetcher: Arc::new(fetcher),
        uploader: Arc::new(uploader),
    };

    let app = Router::new()
        .route("/download", post(handlers::download))
        .route("/upload", post(handlers::upload))
        .with_state(state)
        .layer(from_fn_with_state(
            Arc::new(config.auth.clone()),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.addr).await?;
    info!("listening on {}", config.server.addr);

    axum::serve(listener, app).await?;
    Ok(())
}
