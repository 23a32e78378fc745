use axum::{response::Json, routing::get, Router};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod db;
mod error;
mod jobs;
mod media;
mod review;

use config::Config;
use media::{ffmpeg::FFmpegWrapper, FfmpegGenerator, MosaicGenerator};

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mosaic_daemon=info,tower_http=info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let mosaic_dir = config.mosaic_dir();
    std::fs::create_dir_all(&mosaic_dir)?;
    std::fs::create_dir_all(config.archive_dir())?;

    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(db::Database::new(&db_path)?);
    info!(path = %db_path.display(), "database initialized");

    let generator: Arc<dyn MosaicGenerator> = Arc::new(FfmpegGenerator {
        ffmpeg: FFmpegWrapper {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            probe_timeout: config.probe_timeout(),
            generate_timeout: config.generate_timeout(),
        },
        grid: config.grid(),
        tile_width: config.tile_width,
    });
    let scanner = Arc::new(jobs::Scanner::new(
        db.clone(),
        generator,
        config.scanner_settings(),
    ));

    let shutdown = CancellationToken::new();

    if config.scan_on_start {
        scanner.spawn_scan(shutdown.child_token());
    }
    if config.scan_interval_secs > 0 {
        let scheduler = jobs::processor::ScanScheduler::new(
            scanner.clone(),
            Duration::from_secs(config.scan_interval_secs),
        );
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            scheduler.run(cancel).await;
        });
    }

    let state = api::AppState {
        db: db.clone(),
        scanner: scanner.clone(),
        navigator: Arc::new(review::Navigator::new(db.clone())),
        shutdown: shutdown.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api::router(state))
        .nest_service("/mosaics", ServeDir::new(&mosaic_dir))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!(
        addr = %config.bind,
        input = %config.input_dir.display(),
        mosaics = %mosaic_dir.display(),
        "starting mosaic daemon"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
