//! Aperture capture daemon: grabs frames, compresses them and writes them to disk

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aperture::storage::FileStorage;
use aperture::{Backend, CaptureSession, CaptureSource, Config};
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "aperture=debug" } else { "aperture=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn open_source(config: &Config) -> Result<Box<dyn CaptureSource>> {
    match config.capture.backend {
        #[cfg(feature = "v4l2")]
        Backend::V4l2 => Ok(Box::new(aperture::capture::V4l2Source::new())),
        #[cfg(feature = "rpicam")]
        Backend::Rpicam => {
            let cameras = aperture::capture::RpiCamSource::list_cameras();
            info!("Cameras answering rpicam-hello: {:?}", cameras);
            Ok(Box::new(aperture::capture::RpiCamSource::new()))
        }
        #[allow(unreachable_patterns)]
        backend => Err(eyre!("{backend:?} backend not compiled in")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    init_tracing(config.capture.verbose);

    info!("Aperture launching...");

    let source = open_source(&config)?;
    let storage = FileStorage::new(config.storage.clone())?;
    let frame_limit = config.storage.frame_limit;
    let quality = config.codec.quality;

    let session = Arc::new(CaptureSession::initialize(config, source)?);
    session.set_frame_callback(|frame| {
        tracing::trace!(sequence = frame.sequence, bytes = frame.len(), "Frame delivered");
    })?;
    session.start_capture()?;

    let mut saved = 0u64;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        if frame_limit.is_some_and(|limit| saved >= limit) {
            info!(saved, "Frame limit reached");
            break;
        }

        let next = {
            let session = Arc::clone(&session);
            tokio::task::spawn_blocking(move || session.capture_frame(Duration::from_millis(200)))
        };
        let frame = tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
            frame = next => frame?,
        };

        let Some(frame) = frame else {
            let health = session.health();
            warn!(status = ?health.status, failures = health.consecutive_failures, "No frame");
            continue;
        };

        let jpeg = match session.compress(&frame, quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                error!(sequence = frame.sequence, error = %e, "Compression failed");
                continue;
            }
        };
        match storage.save_jpeg(&jpeg, None) {
            Ok(path) => {
                saved += 1;
                info!(sequence = frame.sequence, bytes = jpeg.len(), "Saved {}", path.display());
            }
            Err(e) => error!(sequence = frame.sequence, error = %e, "Save failed"),
        }
    }

    session.stop_capture()?;
    let stats = session.stats();
    info!(
        captured = stats.frames_captured,
        evicted = stats.frames_evicted,
        reconnects = stats.reconnects,
        format_restarts = stats.format_restarts,
        fps = stats.last_fps,
        saved,
        "Aperture shutting down"
    );
    Ok(())
}
