//! Hermes detection relay: capture, inference workers and subscriber fan-out

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use hermes::capture::SyntheticCapture;
use hermes::detect::NullDetector;
use hermes::{AppContext, CaptureSource, Config};

/// Running capture collaborator
enum Capture {
    Synthetic(SyntheticCapture),
    #[cfg(feature = "gstreamer-pipeline")]
    Gstreamer(hermes::capture::GstCapture),
}

impl Capture {
    fn start(ctx: &AppContext) -> hermes::Result<Self> {
        let config = ctx.config();
        match config.capture.source {
            CaptureSource::Synthetic => Ok(Capture::Synthetic(SyntheticCapture::start(
                ctx.frame_ingress(),
                &config.capture,
            )?)),
            #[cfg(feature = "gstreamer-pipeline")]
            CaptureSource::Gstreamer => {
                let mut capture = hermes::capture::GstCapture::new(
                    ctx.frame_ingress(),
                    &config.capture,
                    &config.gstreamer,
                )?;
                capture.start_stream()?;
                Ok(Capture::Gstreamer(capture))
            }
        }
    }

    fn stop(self) {
        match self {
            Capture::Synthetic(capture) => {
                capture.stop();
            }
            #[cfg(feature = "gstreamer-pipeline")]
            Capture::Gstreamer(mut capture) => {
                if let Err(e) = capture.stop_stream() {
                    error!("Failed to stop capture: {}", e);
                }
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hermes=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Hermes launching...");

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HERMES_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    let ctx = Arc::new(AppContext::new(config)?);
    ctx.attach_relay()?;

    let capture = Capture::start(&ctx)?;
    let pipeline = ctx.spawn_inference(|_| Ok(NullDetector))?;

    let mut server = tokio::spawn(hermes::server::serve(ctx.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received Ctrl-C");
        }
        res = &mut server => {
            // The server only returns early on failure
            error!("Subscriber server exited: {:?}", res);
        }
    }

    // Shut down upstream first so the relay drains the last results
    capture.stop();
    let workers = tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    for worker in &workers {
        info!(
            "Worker {}: {} processed, {} failed",
            worker.worker, worker.processed, worker.failed
        );
    }
    ctx.shutdown().await;

    if !server.is_finished() {
        server
            .await?
            .map_err(|e| eyre!("subscriber server failed: {e}"))?;
    }

    info!("Hermes shutting down");
    Ok(())
}
