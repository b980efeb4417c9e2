pub mod app;
pub mod broadcast;
pub mod capture;
pub mod detect;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod server;
pub mod utils;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use app::{AppContext, FrameIngress};
pub use broadcast::{BroadcastReport, Broadcaster, ServerMessage, SubscriberSink};
pub use error::{Error, Result};
pub use relay::{RelayJob, RelayStats, ResultRelay};

/// Environment variables override file values: `HERMES__SERVER__BIND_ADDR`
const ENV_PREFIX: &str = "HERMES";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub detection: DetectionConfig,
    pub server: ServerConfig,
    #[cfg(feature = "gstreamer-pipeline")]
    pub gstreamer: GStreamerConfig,
}

/// Where ingress frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// Generated frames, no device needed
    Synthetic,
    #[cfg(feature = "gstreamer-pipeline")]
    Gstreamer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub grab_timeout_ms: u64,
    pub inference_workers: usize,
    /// Per-worker inference rate cap; `None` runs unthrottled
    pub max_fps: Option<f64>,
    pub relay_capacity: usize,
    pub pin_workers: bool, // One core per worker, round robin
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Detections below this confidence are not broadcast
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub keepalive_interval_secs: u64,
    /// Upper bound on one subscriber send, after which it is evicted
    pub send_timeout_ms: u64,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GStreamerConfig {
    /// Full launch line; must end in `appsink name=appsink`
    pub custom_pipeline: Option<String>,
    /// RTSP URL, used when no custom pipeline is given
    pub location: Option<String>,
    pub latency_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSource::Synthetic,
            width: 640,
            height: 480,
            fps: 10,
            format: PixelFormat::Bgr24,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 60,
            grab_timeout_ms: 1000,
            inference_workers: 1,
            max_fps: Some(10.0),
            relay_capacity: 256,
            pin_workers: false,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:58000".into(),
            keepalive_interval_secs: 30,
            send_timeout_ms: 5000,
        }
    }
}

impl PipelineConfig {
    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|e| Error::Initialization(format!("invalid bind_addr {:?}: {e}", self.bind_addr)))
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `HERMES__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Initialization(format!("invalid configuration: {msg}")));

        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity must be at least 1");
        }
        if self.pipeline.inference_workers == 0 {
            return invalid("pipeline.inference_workers must be at least 1");
        }
        if self.pipeline.relay_capacity == 0 {
            return invalid("pipeline.relay_capacity must be at least 1");
        }
        if let Some(fps) = self.pipeline.max_fps {
            if !(fps.is_finite() && fps > 0.0) {
                return invalid("pipeline.max_fps must be positive");
            }
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture dimensions must be non-zero");
        }
        if self.capture.fps == 0 {
            return invalid("capture.fps must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return invalid("detection.min_confidence must be within [0, 1]");
        }
        if self.server.keepalive_interval_secs == 0 {
            return invalid("server.keepalive_interval_secs must be at least 1");
        }
        if self.server.send_timeout_ms == 0 {
            return invalid("server.send_timeout_ms must be at least 1");
        }
        self.server.socket_addr()?;
        Ok(())
    }
}
