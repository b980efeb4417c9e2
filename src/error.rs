//! Error taxonomy for the relay pipeline

use thiserror::Error;

use crate::detect::NormalizeError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Fatal: the pipeline cannot start
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid frame {width}x{height}: expected {expected} bytes, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// Queue full; the incoming frame was discarded
    #[error("frame dropped: queue full")]
    FrameDropped,

    #[error("scheduling unavailable: {0}")]
    SchedulingUnavailable(&'static str),

    #[error("transmit failed: {0}")]
    Transmit(String),

    #[error(transparent)]
    Normalization(#[from] NormalizeError),

    /// The capture collaborator handed over something unusable
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("detector failed: {0}")]
    Detector(String),
}
