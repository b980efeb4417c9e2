use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel buffer - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Producer-assigned capture time, nanoseconds since the Unix epoch
    pub capture_timestamp_ns: u64,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub width: u32,
    pub height: u32,
    pub stride: u32, // Bytes per row
    pub format: PixelFormat,
}

/// Pixel formats we accept at ingress. Both are interleaved 8-bit, 3 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub const fn channels(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }

    /// Caps format string as GStreamer names it
    pub const fn caps_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgr24 => "BGR",
        }
    }
}

impl Frame {
    /// Wrap a raw interleaved buffer, rejecting buffers whose size does not
    /// match the declared geometry.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        capture_timestamp_ns: u64,
    ) -> Result<Self> {
        let data = data.into();
        let stride = width.saturating_mul(format.channels());
        let expected = stride as usize * height as usize;

        if width == 0 || height == 0 || data.len() != expected {
            return Err(Error::InvalidFrame {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                width,
                height,
                stride,
                format,
            }),
            capture_timestamp_ns,
        })
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    /// Capture time truncated to milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        self.capture_timestamp_ns / 1_000_000
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .field("capture_timestamp_ns", &self.capture_timestamp_ns)
            .finish()
    }
}

/// A frame after it has left the queue. `frame_id` is assigned at dequeue
/// time, starts at 1 and increases monotonically per source.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub frame_id: u64,
    pub frame: Frame,
}

impl VideoFrame {
    pub fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            frame_id: self.frame_id,
            capture_timestamp_ns: self.frame.capture_timestamp_ns,
            width: self.frame.width(),
            height: self.frame.height(),
        }
    }
}

/// Pixel-free description of a frame, passed alongside raw predictions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub frame_id: u64,
    pub capture_timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
}

impl FrameDescriptor {
    pub fn timestamp_ms(&self) -> u64 {
        self.capture_timestamp_ns / 1_000_000
    }
}
