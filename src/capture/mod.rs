pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod synthetic;

pub use frame::{Frame, FrameDescriptor, FrameMetadata, PixelFormat, VideoFrame};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstCapture;
pub use synthetic::{CaptureStats, SyntheticCapture};
