//! Frame path from the capture thread to the inference workers

pub mod fps;
pub mod inference;
pub mod queue;
pub mod source;

pub use fps::FpsCounter;
pub use inference::{InferencePipeline, WorkerStats};
pub use queue::{BoundedFrameQueue, QueueStats};
pub use source::{FrameSourceAdapter, SourceProperties, VideoSource};
