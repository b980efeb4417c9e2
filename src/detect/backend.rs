use crate::capture::VideoFrame;
use crate::detect::RawPredictions;
use crate::error::Result;

/// An object detector driven synchronously from an inference worker thread.
///
/// Each worker owns its own instance, so implementations need not be `Sync`.
pub trait Detector: Send {
    fn name(&self) -> &str;

    fn infer(&mut self, frame: &VideoFrame) -> Result<RawPredictions>;
}

/// Reports no detections. Lets the relay run end to end without a model.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    fn infer(&mut self, frame: &VideoFrame) -> Result<RawPredictions> {
        Ok(RawPredictions::default().with_image(frame.frame.width(), frame.frame.height()))
    }
}

impl<F> Detector for F
where
    F: FnMut(&VideoFrame) -> Result<RawPredictions> + Send,
{
    fn name(&self) -> &str {
        "closure"
    }

    fn infer(&mut self, frame: &VideoFrame) -> Result<RawPredictions> {
        self(frame)
    }
}
