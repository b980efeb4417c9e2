//! GStreamer appsink capture feeding the frame ingress

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::app::FrameIngress;
use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};
use crate::utils::epoch_nanos;
use crate::{CaptureConfig, GStreamerConfig};

/// Decoded-frame capture. Samples are pushed from GStreamer's streaming
/// thread straight into the ingress; a full queue drops the sample.
pub struct GstCapture {
    pipeline: gst::Pipeline,
    pushed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl GstCapture {
    pub fn new(
        ingress: FrameIngress,
        capture: &CaptureConfig,
        config: &GStreamerConfig,
    ) -> Result<Self> {
        gst::init().map_err(|e| init_error("failed to initialize GStreamer", e))?;

        let pipeline_str = Self::build_pipeline_string(capture, config, ingress.format());
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| init_error("failed to parse pipeline", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::Initialization("launch line is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| Error::Initialization("pipeline has no element named appsink".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::Initialization("appsink element is not an AppSink".into()))?;

        // Lowest latency: never block the streaming thread on our side
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let pushed = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let callbacks = {
            let pushed = pushed.clone();
            let dropped = dropped.clone();
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    match push_sample(&ingress, &sample) {
                        Ok(()) => {
                            pushed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(Error::FrameDropped) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => warn!("Discarding sample: {}", e),
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build()
        };
        appsink.set_callbacks(callbacks);

        Ok(Self {
            pipeline,
            pushed,
            dropped,
        })
    }

    fn build_pipeline_string(
        capture: &CaptureConfig,
        config: &GStreamerConfig,
        format: PixelFormat,
    ) -> String {
        if let Some(custom) = &config.custom_pipeline {
            return custom.clone();
        }

        let (width, height, fps) = (capture.width, capture.height, capture.fps);
        let caps = format.caps_name();

        match &config.location {
            Some(location) => format!(
                "rtspsrc location={} latency={} ! \
                 decodebin ! \
                 videoconvert ! videoscale ! \
                 video/x-raw,format={},width={},height={} ! \
                 appsink name=appsink",
                location, config.latency_ms, caps, width, height
            ),
            None => format!(
                "videotestsrc is-live=true ! \
                 video/x-raw,width={},height={},framerate={}/1 ! \
                 videoconvert ! \
                 video/x-raw,format={} ! \
                 appsink name=appsink",
                width, height, fps, caps
            ),
        }
    }

    pub fn start_stream(&mut self) -> Result<()> {
        info!("Starting GStreamer pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| init_error("failed to start pipeline", e))?;
        Ok(())
    }

    pub fn stop_stream(&mut self) -> Result<()> {
        info!(
            "Stopping GStreamer pipeline: {} pushed, {} dropped",
            self.pushed.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed)
        );
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| init_error("failed to stop pipeline", e))?;
        Ok(())
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

fn push_sample(ingress: &FrameIngress, sample: &gst::Sample) -> Result<()> {
    let timestamp_ns = epoch_nanos();

    let buffer = sample
        .buffer()
        .ok_or_else(|| Error::Capture("sample contains no buffer".into()))?;
    let caps = sample
        .caps()
        .ok_or_else(|| Error::Capture("sample has no caps".into()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| Error::Capture(format!("unparseable video caps: {e}")))?;
    let map = buffer
        .map_readable()
        .map_err(|e| Error::Capture(format!("failed to map buffer: {e}")))?;

    let (width, height) = (info.width(), info.height());
    let row = width as usize * ingress.format().channels() as usize;
    let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;

    // Rows may be padded; the ingress expects them packed
    let pixels = if stride == row || stride == 0 {
        Bytes::copy_from_slice(map.as_slice())
    } else {
        debug!(stride, row, "Repacking padded rows");
        let mut packed = Vec::with_capacity(row * height as usize);
        for line in map.as_slice().chunks(stride).take(height as usize) {
            packed.extend_from_slice(&line[..row.min(line.len())]);
        }
        Bytes::from(packed)
    };

    ingress.push(pixels, width, height, timestamp_ns)
}

fn init_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Initialization(format!("{context}: {err}"))
}
