//! Network and file stream capture (RTSP, HTTP, local video files) decoded by
//! FFmpeg through `ez-ffmpeg`.
//!
//! A decoder thread runs the FFmpeg pipeline and pushes RGB frames into a
//! small drop-oldest queue; [`FfmpegCapture`] pulls the newest one on grab.

use crate::camera::{CameraError, Capture, CaptureOpener};
use crate::frame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame as AvFrame};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIRST_FRAME_POLL: Duration = Duration::from_millis(100);

/// Bounded hand-off between the decoder thread and the capture loop.
#[derive(Clone)]
struct FrameQueue {
    tx: Sender<RgbImage>,
    rx: Receiver<RgbImage>,
}

impl FrameQueue {
    fn new(depth: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
        Self { tx, rx }
    }

    /// Queue a frame, evicting the oldest ones while full. Returns how many
    /// were evicted.
    fn push(&self, mut image: RgbImage) -> usize {
        let mut evicted = 0;
        loop {
            match self.tx.try_send(image) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    image = back;
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// The newest queued frame, discarding older ones.
    fn newest(&self) -> Option<RgbImage> {
        self.rx.try_iter().last()
    }
}

#[derive(Default)]
struct StreamFlags {
    /// Set by the capture side; the decoder stops at its next frame.
    closed: AtomicBool,
    /// Set by the decoder thread once the pipeline has finished.
    ended: AtomicBool,
}

impl StreamFlags {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Frame pipeline stage that copies each decoded RGB24 frame into the queue.
#[derive(Clone)]
struct DecodeFilter {
    queue: FrameQueue,
    flags: Arc<StreamFlags>,
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!("stream decoder started");
        Ok(())
    }

    fn filter_frame(&mut self, frame: AvFrame, _ctx: &FrameFilterContext) -> Result<Option<AvFrame>, String> {
        if self.flags.is_closed() {
            return Err("capture closed".to_string());
        }
        match copy_rgb24(&frame) {
            Ok(image) => {
                let evicted = self.queue.push(image);
                if evicted > 0 {
                    tracing::trace!(evicted, "stream frames dropped, reader behind");
                }
            }
            Err(e) => tracing::debug!(error = %e, "skipping undecodable stream frame"),
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::debug!("stream decoder finished");
    }
}

/// Copy the packed RGB24 plane out of a decoded frame.
fn copy_rgb24(decoded: &AvFrame) -> Result<RgbImage, CameraError> {
    // SAFETY: the pipeline is configured with `format=rgb24`, so plane 0 holds
    // `height` rows of `linesize[0]` bytes each, valid while `decoded` is borrowed.
    unsafe {
        let raw = decoded.as_ptr();
        if raw.is_null() {
            return Err(CameraError::NoFrame);
        }
        let (width, height, stride, data) = ((*raw).width, (*raw).height, (*raw).linesize[0], (*raw).data[0]);
        if width <= 0 || height <= 0 || stride <= 0 || data.is_null() {
            return Err(CameraError::NoFrame);
        }
        let (width, height, stride) = (width as u32, height as u32, stride as usize);
        let row = width as usize * 3;
        if stride < row {
            return Err(CameraError::CaptureFailed(format!("stream frame is not rgb24 (stride {stride})")));
        }
        let plane = std::slice::from_raw_parts(data as *const u8, stride * (height as usize - 1) + row);
        Ok(frame::rgb24_strided_to_image(plane, stride, width, height)?)
    }
}

/// A running FFmpeg decode of one network or file source.
pub struct FfmpegCapture {
    queue: FrameQueue,
    flags: Arc<StreamFlags>,
    grab_timeout: Duration,
    pending: Option<RgbImage>,
    current: Option<RgbImage>,
}

impl FfmpegCapture {
    fn new(queue: FrameQueue, flags: Arc<StreamFlags>, grab_timeout: Duration, first: Option<RgbImage>) -> Self {
        Self { queue, flags, grab_timeout, pending: first, current: None }
    }
}

impl Capture for FfmpegCapture {
    fn grab(&mut self) -> Result<(), CameraError> {
        if let Some(image) = self.queue.newest().or_else(|| self.pending.take()) {
            self.pending = None;
            self.current = Some(image);
            return Ok(());
        }
        if self.flags.is_ended() {
            return Err(CameraError::CaptureFailed("stream ended".to_string()));
        }
        match self.queue.rx.recv_timeout(self.grab_timeout) {
            Ok(image) => {
                self.current = Some(image);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(CameraError::NoFrame),
            Err(RecvTimeoutError::Disconnected) => Err(CameraError::CaptureFailed("stream ended".to_string())),
        }
    }

    fn retrieve(&mut self) -> Result<RgbImage, CameraError> {
        self.current.take().ok_or(CameraError::NoFrame)
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.flags.close();
    }
}

/// Opens RTSP/HTTP URLs and video files with FFmpeg.
///
/// `open` returns once the first frame has been decoded, so an unreachable
/// stream fails the open and goes through the reconnect backoff like a
/// missing device.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    /// Upper bound on connecting and decoding the first frame.
    pub connect_timeout: Duration,
    /// How long one `grab` waits for a new frame.
    pub grab_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            grab_timeout: Duration::from_millis(200),
            queue_depth: 2,
        }
    }
}

impl CaptureOpener for FfmpegOpener {
    fn open(&self, source: &str) -> Result<Box<dyn Capture>, CameraError> {
        let url = source.trim().to_string();
        let queue = FrameQueue::new(self.queue_depth);
        let flags = Arc::new(StreamFlags::default());
        let filter = DecodeFilter { queue: queue.clone(), flags: Arc::clone(&flags) };
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);

        let thread_flags = Arc::clone(&flags);
        let thread_url = url.clone();
        std::thread::Builder::new()
            .name("facewatch-ffmpeg".to_string())
            .spawn(move || {
                run_decoder(&thread_url, filter, &started_tx);
                thread_flags.ended.store(true, Ordering::Release);
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn decoder thread: {e}")))?;

        let deadline = Instant::now() + self.connect_timeout;
        match started_rx.recv_timeout(self.connect_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(CameraError::DeviceNotFound(format!("{url}: {e}"))),
            Err(_) => {
                flags.close();
                return Err(CameraError::CaptureFailed(format!("{url}: connect timed out")));
            }
        }

        let first = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                flags.close();
                return Err(CameraError::CaptureFailed(format!("{url}: no frame decoded in time")));
            }
            match queue.rx.recv_timeout(remaining.min(FIRST_FRAME_POLL)) {
                Ok(image) => break image,
                Err(_) if flags.is_ended() => {
                    return Err(CameraError::CaptureFailed(format!("{url}: stream ended before the first frame")));
                }
                Err(_) => continue,
            }
        };

        tracing::info!(source = %url, width = first.width(), height = first.height(), "network stream opened");
        Ok(Box::new(FfmpegCapture::new(queue, flags, self.grab_timeout, Some(first))))
    }
}

/// Build and run the FFmpeg pipeline until the stream ends or the capture
/// is closed. The build/start outcome is reported once on `started`.
fn run_decoder(url: &str, filter: DecodeFilter, started: &Sender<Result<(), String>>) {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let output = create_null_output().add_frame_pipeline(pipe);

    let ctx = match FfmpegContext::builder().input(url).filter_desc("format=rgb24").output(output).build() {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = started.send(Err(format!("build failed: {e}")));
            return;
        }
    };
    let scheduler = match ctx.start() {
        Ok(s) => s,
        Err(e) => {
            let _ = started.send(Err(format!("start failed: {e}")));
            return;
        }
    };
    let _ = started.send(Ok(()));
    let _ = scheduler.wait();
    tracing::debug!(source = %url, "decoder pipeline exited");
}
