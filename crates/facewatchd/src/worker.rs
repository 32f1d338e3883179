//! CameraWorker: capture → detect → track → draw → encode for one camera.

use crate::annotate::Annotator;
use crate::config::CameraSpec;
use crate::encoder::{multipart_chunk, StreamEncoder};
use crate::scheduler::InferenceScheduler;
use facewatch_core::ShortTermTracker;
use facewatch_hw::{CaptureOpener, Frame, FrameSource, SourceError, SourceStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll interval while waiting for a frame newer than the last one drawn.
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Jpeg = Arc<Vec<u8>>;

/// Last encoded JPEG of a camera. One writer, any number of readers;
/// readers always see the newest value and may miss intermediate ones.
#[derive(Clone)]
pub struct StreamFrameBuffer {
    tx: Arc<watch::Sender<Option<Jpeg>>>,
}

impl Default for StreamFrameBuffer {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl StreamFrameBuffer {
    pub fn publish(&self, jpeg: Vec<u8>) {
        self.tx.send_replace(Some(Arc::new(jpeg)));
    }

    pub fn latest(&self) -> Option<Jpeg> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> MjpegStream {
        MjpegStream { rx: self.tx.subscribe(), first: true }
    }
}

/// Pull-based MJPEG part stream for one camera.
pub struct MjpegStream {
    rx: watch::Receiver<Option<Jpeg>>,
    first: bool,
}

impl MjpegStream {
    /// Wait for the next JPEG and frame it as one multipart part. The first
    /// call returns the current frame immediately if there is one. `None`
    /// once the worker is gone.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            if std::mem::take(&mut self.first) {
                if let Some(jpeg) = self.rx.borrow_and_update().clone() {
                    return Some(multipart_chunk(&jpeg));
                }
            }
            self.rx.changed().await.ok()?;
            if let Some(jpeg) = self.rx.borrow_and_update().clone() {
                return Some(multipart_chunk(&jpeg));
            }
        }
    }
}

/// Everything a worker thread owns besides its frame source.
pub struct WorkerParts {
    pub scheduler: InferenceScheduler,
    pub tracker: ShortTermTracker,
    pub encoder: StreamEncoder,
    pub annotator: Arc<Annotator>,
}

pub struct CameraWorker {
    spec: CameraSpec,
    source: Arc<FrameSource>,
    buffer: StreamFrameBuffer,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<(JoinHandle<()>, mpsc::Receiver<()>)>>,
}

impl CameraWorker {
    /// Open the frame source and start the processing thread.
    pub fn start(spec: CameraSpec, opener: Arc<dyn CaptureOpener>, parts: WorkerParts) -> Result<Self, WorkerError> {
        let source = Arc::new(FrameSource::open(spec.source_config(), opener)?);
        let buffer = StreamFrameBuffer::default();
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let ctx = LoopContext {
            spec: spec.clone(),
            source: Arc::clone(&source),
            buffer: buffer.clone(),
            stop: Arc::clone(&stop),
        };
        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", spec.name))
            .spawn(move || {
                run_loop(ctx, parts);
                let _ = done_tx.send(());
            });
        let thread = match thread {
            Ok(t) => t,
            Err(e) => {
                source.stop();
                return Err(e.into());
            }
        };
        tracing::info!(camera = %spec.name, index = spec.index, source = %spec.source, "camera worker started");

        Ok(Self { spec, source, buffer, stop, thread: Mutex::new(Some((thread, done_rx))) })
    }

    pub fn spec(&self) -> &CameraSpec {
        &self.spec
    }

    /// Latest raw frame.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        self.source.get_frame()
    }

    /// Latest annotated JPEG.
    pub fn get_jpeg(&self) -> Option<Jpeg> {
        self.buffer.latest()
    }

    pub fn mjpeg_stream(&self) -> MjpegStream {
        self.buffer.subscribe()
    }

    /// `(latency_ms, drop_pct)` of the frame source.
    pub fn metrics(&self) -> (f64, f64) {
        self.source.get_metrics()
    }

    pub fn status(&self) -> SourceStatus {
        self.source.status()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// Stop the loop, wait a bounded time for it, then release the device.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some((thread, done)) = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take() {
            match done.recv_timeout(STOP_JOIN_TIMEOUT) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = thread.join();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tracing::warn!(camera = %self.spec.name, "worker did not stop in time, detaching");
                }
            }
        }
        self.source.stop();
        tracing::info!(camera = %self.spec.name, "camera worker stopped");
    }
}

impl Drop for CameraWorker {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

struct LoopContext {
    spec: CameraSpec,
    source: Arc<FrameSource>,
    buffer: StreamFrameBuffer,
    stop: Arc<AtomicBool>,
}

fn run_loop(ctx: LoopContext, mut parts: WorkerParts) {
    let detect_every = u64::from(ctx.spec.detect_interval_frames.max(1));
    let display_interval = ctx.spec.display_interval();
    let mut last_seq = 0u64;
    let mut frame_count = 0u64;

    while !ctx.stop.load(Ordering::Relaxed) {
        let Some(frame) = ctx.source.get_frame().filter(|f| f.sequence != last_seq) else {
            std::thread::sleep(IDLE_POLL);
            continue;
        };
        last_seq = frame.sequence;
        frame_count += 1;

        if frame_count % detect_every == 0 {
            parts.scheduler.submit(Arc::clone(&frame));
        }
        if let Some(jpeg) = render(&frame, &mut parts, &ctx.spec) {
            ctx.buffer.publish(jpeg);
        }
        std::thread::sleep(display_interval);
    }
    tracing::debug!(camera = %ctx.spec.name, frames = frame_count, "worker loop exiting");
}

/// Track, draw and encode one frame. `None` when encoding failed; the
/// previous JPEG stays published.
fn render(frame: &Frame, parts: &mut WorkerParts, spec: &CameraSpec) -> Option<Vec<u8>> {
    let now = Instant::now();
    let gray = frame.to_gray();
    let (observations, version) = parts.scheduler.annotations().snapshot();
    if version != parts.tracker.version() {
        parts.tracker.resync(observations.to_vec(), &gray, version, now);
    } else {
        parts.tracker.advance(&gray, now);
    }

    let mut canvas = frame.image.clone();
    parts.annotator.draw(&mut canvas, &parts.tracker.observations());
    match parts.encoder.encode(&canvas) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            tracing::warn!(camera = %spec.name, error = %e, "frame encode failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodeParams;
    use crate::identity::KnownFaces;
    use crate::match_log::{MatchLog, TracingSink};
    use crate::scheduler::tests::FakeFactory;
    use crate::scheduler::InferencePool;
    use facewatch_core::ExposureParams;
    use facewatch_hw::{CameraError, Capture};
    use image::RgbImage;

    struct StaticCapture;

    impl Capture for StaticCapture {
        fn grab(&mut self) -> Result<(), CameraError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        }

        fn retrieve(&mut self) -> Result<RgbImage, CameraError> {
            Ok(RgbImage::from_pixel(160, 120, image::Rgb([90, 90, 90])))
        }
    }

    struct StaticOpener;

    impl CaptureOpener for StaticOpener {
        fn open(&self, _source: &str) -> Result<Box<dyn Capture>, CameraError> {
            Ok(Box::new(StaticCapture))
        }
    }

    fn make_parts(name: &str) -> WorkerParts {
        let pool = Arc::new(InferencePool::spawn(1, &FakeFactory { gate: None, fail: false }).unwrap());
        let log = Arc::new(MatchLog::new(name, Arc::new(TracingSink), Duration::ZERO));
        WorkerParts {
            scheduler: InferenceScheduler::new(name, pool, Arc::new(KnownFaces::default()), ExposureParams::default(), log),
            tracker: ShortTermTracker::default(),
            encoder: StreamEncoder::new(EncodeParams::default()),
            annotator: Arc::new(Annotator::new(0.4, 6, None)),
        }
    }

    fn make_spec() -> CameraSpec {
        CameraSpec { display_interval_ms: 5, detect_interval_frames: 1, ..CameraSpec::new("lobby", "0") }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_worker_publishes_jpeg_and_stops() {
        let worker = CameraWorker::start(make_spec(), Arc::new(StaticOpener), make_parts("lobby")).unwrap();
        assert!(wait_for(|| worker.get_jpeg().is_some()));
        let jpeg = worker.get_jpeg().unwrap();
        assert!(jpeg.starts_with(&[0xff, 0xd8]));
        assert!(worker.get_frame().is_some());
        assert_eq!(worker.status(), SourceStatus::Running);

        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(worker.status(), SourceStatus::Stopped);
        assert!(worker.get_frame().is_none());
    }

    #[tokio::test]
    async fn test_mjpeg_stream_yields_parts() {
        let buffer = StreamFrameBuffer::default();
        let mut stream = buffer.subscribe();
        buffer.publish(vec![0xff, 0xd8, 0xff, 0xd9]);
        let chunk = stream.next_chunk().await.unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));

        buffer.publish(vec![1, 2, 3]);
        let chunk = stream.next_chunk().await.unwrap();
        assert!(chunk.ends_with(&[1, 2, 3, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_mjpeg_stream_ends_with_buffer() {
        let buffer = StreamFrameBuffer::default();
        let mut stream = buffer.subscribe();
        drop(buffer);
        assert!(stream.next_chunk().await.is_none());
    }
}
