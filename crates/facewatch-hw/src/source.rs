//! FrameSource — a background capture thread that keeps only the newest
//! frame of a camera, reconnecting forever when the device goes away.

use crate::camera::{Capture, CaptureOpener};
use crate::frame::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consecutive grab/retrieve misses tolerated before the session is dropped.
pub const MAX_CONSECUTIVE_READ_FAILURES: u32 = 50;

const READ_RETRY_SLEEP: Duration = Duration::from_millis(20);
const METRICS_WINDOW: Duration = Duration::from_secs(1);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What a FrameSource needs to know about its camera.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub source: String,
    pub reconnect_delay: Duration,
    /// Driver-side buffer depth; `depth - 1` stale frames are skipped per read.
    pub frame_buffer: usize,
    pub latency_half_life: Duration,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            reconnect_delay: Duration::from_secs(10),
            frame_buffer: 1,
            latency_half_life: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Running,
    Reconnecting,
    Stopped,
}

/// Latency and drop-rate bookkeeping for one source.
///
/// Latency is an EMA of frame inter-arrival time; the drop rate is computed
/// over fixed one-second windows of read attempts.
#[derive(Debug, Clone)]
pub struct SourceMetrics {
    tau_secs: f64,
    latency_ms: f64,
    last_arrival: Option<Instant>,
    window_start: Instant,
    attempts: u32,
    successes: u32,
    last_window_drop: Option<f64>,
}

impl SourceMetrics {
    pub fn new(half_life: Duration, now: Instant) -> Self {
        let tau_secs = half_life.as_secs_f64().max(1e-3) / std::f64::consts::LN_2;
        Self {
            tau_secs,
            latency_ms: 0.0,
            last_arrival: None,
            window_start: now,
            attempts: 0,
            successes: 0,
            last_window_drop: None,
        }
    }

    pub fn record(&mut self, now: Instant, success: bool) {
        self.roll(now);
        self.attempts += 1;
        if !success {
            return;
        }
        self.successes += 1;
        if let Some(prev) = self.last_arrival {
            let iat = now.saturating_duration_since(prev).as_secs_f64().max(1e-3);
            let alpha = 1.0 - (-iat / self.tau_secs).exp();
            self.latency_ms += alpha * (iat * 1000.0 - self.latency_ms);
        }
        self.last_arrival = Some(now);
    }

    /// Forget arrival history, e.g. after the device was reopened.
    pub fn reset_arrivals(&mut self) {
        self.last_arrival = None;
    }

    /// `(latency_ms, drop_pct)`.
    pub fn snapshot(&mut self, now: Instant) -> (f64, f64) {
        self.roll(now);
        let drop_pct = self
            .last_window_drop
            .unwrap_or_else(|| drop_pct(self.attempts, self.successes));
        (self.latency_ms, drop_pct)
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < METRICS_WINDOW {
            return;
        }
        // An idle window (no attempts at all) reports 100% drops.
        self.last_window_drop = Some(if elapsed >= METRICS_WINDOW * 2 && self.attempts == 0 {
            100.0
        } else {
            drop_pct(self.attempts, self.successes)
        });
        self.attempts = 0;
        self.successes = 0;
        self.window_start = now;
    }
}

fn drop_pct(attempts: u32, successes: u32) -> f64 {
    if attempts == 0 {
        return 100.0;
    }
    (attempts - successes.min(attempts)) as f64 / attempts as f64 * 100.0
}

struct Shared {
    latest: Mutex<Option<Arc<Frame>>>,
    metrics: Mutex<SourceMetrics>,
    status: Mutex<SourceStatus>,
    stop: AtomicBool,
}

impl Shared {
    fn set_latest(&self, frame: Option<Arc<Frame>>) {
        *lock(&self.latest) = frame;
    }

    fn set_status(&self, status: SourceStatus) {
        *lock(&self.status) = status;
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Sleep in short slices so a stop request is noticed promptly.
    /// Returns false if stopped while sleeping.
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
        false
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a running capture thread.
pub struct FrameSource {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<(JoinHandle<()>, mpsc::Receiver<()>)>>,
}

impl FrameSource {
    /// Spawn the capture thread. Opening happens on the thread, so this
    /// returns immediately even when the device is unavailable.
    pub fn open(config: SourceConfig, opener: Arc<dyn CaptureOpener>) -> Result<Self, SourceError> {
        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            metrics: Mutex::new(SourceMetrics::new(config.latency_half_life, Instant::now())),
            status: Mutex::new(SourceStatus::Reconnecting),
            stop: AtomicBool::new(false),
        });
        let (done_tx, done_rx) = mpsc::channel();
        let name = config.name.clone();
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("capture-{name}"))
            .spawn(move || {
                capture_loop(&thread_shared, &config, opener.as_ref());
                thread_shared.set_latest(None);
                thread_shared.set_status(SourceStatus::Stopped);
                let _ = done_tx.send(());
            })?;

        Ok(Self { name, shared, thread: Mutex::new(Some((thread, done_rx))) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest frame, if the device is currently delivering.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.shared.latest).clone()
    }

    /// `(latency_ms, drop_pct)` over the last metrics window.
    pub fn get_metrics(&self) -> (f64, f64) {
        lock(&self.shared.metrics).snapshot(Instant::now())
    }

    pub fn status(&self) -> SourceStatus {
        *lock(&self.shared.status)
    }

    /// Signal the capture thread and wait for it for a bounded time. A thread
    /// stuck in the driver is detached; it exits on its next stop check.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let Some((thread, done)) = lock(&self.thread).take() else {
            return;
        };
        match done.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(camera = %self.name, "capture thread did not stop in time, detaching");
            }
        }
        self.shared.set_latest(None);
        self.shared.set_status(SourceStatus::Stopped);
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(shared: &Shared, config: &SourceConfig, opener: &dyn CaptureOpener) {
    let mut sequence = 0u64;
    while !shared.stopped() {
        shared.set_status(SourceStatus::Reconnecting);
        let mut capture = match opener.open(&config.source) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    camera = %config.name,
                    source = %config.source,
                    error = %e,
                    delay_secs = config.reconnect_delay.as_secs_f32(),
                    "camera open failed, retrying"
                );
                if !shared.sleep(config.reconnect_delay) {
                    break;
                }
                continue;
            }
        };
        tracing::info!(camera = %config.name, source = %config.source, "camera streaming");
        shared.set_status(SourceStatus::Running);
        lock(&shared.metrics).reset_arrivals();

        let mut misses = 0u32;
        while !shared.stopped() {
            let result = read_newest(capture.as_mut(), config.frame_buffer);
            let now = Instant::now();
            lock(&shared.metrics).record(now, result.is_some());
            match result {
                Some(image) => {
                    misses = 0;
                    sequence += 1;
                    shared.set_latest(Some(Arc::new(Frame { image, sequence, captured: now })));
                }
                None => {
                    misses += 1;
                    if misses > MAX_CONSECUTIVE_READ_FAILURES {
                        tracing::warn!(camera = %config.name, misses, "camera stopped delivering frames, reconnecting");
                        break;
                    }
                    std::thread::sleep(READ_RETRY_SLEEP);
                }
            }
        }

        drop(capture);
        shared.set_latest(None);
        if shared.stopped() {
            break;
        }
        shared.set_status(SourceStatus::Reconnecting);
        if !shared.sleep(config.reconnect_delay) {
            break;
        }
    }
    tracing::info!(camera = %config.name, "capture thread exiting");
}

/// Skip `depth - 1` buffered frames, then grab and decode the newest.
fn read_newest(capture: &mut dyn Capture, depth: usize) -> Option<image::RgbImage> {
    for _ in 1..depth.max(1) {
        if capture.grab().is_err() {
            break;
        }
    }
    if let Err(e) = capture.grab() {
        tracing::trace!(error = %e, "grab failed");
        return None;
    }
    match capture.retrieve() {
        Ok(img) => Some(img),
        Err(e) => {
            tracing::trace!(error = %e, "retrieve failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraError;
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;

    struct FakeCapture {
        grabs: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    impl Capture for FakeCapture {
        fn grab(&mut self) -> Result<(), CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            let n = self.grabs.fetch_add(1, Ordering::SeqCst);
            match self.fail_after {
                Some(limit) if n >= limit => Err(CameraError::NoFrame),
                _ => Ok(()),
            }
        }

        fn retrieve(&mut self) -> Result<RgbImage, CameraError> {
            Ok(RgbImage::new(8, 6))
        }
    }

    /// Fails the first `failures` opens, then hands out fake captures.
    struct FlakyOpener {
        failures: usize,
        opens: AtomicUsize,
        grabs: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    impl FlakyOpener {
        fn new(failures: usize) -> Self {
            Self { failures, opens: AtomicUsize::new(0), grabs: Arc::new(AtomicUsize::new(0)), fail_after: None }
        }
    }

    impl CaptureOpener for FlakyOpener {
        fn open(&self, _source: &str) -> Result<Box<dyn Capture>, CameraError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(CameraError::DeviceNotFound("/dev/video9".into()));
            }
            Ok(Box::new(FakeCapture { grabs: Arc::clone(&self.grabs), fail_after: self.fail_after }))
        }
    }

    fn make_config(delay_ms: u64) -> SourceConfig {
        SourceConfig { reconnect_delay: Duration::from_millis(delay_ms), ..SourceConfig::new("test", "9") }
    }

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_reconnects_after_failed_opens() {
        let opener = Arc::new(FlakyOpener::new(3));
        let source = FrameSource::open(make_config(60), opener.clone()).unwrap();

        assert_eq!(source.status(), SourceStatus::Reconnecting);

        // No frame may be published while the opener is still failing.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let frame = source.get_frame();
            if opener.opens.load(Ordering::SeqCst) >= 4 {
                break;
            }
            assert!(frame.is_none(), "frame published before a successful open");
            assert!(Instant::now() < deadline, "opener never succeeded");
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(wait_for(Duration::from_secs(3), || source.get_frame().is_some()));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 4);
        assert_eq!(source.status(), SourceStatus::Running);

        let first = source.get_frame().unwrap().sequence;
        assert!(wait_for(Duration::from_secs(1), || source.get_frame().unwrap().sequence > first));

        // Once frames flow the drop rate recovers from the idle reconnect phase.
        let mut last_drop = 100.0;
        let healthy = wait_for(Duration::from_millis(1100), || {
            last_drop = source.get_metrics().1;
            last_drop < 5.0
        });
        assert!(healthy, "drop rate stayed at {last_drop}%");

        source.stop();
        assert_eq!(source.status(), SourceStatus::Stopped);
        assert!(source.get_frame().is_none());
    }

    #[test]
    fn test_repeated_misses_trigger_reopen() {
        let mut opener = FlakyOpener::new(0);
        opener.fail_after = Some(3);
        let opener = Arc::new(opener);
        let source = FrameSource::open(make_config(10), opener.clone()).unwrap();

        assert!(wait_for(Duration::from_secs(5), || opener.opens.load(Ordering::SeqCst) >= 2));
        source.stop();
    }

    #[test]
    fn test_stop_interrupts_reconnect_sleep() {
        let opener = Arc::new(FlakyOpener::new(usize::MAX));
        let source = FrameSource::open(make_config(60_000), opener).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        source.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(source.status(), SourceStatus::Stopped);
    }

    #[test]
    fn test_metrics_no_attempts_is_full_drop() {
        let t0 = Instant::now();
        let mut m = SourceMetrics::new(Duration::from_millis(800), t0);
        assert_eq!(m.snapshot(t0), (0.0, 100.0));
    }

    #[test]
    fn test_metrics_window_drop_rate() {
        let t0 = Instant::now();
        let mut m = SourceMetrics::new(Duration::from_millis(800), t0);
        for i in 0..10u64 {
            m.record(t0 + Duration::from_millis(i * 50), i % 5 != 0);
        }
        // Still inside the first window: live counters.
        let (_, pct) = m.snapshot(t0 + Duration::from_millis(600));
        assert!((pct - 20.0).abs() < 1e-9);

        // After the window rolls, the completed window is reported.
        let (_, pct) = m.snapshot(t0 + Duration::from_millis(1100));
        assert!((pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_latency_converges_to_interval() {
        let t0 = Instant::now();
        let mut m = SourceMetrics::new(Duration::from_millis(800), t0);
        for i in 0..200u64 {
            m.record(t0 + Duration::from_millis(i * 40), true);
        }
        let (latency, pct) = m.snapshot(t0 + Duration::from_millis(200 * 40));
        assert!((latency - 40.0).abs() < 1.0, "latency {latency}");
        assert!(pct.abs() < 1e-9);
    }
}
