//! Shared inference pool and the per-camera single-flight scheduler on top of it.

use crate::identity::KnownFaces;
use crate::match_log::MatchLog;
use crate::models::{EngineFactory, ModelError};
use crossbeam_channel::{Sender, TrySendError};
use facewatch_core::{CameraDetectState, DetectionEngine, ExposureParams, FaceObservation};
use facewatch_hw::Frame;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;

/// Queued jobs allowed per pool thread before submissions are refused.
const QUEUE_PER_THREAD: usize = 4;

type Job = Box<dyn FnOnce(&mut DetectionEngine) + Send>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to build engine: {0}")]
    Model(#[from] ModelError),
    #[error("failed to spawn inference thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("inference queue is full")]
    QueueFull,
    #[error("inference pool is shut down")]
    Closed,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Fixed set of threads, each owning its own DetectionEngine.
pub struct InferencePool {
    tx: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl InferencePool {
    /// Build `size` engines up front (failing on the first model error),
    /// then start one thread per engine.
    pub fn spawn(size: usize, factory: &dyn EngineFactory) -> Result<Self, PoolError> {
        let size = size.max(1);
        let engines = (0..size).map(|_| factory.build()).collect::<Result<Vec<_>, _>>()?;

        let (tx, rx) = crossbeam_channel::bounded::<Job>(size * QUEUE_PER_THREAD);
        let mut threads = Vec::with_capacity(size);
        for (i, mut engine) in engines.into_iter().enumerate() {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("facewatch-infer-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job(&mut engine);
                    }
                    tracing::debug!(thread = i, "inference thread exiting");
                })?;
            threads.push(handle);
        }
        tracing::info!(size, "inference pool started");

        Ok(Self { tx: Mutex::new(Some(tx)), threads: Mutex::new(threads), size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job without blocking. A refused job is dropped.
    pub fn try_execute(&self, job: Job) -> Result<(), PoolError> {
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or(PoolError::Closed)?;
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => PoolError::QueueFull,
            TrySendError::Disconnected(_) => PoolError::Closed,
        })
    }

    /// Stop accepting jobs, let queued ones finish and join the threads.
    pub fn shutdown(&self) {
        lock(&self.tx).take();
        for handle in lock(&self.threads).drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Latest detection batch of a camera and a counter bumped on every replace.
#[derive(Default)]
pub struct AnnotationState {
    inner: Mutex<(Arc<Vec<FaceObservation>>, u64)>,
}

impl AnnotationState {
    pub fn replace(&self, observations: Vec<FaceObservation>) -> u64 {
        let mut inner = lock(&self.inner);
        inner.0 = Arc::new(observations);
        inner.1 += 1;
        inner.1
    }

    pub fn snapshot(&self) -> (Arc<Vec<FaceObservation>>, u64) {
        let inner = lock(&self.inner);
        (Arc::clone(&inner.0), inner.1)
    }
}

/// Clears the busy flag however the job ends, including when it is refused
/// by the pool and dropped unrun.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-camera front of the pool: at most one outstanding job.
pub struct InferenceScheduler {
    camera: String,
    pool: Arc<InferencePool>,
    known: Arc<KnownFaces>,
    exposure: ExposureParams,
    match_log: Arc<MatchLog>,
    busy: Arc<AtomicBool>,
    detect_state: Arc<Mutex<Option<CameraDetectState>>>,
    annotations: Arc<AnnotationState>,
}

impl InferenceScheduler {
    pub fn new(
        camera: impl Into<String>,
        pool: Arc<InferencePool>,
        known: Arc<KnownFaces>,
        exposure: ExposureParams,
        match_log: Arc<MatchLog>,
    ) -> Self {
        Self {
            camera: camera.into(),
            pool,
            known,
            exposure,
            match_log,
            busy: Arc::new(AtomicBool::new(false)),
            detect_state: Arc::new(Mutex::new(Some(CameraDetectState::new()))),
            annotations: Arc::new(AnnotationState::default()),
        }
    }

    pub fn annotations(&self) -> &Arc<AnnotationState> {
        &self.annotations
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Offer a frame for detection. Returns false when a job for this camera
    /// is still outstanding or the pool refuses it.
    pub fn submit(&self, frame: Arc<Frame>) -> bool {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        let camera = self.camera.clone();
        let known = Arc::clone(&self.known);
        let exposure = self.exposure;
        let match_log = Arc::clone(&self.match_log);
        let detect_state = Arc::clone(&self.detect_state);
        let annotations = Arc::clone(&self.annotations);

        let job: Job = Box::new(move |engine: &mut DetectionEngine| {
            let _guard = guard;
            let index = known.snapshot();
            let mut state = lock(&detect_state).take().unwrap_or_default();
            let started = Instant::now();

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                engine.analyze(&frame.image, &index, &exposure, &mut state)
            }));
            let observations = match outcome {
                Ok(Ok(observations)) => observations,
                Ok(Err(e)) => {
                    tracing::error!(camera = %camera, error = %e, "detection failed");
                    Vec::new()
                }
                Err(_) => {
                    tracing::error!(camera = %camera, "detection panicked");
                    state = CameraDetectState::new();
                    Vec::new()
                }
            };
            *lock(&detect_state) = Some(state);

            tracing::debug!(
                camera = %camera,
                seq = frame.sequence,
                faces = observations.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "detection complete"
            );
            match_log.report(&observations, Instant::now());
            annotations.replace(observations);
        });

        match self.pool.try_execute(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(camera = %self.camera, error = %e, "detection job refused");
                false
            }
        }
    }
}
