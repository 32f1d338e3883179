//! CameraRegistry: the set of running camera workers, keyed by config index.

use crate::annotate::Annotator;
use crate::config::{CameraSpec, Config};
use crate::encoder::StreamEncoder;
use crate::identity::{IdentityError, IdentityStore, KnownFaces};
use crate::match_log::{MatchLog, MatchSink};
use crate::scheduler::{InferencePool, InferenceScheduler};
use crate::worker::{CameraWorker, Jpeg, MjpegStream, WorkerError, WorkerParts};
use facewatch_core::ShortTermTracker;
use facewatch_hw::{CaptureOpener, Frame, SourceStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("camera index {index} out of range ({count} configured)")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("camera {index} ({name}) is disabled")]
    CameraDisabled { index: usize, name: String },
    #[error("camera {index} is not running")]
    NotRunning { index: usize },
    #[error("failed to start camera worker: {0}")]
    Worker(#[from] WorkerError),
}

/// Long-lived services shared by every camera worker.
pub struct ServiceContext {
    pub config: Config,
    pub pool: Arc<InferencePool>,
    pub known: Arc<KnownFaces>,
    pub identities: Box<dyn IdentityStore>,
    pub sink: Arc<dyn MatchSink>,
    pub opener: Arc<dyn CaptureOpener>,
    pub annotator: Arc<Annotator>,
}

impl ServiceContext {
    /// Reload the identity store and swap the live index. The old index
    /// stays in place on error. Returns the number of loaded faces.
    pub fn reload_known_faces(&self) -> Result<usize, IdentityError> {
        let index = self.identities.load()?;
        let count = index.len();
        self.known.replace(index);
        tracing::info!(faces = count, "known faces reloaded");
        Ok(count)
    }

    fn worker_parts(&self, spec: &CameraSpec) -> WorkerParts {
        let match_log = Arc::new(MatchLog::new(&spec.name, Arc::clone(&self.sink), self.config.match_interval()));
        WorkerParts {
            scheduler: InferenceScheduler::new(
                &spec.name,
                Arc::clone(&self.pool),
                Arc::clone(&self.known),
                spec.exposure,
                match_log,
            ),
            tracker: ShortTermTracker::default(),
            encoder: StreamEncoder::new(self.config.stream.encode.clone()),
            annotator: Arc::clone(&self.annotator),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraInfo {
    pub index: usize,
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub status: Option<SourceStatus>,
}

pub struct CameraRegistry {
    ctx: Arc<ServiceContext>,
    workers: Mutex<BTreeMap<usize, Arc<CameraWorker>>>,
}

impl CameraRegistry {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx, workers: Mutex::new(BTreeMap::new()) }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    fn workers(&self) -> MutexGuard<'_, BTreeMap<usize, Arc<CameraWorker>>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spec(&self, index: usize) -> Result<&CameraSpec, RegistryError> {
        let cameras = &self.ctx.config.cameras;
        cameras.get(index).ok_or(RegistryError::IndexOutOfRange { index, count: cameras.len() })
    }

    /// The running worker for `index`, starting it if needed.
    pub fn ensure(&self, index: usize) -> Result<Arc<CameraWorker>, RegistryError> {
        let mut workers = self.workers();
        if let Some(worker) = workers.get(&index) {
            return Ok(Arc::clone(worker));
        }
        let spec = self.spec(index)?;
        if !spec.enabled {
            return Err(RegistryError::CameraDisabled { index, name: spec.name.clone() });
        }
        let worker = Arc::new(CameraWorker::start(
            spec.clone(),
            Arc::clone(&self.ctx.opener),
            self.ctx.worker_parts(spec),
        )?);
        workers.insert(index, Arc::clone(&worker));
        Ok(worker)
    }

    /// The running worker for `index`. Never starts one.
    pub fn get(&self, index: usize) -> Result<Arc<CameraWorker>, RegistryError> {
        self.spec(index)?;
        self.workers().get(&index).cloned().ok_or(RegistryError::NotRunning { index })
    }

    /// Alias of `ensure` for the control surface.
    pub fn start(&self, index: usize) -> Result<(), RegistryError> {
        self.ensure(index).map(|_| ())
    }

    /// Stop and deregister a worker. Returns false if it was not running.
    pub fn stop(&self, index: usize) -> Result<bool, RegistryError> {
        self.spec(index)?;
        // Deregister first so the map lock is not held across the join.
        let worker = self.workers().remove(&index);
        match worker {
            Some(worker) => {
                worker.stop();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn stop_all(&self) {
        let workers = std::mem::take(&mut *self.workers());
        for worker in workers.values() {
            worker.stop();
        }
        tracing::info!(count = workers.len(), "all cameras stopped");
    }

    /// Start every enabled camera. Failures are logged and skipped.
    pub fn start_enabled(&self) -> usize {
        let mut started = 0;
        for spec in self.ctx.config.cameras.iter().filter(|c| c.enabled) {
            match self.ensure(spec.index) {
                Ok(_) => started += 1,
                Err(e) => tracing::warn!(camera = %spec.name, index = spec.index, error = %e, "camera not started"),
            }
        }
        started
    }

    pub fn list(&self) -> Vec<CameraInfo> {
        let workers = self.workers();
        self.ctx
            .config
            .cameras
            .iter()
            .map(|spec| {
                let worker = workers.get(&spec.index);
                CameraInfo {
                    index: spec.index,
                    name: spec.name.clone(),
                    enabled: spec.enabled,
                    running: worker.is_some(),
                    status: worker.map(|w| w.status()),
                }
            })
            .collect()
    }

    pub fn get_frame(&self, index: usize) -> Result<Option<Arc<Frame>>, RegistryError> {
        Ok(self.get(index)?.get_frame())
    }

    pub fn get_jpeg(&self, index: usize) -> Result<Option<Jpeg>, RegistryError> {
        Ok(self.get(index)?.get_jpeg())
    }

    pub fn mjpeg_stream(&self, index: usize) -> Result<MjpegStream, RegistryError> {
        Ok(self.get(index)?.mjpeg_stream())
    }

    /// `(latency_ms, drop_pct)`.
    pub fn metrics(&self, index: usize) -> Result<(f64, f64), RegistryError> {
        Ok(self.get(index)?.metrics())
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EmptyStore;
    use crate::match_log::TracingSink;
    use crate::scheduler::tests::FakeFactory;
    use facewatch_core::{Embedding, KnownFaceIndex};
    use facewatch_hw::{CameraError, Capture};
    use image::RgbImage;
    use std::time::{Duration, Instant};

    struct NoiseCapture;

    impl Capture for NoiseCapture {
        fn grab(&mut self) -> Result<(), CameraError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        }

        fn retrieve(&mut self) -> Result<RgbImage, CameraError> {
            Ok(RgbImage::from_pixel(120, 90, image::Rgb([60, 60, 60])))
        }
    }

    struct NoiseOpener;

    impl CaptureOpener for NoiseOpener {
        fn open(&self, _source: &str) -> Result<Box<dyn Capture>, CameraError> {
            Ok(Box::new(NoiseCapture))
        }
    }

    struct OneFaceStore;

    impl IdentityStore for OneFaceStore {
        fn load(&self) -> Result<KnownFaceIndex, IdentityError> {
            let mut index = KnownFaceIndex::default();
            index.push("alice", Embedding::new(vec![1.0, 0.0]));
            Ok(index)
        }
    }

    fn make_registry(identities: Box<dyn IdentityStore>) -> CameraRegistry {
        let mut config = Config::default();
        config.cameras = vec![
            CameraSpec { display_interval_ms: 5, ..CameraSpec::new("lobby", "0") },
            CameraSpec { enabled: false, ..CameraSpec::new("gate", "1") },
            CameraSpec { display_interval_ms: 5, ..CameraSpec::new("yard", "2") },
        ];
        for (i, cam) in config.cameras.iter_mut().enumerate() {
            cam.index = i;
        }
        let pool = Arc::new(InferencePool::spawn(1, &FakeFactory { gate: None, fail: false }).unwrap());
        CameraRegistry::new(Arc::new(ServiceContext {
            config,
            pool,
            known: Arc::new(KnownFaces::default()),
            identities,
            sink: Arc::new(TracingSink),
            opener: Arc::new(NoiseOpener),
            annotator: Arc::new(Annotator::new(0.4, 6, None)),
        }))
    }

    #[test]
    fn test_ensure_reuses_worker() {
        let registry = make_registry(Box::new(EmptyStore));
        let a = registry.ensure(0).unwrap();
        let b = registry.ensure(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.list()[0].running);
        registry.stop_all();
    }

    #[test]
    fn test_ensure_rejects_bad_index_and_disabled() {
        let registry = make_registry(Box::new(EmptyStore));
        assert!(matches!(registry.ensure(7), Err(RegistryError::IndexOutOfRange { index: 7, count: 3 })));
        assert!(matches!(registry.ensure(1), Err(RegistryError::CameraDisabled { index: 1, .. })));
        assert!(matches!(registry.stop(9), Err(RegistryError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_start_enabled_skips_disabled() {
        let registry = make_registry(Box::new(EmptyStore));
        assert_eq!(registry.start_enabled(), 2);
        let running: Vec<bool> = registry.list().iter().map(|c| c.running).collect();
        assert_eq!(running, [true, false, true]);

        assert!(registry.stop(0).unwrap());
        assert!(!registry.stop(0).unwrap());
        assert!(!registry.list()[0].running);
        registry.stop_all();
        assert!(registry.list().iter().all(|c| !c.running));
    }

    #[test]
    fn test_serving_surface_produces_jpeg() {
        let registry = make_registry(Box::new(EmptyStore));
        registry.start(2).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut jpeg = None;
        while jpeg.is_none() && Instant::now() < deadline {
            jpeg = registry.get_jpeg(2).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(jpeg.unwrap().starts_with(&[0xff, 0xd8]));
        let (latency, drop) = registry.metrics(2).unwrap();
        assert!(latency >= 0.0);
        assert!((0.0..=100.0).contains(&drop));
        registry.stop_all();
    }

    #[test]
    fn test_serving_calls_do_not_restart_stopped_camera() {
        let registry = make_registry(Box::new(EmptyStore));
        assert!(matches!(registry.get_jpeg(0), Err(RegistryError::NotRunning { index: 0 })));
        assert!(!registry.list()[0].running);

        registry.start(0).unwrap();
        assert!(registry.metrics(0).is_ok());
        assert!(registry.stop(0).unwrap());

        assert!(matches!(registry.metrics(0), Err(RegistryError::NotRunning { index: 0 })));
        assert!(matches!(registry.get_frame(0), Err(RegistryError::NotRunning { .. })));
        assert!(matches!(registry.get_jpeg(0), Err(RegistryError::NotRunning { .. })));
        assert!(registry.mjpeg_stream(0).is_err());
        assert!(!registry.list()[0].running);
        assert!(matches!(registry.metrics(5), Err(RegistryError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_reload_known_faces_swaps_index() {
        let registry = make_registry(Box::new(OneFaceStore));
        let ctx = registry.context();
        assert!(ctx.known.snapshot().is_empty());
        assert_eq!(ctx.reload_known_faces().unwrap(), 1);
        assert_eq!(ctx.known.snapshot().len(), 1);
    }
}
