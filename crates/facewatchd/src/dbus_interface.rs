use crate::registry::{CameraRegistry, RegistryError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facewatch.Daemon1";
pub const OBJECT_PATH: &str = "/org/facewatch/Daemon1";

/// D-Bus control interface of the facewatch daemon.
///
/// Bus name: org.facewatch.Daemon1
/// Object path: /org/facewatch/Daemon1
pub struct FacewatchService {
    registry: Arc<CameraRegistry>,
    started_at: DateTime<Utc>,
}

impl FacewatchService {
    pub fn new(registry: Arc<CameraRegistry>) -> Self {
        Self { registry, started_at: Utc::now() }
    }

    /// Run registry work off the async executor; starts and stops join threads.
    async fn blocking<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CameraRegistry) -> Result<T, RegistryError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("task failed: {e}")))?
            .map_err(to_fdo)
    }
}

fn to_fdo(e: RegistryError) -> zbus::fdo::Error {
    match e {
        RegistryError::IndexOutOfRange { .. } | RegistryError::CameraDisabled { .. } => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        RegistryError::NotRunning { .. } | RegistryError::Worker(_) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

#[interface(name = "org.facewatch.Daemon1")]
impl FacewatchService {
    /// Start the camera at `index` if it is not already running.
    async fn start(&self, index: u32) -> zbus::fdo::Result<()> {
        tracing::info!(index, "start requested");
        self.blocking(move |r| r.start(index as usize)).await
    }

    /// Stop the camera at `index`. Returns false if it was not running.
    async fn stop(&self, index: u32) -> zbus::fdo::Result<bool> {
        tracing::info!(index, "stop requested");
        self.blocking(move |r| r.stop(index as usize)).await
    }

    /// Daemon status and the camera list as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let ctx = self.registry.context();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at.to_rfc3339(),
            "cameras": self.registry.list(),
            "known_faces": ctx.known.snapshot().len(),
            "inference_threads": ctx.pool.size(),
        })
        .to_string())
    }

    /// `(latency_ms, drop_pct)` of the camera at `index`.
    async fn metrics(&self, index: u32) -> zbus::fdo::Result<(f64, f64)> {
        self.blocking(move |r| r.metrics(index as usize)).await
    }

    /// Latest annotated JPEG of the camera at `index`.
    async fn snapshot(&self, index: u32) -> zbus::fdo::Result<Vec<u8>> {
        let jpeg = self.blocking(move |r| r.get_jpeg(index as usize)).await?;
        jpeg.map(|j| j.to_vec())
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("camera {index} has no frame yet")))
    }

    /// Reload the identity store. Returns the number of known faces.
    async fn reload_known_faces(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload requested");
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.context().reload_known_faces())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("task failed: {e}")))?
            .map(|n| n as u32)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
