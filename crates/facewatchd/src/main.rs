use anyhow::{Context, Result};
use facewatch_hw::{FfmpegOpener, SourceRouter, V4l2Opener};
use facewatchd::annotate::Annotator;
use facewatchd::config::Config;
use facewatchd::dbus_interface::{FacewatchService, BUS_NAME, OBJECT_PATH};
use facewatchd::identity::{store_for, KnownFaces};
use facewatchd::match_log::TracingSink;
use facewatchd::models::{EngineFactory, OnnxEngineFactory};
use facewatchd::registry::{CameraRegistry, ServiceContext};
use facewatchd::scheduler::InferencePool;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load().context("failed to load config")?;
    let factory: Arc<dyn EngineFactory> =
        Arc::new(OnnxEngineFactory::new(config.models.clone(), config.detection.clone()));

    let pool_size = config.pool_size();
    let pool = {
        let factory = Arc::clone(&factory);
        tokio::task::spawn_blocking(move || InferencePool::spawn(pool_size, factory.as_ref()))
            .await?
            .context("failed to start inference pool")?
    };

    let identities = store_for(config.identities.path.as_deref(), Arc::clone(&factory));
    let known = Arc::new(KnownFaces::default());

    let font = match &config.stream.label_font {
        Some(path) => match Annotator::load_font(path) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(error = %e, "labels disabled");
                None
            }
        },
        None => None,
    };
    let annotator = Annotator::new(
        config.detection.settings.caution_threshold,
        config.stream.box_thickness_max,
        font,
    )
    .with_show_skipped(config.stream.show_skipped);

    let opener = SourceRouter::new(Arc::new(V4l2Opener::default()), Arc::new(FfmpegOpener::default()));

    let ctx = Arc::new(ServiceContext {
        config,
        pool: Arc::new(pool),
        known,
        identities,
        sink: Arc::new(TracingSink),
        opener: Arc::new(opener),
        annotator: Arc::new(annotator),
    });
    reload(&ctx).await;

    let registry = Arc::new(CameraRegistry::new(Arc::clone(&ctx)));
    let started = {
        let registry = Arc::clone(&registry);
        tokio::task::spawn_blocking(move || registry.start_enabled()).await?
    };
    tracing::info!(cameras = started, "cameras started");

    let builder = match std::env::var("FACEWATCH_BUS").as_deref() {
        Ok("session") => zbus::connection::Builder::session()?,
        _ => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacewatchService::new(Arc::clone(&registry)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facewatchd ready");

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => reload(&ctx).await,
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    tracing::info!("facewatchd shutting down");
    tokio::task::spawn_blocking(move || registry.stop_all()).await?;
    ctx.pool.shutdown();

    Ok(())
}

/// Reload known faces, keeping the current index on failure.
async fn reload(ctx: &Arc<ServiceContext>) {
    let ctx = Arc::clone(ctx);
    match tokio::task::spawn_blocking(move || ctx.reload_known_faces()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "failed to load known faces"),
        Err(e) => tracing::error!(error = %e, "known-face reload task failed"),
    }
}
