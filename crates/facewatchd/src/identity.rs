//! Identity store: loads the known-face index from a JSON gallery or a
//! directory of reference images.

use crate::models::{EngineFactory, ModelError};
use facewatch_core::{Embedding, KnownFaceIndex};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid gallery {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid gallery: {0}")]
    Invalid(String),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<KnownFaceIndex, IdentityError>;
}

/// No identities; every face is reported as unknown.
pub struct EmptyStore;

impl IdentityStore for EmptyStore {
    fn load(&self) -> Result<KnownFaceIndex, IdentityError> {
        Ok(KnownFaceIndex::default())
    }
}

#[derive(Deserialize)]
struct GalleryEntry {
    name: String,
    embedding: Vec<f32>,
}

/// `[{"name": "alice", "embedding": [..]}, ..]`, order preserved.
pub struct JsonGallery {
    path: PathBuf,
}

impl JsonGallery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for JsonGallery {
    fn load(&self) -> Result<KnownFaceIndex, IdentityError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|source| IdentityError::Io { path: self.path.clone(), source })?;
        let entries: Vec<GalleryEntry> = serde_json::from_str(&text)
            .map_err(|source| IdentityError::Parse { path: self.path.clone(), source })?;

        let mut index = KnownFaceIndex::default();
        let mut dim = None;
        for entry in entries {
            if entry.name.trim().is_empty() {
                return Err(IdentityError::Invalid("entry with an empty name".to_string()));
            }
            if entry.embedding.is_empty() {
                return Err(IdentityError::Invalid(format!("{} has an empty embedding", entry.name)));
            }
            match dim {
                None => dim = Some(entry.embedding.len()),
                Some(d) if d != entry.embedding.len() => {
                    return Err(IdentityError::Invalid(format!(
                        "{} has {} dimensions, expected {d}",
                        entry.name,
                        entry.embedding.len()
                    )));
                }
                Some(_) => {}
            }
            index.push(entry.name, Embedding::new(entry.embedding));
        }
        Ok(index)
    }
}

/// Reference images under a root directory. A file's identity is its first
/// sub-directory below the root, or its file stem for top-level files.
/// Images that cannot be read or embedded are logged and left out.
pub struct ImageDirectory {
    root: PathBuf,
    factory: Arc<dyn EngineFactory>,
}

impl ImageDirectory {
    pub fn new(root: impl Into<PathBuf>, factory: Arc<dyn EngineFactory>) -> Self {
        Self { root: root.into(), factory }
    }
}

impl IdentityStore for ImageDirectory {
    fn load(&self) -> Result<KnownFaceIndex, IdentityError> {
        let files = list_images(&self.root)?;
        let mut engine = self.factory.build()?;
        let mut index = KnownFaceIndex::default();
        for path in files {
            let Some(name) = identity_name(&self.root, &path) else {
                continue;
            };
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                    continue;
                }
            };
            match engine.enroll(&image) {
                Ok(Some(embedding)) => index.push(name, embedding),
                Ok(None) => tracing::warn!(path = %path.display(), "no face found in reference image"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping reference image, embedding failed"),
            }
        }
        Ok(index)
    }
}

/// All image files below `root`, sorted so index order is stable.
pub fn list_images(root: &Path) -> Result<Vec<PathBuf>, IdentityError> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| IdentityError::Io { path: dir.clone(), source })?;
        for entry in entries {
            let entry = entry.map_err(|source| IdentityError::Io { path: dir.clone(), source })?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_image(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn identity_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = rel.components();
    let first = parts.next()?.as_os_str().to_string_lossy().into_owned();
    if parts.next().is_some() {
        return Some(first);
    }
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Pick the store for a configured path: a directory of images or a JSON file.
pub fn store_for(path: Option<&Path>, factory: Arc<dyn EngineFactory>) -> Box<dyn IdentityStore> {
    match path {
        None => Box::new(EmptyStore),
        Some(p) if p.is_dir() => Box::new(ImageDirectory::new(p, factory)),
        Some(p) => Box::new(JsonGallery::new(p)),
    }
}

/// The live known-face index. Matching takes a cheap snapshot; a reload
/// swaps the whole index.
#[derive(Default)]
pub struct KnownFaces {
    inner: RwLock<Arc<KnownFaceIndex>>,
}

impl KnownFaces {
    pub fn new(index: KnownFaceIndex) -> Self {
        Self { inner: RwLock::new(Arc::new(index)) }
    }

    pub fn snapshot(&self) -> Arc<KnownFaceIndex> {
        Arc::clone(&self.inner.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn replace(&self, index: KnownFaceIndex) {
        *self.inner.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(index);
    }
}
