//! ContentStore implementations: local upload directory and in-memory map.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{PolyglotError, Result};
use crate::ports::ContentStore;

/// Audio files under a local upload directory; `audio_ref` is a relative path.
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, audio_ref: &str) -> Result<PathBuf> {
        let relative = Path::new(audio_ref);
        let escapes = audio_ref.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(PolyglotError::Permanent(format!(
                "audio reference {audio_ref:?} must be a relative path inside the upload directory"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn fetch(&self, audio_ref: &str) -> Result<Vec<u8>> {
        let path = self.resolve(audio_ref)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            IoErrorKind::NotFound | IoErrorKind::PermissionDenied | IoErrorKind::IsADirectory => {
                PolyglotError::Permanent(format!("cannot read {}: {e}", path.display()))
            }
            _ => PolyglotError::Transient(format!("reading {}: {e}", path.display())),
        })
    }
}

/// Audio kept in memory, for tests and the demo.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, audio_ref: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.write().await.insert(audio_ref.into(), bytes.into());
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn fetch(&self, audio_ref: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(audio_ref)
            .cloned()
            .ok_or_else(|| PolyglotError::Permanent(format!("unknown audio reference {audio_ref:?}")))
    }
}
