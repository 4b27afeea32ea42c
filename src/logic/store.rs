//! On-disk logic module storage and the hot-swappable current snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::LogicError;
use crate::logic::module::{LogicModule, ModuleCompiler, compute_hash};

/// Owns the logic file and the module currently installed from it.
///
/// Readers take an `Arc` snapshot once and keep using it; reloads install a
/// new `Arc` and never touch the old one.
pub struct LogicStore {
    path: PathBuf,
    compiler: Arc<dyn ModuleCompiler>,
    current: RwLock<Arc<LogicModule>>,
    /// Serializes write+reload so two updates never interleave.
    update_lock: Mutex<()>,
}

impl LogicStore {
    /// Create a store with the bootstrap placeholder installed.
    pub fn new(path: impl Into<PathBuf>, compiler: Arc<dyn ModuleCompiler>) -> Self {
        Self {
            path: path.into(),
            compiler,
            current: RwLock::new(Arc::new(LogicModule::placeholder())),
            update_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The module tasks should run against right now.
    pub async fn snapshot(&self) -> Arc<LogicModule> {
        Arc::clone(&*self.current.read().await)
    }

    /// Hash of the logic content currently on disk, `None` if absent or unreadable.
    pub async fn disk_hash(&self) -> Option<String> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Some(compute_hash(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read logic module for hashing");
                None
            }
        }
    }

    /// Re-read the logic file from disk and install it.
    ///
    /// On read or compile failure the previous module stays installed and the
    /// error is returned. A module that compiles but lacks a required
    /// capability is installed as not ready.
    pub async fn load(&self) -> Result<Arc<LogicModule>, LogicError> {
        let _guard = self.update_lock.lock().await;
        self.load_locked().await
    }

    /// Persist `content` verbatim to the logic path, then reload.
    ///
    /// The content is written to a sibling file and renamed over the logic
    /// path, so readers see either the old bytes or the new ones.
    pub async fn install(&self, content: &[u8]) -> Result<Arc<LogicModule>, LogicError> {
        let _guard = self.update_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LogicError::Write {
                    path: self.path.clone(),
                    source,
                })?;
        }

        let staging = self.staging_path();
        let written = match tokio::fs::write(&staging, content).await {
            Ok(()) => tokio::fs::rename(&staging, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(LogicError::Write {
                path: self.path.clone(),
                source,
            });
        }

        tracing::info!(
            path = %self.path.display(),
            bytes = content.len(),
            hash = %compute_hash(content),
            "Logic module written"
        );

        self.load_locked().await
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "logic".to_string());
        self.path.with_file_name(format!(".{name}.partial"))
    }

    async fn load_locked(&self) -> Result<Arc<LogicModule>, LogicError> {
        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|source| LogicError::Read {
                path: self.path.clone(),
                source,
            })?;

        let capabilities = self.compiler.compile(&content)?;
        let module = Arc::new(LogicModule::from_parts(content, capabilities));

        if module.is_ready() {
            tracing::info!(
                hash = module.content_hash().unwrap_or_default(),
                capabilities = ?module.capabilities(),
                "Logic module loaded"
            );
        } else {
            let missing: Vec<&str> = module
                .missing_required()
                .iter()
                .map(|c| c.as_str())
                .collect();
            tracing::warn!(
                hash = module.content_hash().unwrap_or_default(),
                missing = ?missing,
                "Logic module loaded but is not ready"
            );
        }

        *self.current.write().await = Arc::clone(&module);
        Ok(module)
    }
}
