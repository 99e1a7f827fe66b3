use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};

/// Destination for received files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create (or truncate) the file that will hold `filename`.
    ///
    /// Returns `Ok(None)` when the name cannot be stored, e.g. it has no
    /// usable final component.
    async fn create_file(&self, filename: &str) -> Result<Option<(PathBuf, File)>>;
}

/// Writes received files into a single flat directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    save_dir: PathBuf,
}

impl LocalStorage {
    /// Use `save_dir`, creating it (and any parents) if missing.
    pub fn new(save_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&save_dir)
            .with_context(|| format!("Failed to create save directory {}", save_dir.display()))?;

        Ok(Self { save_dir })
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Map a sender-supplied name onto a path inside the save directory.
    /// Only the last normal component is kept, so `../x` and `a/b/x` both
    /// land as `x`.
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        let name = Path::new(filename)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .last()?;
        // Windows-style separators are not path separators on unix.
        let name = name.to_str()?.rsplit('\\').next()?;
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }
        Some(self.save_dir.join(name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn create_file(&self, filename: &str) -> Result<Option<(PathBuf, File)>> {
        let Some(path) = self.resolve(filename) else {
            tracing::warn!("Refusing to store file with unusable name {:?}", filename);
            return Ok(None);
        };

        // The directory may have been removed since construction.
        fs::create_dir_all(&self.save_dir)
            .await
            .context("Failed to create save directory")?;

        let file = File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;

        tracing::debug!("Opened {} for writing", path.display());
        Ok(Some((path, file)))
    }
}
