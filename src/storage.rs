use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::fs;

/// Files served from the public root. Every key is a `/`-separated path
/// relative to that root, the same form stored in `files.path` and
/// `images.path`.
#[async_trait]
pub trait PublicStorage: Send + Sync + 'static {
    fn root(&self) -> &Path;

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Returns `false` when there was nothing to delete.
    async fn delete_object(&self, key: &str) -> Result<bool>;

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root().join(validate_key(key)?))
    }
}

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create public root {}", self.root.display()))
    }
}

#[async_trait]
impl PublicStorage for LocalStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("failed to create storage directory")?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {key}"))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete_object(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to delete {key}")),
        }
    }
}

/// Rejects keys that would escape the public root.
pub fn validate_key(key: &str) -> Result<&Path> {
    let trimmed = key.trim_start_matches("./");
    if trimmed.is_empty() {
        bail!("storage key must not be empty");
    }
    let path = Path::new(trimmed);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => bail!("storage key {key:?} must be relative to the public root"),
        }
    }
    Ok(path)
}

/// Renders `path` relative to `root` with `/` separators.
pub fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside the public root", path.display()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_` so uploaded names are safe on disk.
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
