//! Local file store used to read outgoing files and materialize received ones.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait FileStore: Send + Sync {
  async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
  async fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;
}

/// Files under one root directory. Relative paths are joined to the root and
/// may not climb out of it; absolute paths are used as given for reads.
pub struct DirFileStore {
  root: PathBuf,
}

impl DirFileStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
      return Ok(path.to_path_buf());
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("path escapes store root: {}", path.display()),
      ));
    }
    Ok(self.root.join(path))
  }
}

#[async_trait]
impl FileStore for DirFileStore {
  async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    let path = self.resolve(path)?;
    tokio::fs::read(path).await
  }

  async fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
    if path.is_absolute() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("writes must be relative to the store root: {}", path.display()),
      ));
    }
    let path = self.resolve(path)?;
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
  }
}

#[derive(Default)]
pub struct MemoryFileStore {
  files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
    if let Ok(mut files) = self.files.lock() {
      files.insert(path.into(), content.into());
    }
  }

  pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
    self.files.lock().ok().and_then(|files| files.get(path).cloned())
  }

  pub fn paths(&self) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = self
      .files
      .lock()
      .map(|files| files.keys().cloned().collect())
      .unwrap_or_default();
    paths.sort();
    paths
  }
}

#[async_trait]
impl FileStore for MemoryFileStore {
  async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    self
      .get(path)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path.display())))
  }

  async fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
    self.insert(path, content.to_vec());
    Ok(())
  }
}
