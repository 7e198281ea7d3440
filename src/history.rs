//! Local append log for caching chat messages while offline.
//!
//! Lists are returned newest first.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tokio::sync::Mutex;
use url::form_urlencoded;

#[async_trait]
pub trait MessageLog: Send + Sync {
  async fn append(&self, key: &str, message: Value) -> io::Result<Vec<Value>>;
  async fn list(&self, key: &str) -> io::Result<Vec<Value>>;
}

#[derive(Default)]
pub struct MemoryMessageLog {
  entries: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryMessageLog {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
  async fn append(&self, key: &str, message: Value) -> io::Result<Vec<Value>> {
    let mut guard = self.entries.lock().await;
    let list = guard.entry(key.to_string()).or_default();
    list.insert(0, message);
    Ok(list.clone())
  }

  async fn list(&self, key: &str) -> io::Result<Vec<Value>> {
    Ok(self.entries.lock().await.get(key).cloned().unwrap_or_default())
  }
}

/// One JSON array file per key inside `dir`. Keys are percent-encoded into
/// the file name, so every key gets its own file.
pub struct JsonFileMessageLog {
  dir: PathBuf,
  lock: Mutex<()>,
}

impl JsonFileMessageLog {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      lock: Mutex::new(()),
    }
  }

  fn path_for(&self, key: &str) -> PathBuf {
    let encoded: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
    self.dir.join(format!("{encoded}.json"))
  }

  async fn load(&self, key: &str) -> io::Result<Vec<Value>> {
    match tokio::fs::read(self.path_for(key)).await {
      Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
      Err(err) => Err(err),
    }
  }
}

#[async_trait]
impl MessageLog for JsonFileMessageLog {
  async fn append(&self, key: &str, message: Value) -> io::Result<Vec<Value>> {
    let _guard = self.lock.lock().await;
    let mut list = self.load(key).await?;
    list.insert(0, message);
    tokio::fs::create_dir_all(&self.dir).await?;
    let bytes = serde_json::to_vec(&list).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    tokio::fs::write(self.path_for(key), bytes).await?;
    Ok(list)
  }

  async fn list(&self, key: &str) -> io::Result<Vec<Value>> {
    let _guard = self.lock.lock().await;
    self.load(key).await
  }
}
