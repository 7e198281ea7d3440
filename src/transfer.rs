//! Chunked file transfer: splitting on the way out, reassembly on the way in.
//!
//! File content travels base64 encoded. The chunk size applies to the encoded
//! text, and chunks carry no sequence number: the receiver concatenates them in
//! arrival order, so the data channel has to be ordered and reliable.

use crate::error::Result;
use crate::frame::{DataFrame, FileMeta};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Reassembly buffer for one inbound transfer.
#[derive(Debug)]
pub struct FileTransfer {
  meta: FileMeta,
  chunks: Vec<String>,
}

impl FileTransfer {
  pub fn new(meta: FileMeta) -> Self {
    Self {
      meta,
      chunks: Vec::new(),
    }
  }

  pub fn push(&mut self, data: String) {
    self.chunks.push(data);
  }

  pub fn chunk_count(&self) -> usize {
    self.chunks.len()
  }

  /// Joins the buffered chunks and decodes them back to the file bytes.
  pub fn finish(self) -> Result<(FileMeta, Vec<u8>)> {
    let encoded = self.chunks.concat();
    let content = STANDARD.decode(encoded.as_bytes())?;
    Ok((self.meta, content))
  }
}

/// A file the host wants to send. `path` is resolved through the file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
  pub path: PathBuf,
  pub name: String,
  pub mime: String,
  pub transfer_id: Option<String>,
}

impl OutgoingFile {
  pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, mime: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      name: name.into(),
      mime: mime.into(),
      transfer_id: None,
    }
  }

  /// Takes the name from the last path component and guesses the MIME type
  /// from its extension.
  pub fn from_path(path: impl AsRef<Path>) -> Self {
    let path = path.as_ref();
    let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .map(str::to_string)
      .unwrap_or_else(|| "file".to_string());
    let mime = mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string();
    Self::new(path, name, mime)
  }

  pub fn with_transfer_id(mut self, transfer_id: impl Into<String>) -> Self {
    self.transfer_id = Some(transfer_id.into());
    self
  }
}

/// Builds the full frame sequence for one file: `file-meta`, the encoded
/// content in `chunk_size` pieces, then `file-end`.
pub fn file_frames(file: &OutgoingFile, transfer_id: &str, content: &[u8], chunk_size: usize) -> Vec<DataFrame> {
  let encoded = STANDARD.encode(content);
  let chunk_size = chunk_size.max(1);
  let mut frames = Vec::with_capacity(encoded.len() / chunk_size + 3);

  frames.push(DataFrame::FileMeta(FileMeta {
    name: file.name.clone(),
    mime: file.mime.clone(),
    size: content.len() as u64,
    transfer_id: transfer_id.to_string(),
  }));
  // base64 output is ASCII, so every byte offset is a char boundary.
  let mut start = 0;
  while start < encoded.len() {
    let end = (start + chunk_size).min(encoded.len());
    frames.push(DataFrame::FileChunk {
      transfer_id: transfer_id.to_string(),
      data: encoded[start..end].to_string(),
    });
    start = end;
  }
  frames.push(DataFrame::FileEnd {
    transfer_id: transfer_id.to_string(),
  });
  frames
}

/// Store path for a received file:
/// `<unix millis>_<transfer id prefix>_<sanitized name>`.
pub fn received_path(name: &str, transfer_id: &str, now: DateTime<Utc>) -> PathBuf {
  PathBuf::from(format!(
    "{}_{}_{}",
    now.timestamp_millis(),
    transfer_tag(transfer_id),
    sanitize_file_name(name)
  ))
}

/// Up to eight characters of the transfer id that are safe in a file name.
fn transfer_tag(transfer_id: &str) -> String {
  let tag: String = transfer_id
    .chars()
    .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
    .take(8)
    .collect();
  if tag.is_empty() {
    "t".to_string()
  } else {
    tag
  }
}

pub fn sanitize_file_name(name: &str) -> String {
  let normalized = name.replace('\\', "/");
  let candidate = Path::new(&normalized)
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or("file");
  let trimmed = candidate.trim();
  if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
    "file".to_string()
  } else {
    trimmed.to_string()
  }
}
