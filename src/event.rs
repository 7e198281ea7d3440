//! Host-facing events and the observer list that delivers them.

use crate::connection::RemoteStream;
use crate::session::{ChannelState, PeerState};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A completed inbound transfer, already written through the file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
  pub name: String,
  pub mime: String,
  pub path: PathBuf,
  pub transfer_id: String,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
  Message(Value),
  File(ReceivedFile),
  PeerState(PeerState),
  ChannelState(ChannelState),
  RemoteStream(RemoteStream),
}

/// Fan-out list of subscribers. Dropping a receiver unsubscribes it; the dead
/// sender is pruned on the next emit.
pub(crate) struct Observers<E> {
  subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> Observers<E> {
  pub(crate) fn new() -> Self {
    Self {
      subscribers: Mutex::new(Vec::new()),
    }
  }

  pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut guard) = self.subscribers.lock() {
      guard.push(tx);
    }
    rx
  }

  pub(crate) fn emit(&self, event: E) {
    if let Ok(mut guard) = self.subscribers.lock() {
      guard.retain(|tx| tx.send(event.clone()).is_ok());
    }
  }

  /// Drops every subscriber; their receivers yield `None` once drained.
  pub(crate) fn clear(&self) {
    if let Ok(mut guard) = self.subscribers.lock() {
      guard.clear();
    }
  }
}
