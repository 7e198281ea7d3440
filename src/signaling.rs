//! Signaling channel seam.
//!
//! A signaling channel is a whisper bus: frames reach whoever is subscribed to
//! a room at publish time and are never stored or replayed. Sessions receive
//! the channel at construction instead of reaching for a shared client.

use crate::error::{Result, SessionError};
use crate::frame::SignalFrame;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
  /// Starts listening on `room`. Dropping the receiver ends the subscription.
  async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<SignalFrame>>;
  async fn publish(&self, room: &str, frame: &SignalFrame) -> Result<()>;
}

/// Where a session publishes its frames and where it listens for the remote's.
///
/// A direct session shares one room with its peer. A group session publishes
/// to the remote member's inbox `<room>.<remote>` and listens on its own inbox
/// `<room>.<local>`, accepting only frames sent by that remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRoute {
  pub publish: String,
  pub listen: String,
  pub remote: Option<String>,
}

impl SignalRoute {
  pub fn shared(room: impl Into<String>) -> Self {
    let room = room.into();
    Self {
      publish: room.clone(),
      listen: room,
      remote: None,
    }
  }

  pub fn mailbox(room: &str, local_id: &str, remote_id: &str) -> Self {
    Self {
      publish: member_room(room, remote_id),
      listen: member_room(room, local_id),
      remote: Some(remote_id.to_string()),
    }
  }

  /// The room this session is addressed at.
  pub fn name(&self) -> &str {
    &self.publish
  }

  pub(crate) fn accepts(&self, sender: &str) -> bool {
    self.remote.as_deref().map_or(true, |remote| remote == sender)
  }
}

pub fn member_room(room: &str, member_id: &str) -> String {
  format!("{room}.{member_id}")
}

/// In-process signaling bus. Publishers that are also subscribed to a room
/// hear their own frames, the same as on a shared pub/sub channel.
#[derive(Default)]
pub struct LocalHub {
  rooms: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SignalFrame>>>>,
}

impl LocalHub {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscriber_count(&self, room: &str) -> usize {
    self
      .rooms
      .lock()
      .map(|rooms| rooms.get(room).map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count()))
      .unwrap_or(0)
  }
}

#[async_trait]
impl SignalingChannel for LocalHub {
  async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<SignalFrame>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut rooms = self
      .rooms
      .lock()
      .map_err(|_| SessionError::Signaling("hub lock poisoned".to_string()))?;
    rooms.entry(room.to_string()).or_default().push(tx);
    Ok(rx)
  }

  async fn publish(&self, room: &str, frame: &SignalFrame) -> Result<()> {
    let mut rooms = self
      .rooms
      .lock()
      .map_err(|_| SessionError::Signaling("hub lock poisoned".to_string()))?;
    if let Some(subscribers) = rooms.get_mut(room) {
      subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
      if subscribers.is_empty() {
        rooms.remove(room);
      }
    }
    Ok(())
  }
}
