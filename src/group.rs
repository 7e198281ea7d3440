//! Multi-party rooms as a set of independent pairwise sessions.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::event::{Observers, SessionEvent};
use crate::session::{PeerSession, PeerState, SendOutcome, SessionDeps};
use crate::signaling::SignalRoute;
use crate::transfer::OutgoingFile;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A session event tagged with the remote member it came from.
#[derive(Debug, Clone)]
pub struct GroupEvent {
  pub peer_id: String,
  pub event: SessionEvent,
}

pub struct GroupSession {
  room: String,
  local_id: String,
  members: BTreeSet<String>,
  deps: SessionDeps,
  config: SessionConfig,
  peers: Mutex<HashMap<String, Arc<PeerSession>>>,
  observers: Arc<Observers<GroupEvent>>,
  forwarders: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl GroupSession {
  pub fn new<I, S>(
    room: impl Into<String>,
    local_id: impl Into<String>,
    members: I,
    deps: SessionDeps,
    config: SessionConfig,
  ) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let local_id = local_id.into();
    let members = members
      .into_iter()
      .map(Into::into)
      .filter(|member: &String| *member != local_id)
      .collect();
    Self {
      room: room.into(),
      local_id,
      members,
      deps,
      config,
      peers: Mutex::new(HashMap::new()),
      observers: Arc::new(Observers::new()),
      forwarders: std::sync::Mutex::new(Vec::new()),
    }
  }

  pub fn room(&self) -> &str {
    &self.room
  }

  pub fn local_id(&self) -> &str {
    &self.local_id
  }

  /// Remote members, local id excluded.
  pub fn members(&self) -> impl Iterator<Item = &str> {
    self.members.iter().map(String::as_str)
  }

  /// Opens one session per remote member addressed at `<room>.<member>` and
  /// offers to each of them. Members that already have a session are skipped.
  pub async fn init(&self) -> Result<()> {
    let mut peers = self.peers.lock().await;
    for member in &self.members {
      if peers.contains_key(member) {
        continue;
      }
      let route = SignalRoute::mailbox(&self.room, &self.local_id, member);
      let session = PeerSession::open(route, self.local_id.clone(), self.deps.clone(), self.config.clone()).await?;
      self.forward_events(member.clone(), session.subscribe());

      // Members already in the room missed nothing but this offer; crossing
      // offers are settled inside the session.
      session.connect_as_caller().await?;
      debug!(room = %session.room(), "offer sent");
      peers.insert(member.clone(), session);
    }
    info!(room = %self.room, local = %self.local_id, peers = peers.len(), "group session ready");
    Ok(())
  }

  fn forward_events(&self, peer_id: String, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let observers = self.observers.clone();
    let handle = tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        observers.emit(GroupEvent {
          peer_id: peer_id.clone(),
          event,
        });
      }
    });
    if let Ok(mut forwarders) = self.forwarders.lock() {
      forwarders.push(handle);
    }
  }

  /// Registers an observer for events from every peer in the room.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<GroupEvent> {
    self.observers.subscribe()
  }

  pub async fn peer(&self, member_id: &str) -> Option<Arc<PeerSession>> {
    self.peers.lock().await.get(member_id).cloned()
  }

  pub async fn peer_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
    ids.sort();
    ids
  }

  pub async fn peer_states(&self) -> Vec<(String, PeerState)> {
    let sessions = self.snapshot().await;
    let mut states = Vec::with_capacity(sessions.len());
    for (id, session) in sessions {
      states.push((id, session.state().await));
    }
    states
  }

  async fn snapshot(&self) -> Vec<(String, Arc<PeerSession>)> {
    let mut sessions: Vec<(String, Arc<PeerSession>)> = self
      .peers
      .lock()
      .await
      .iter()
      .map(|(id, session)| (id.clone(), session.clone()))
      .collect();
    sessions.sort_by(|a, b| a.0.cmp(&b.0));
    sessions
  }

  /// Sends `message` to every peer. Returns how many peers it was handed to;
  /// peers whose channel is not open or whose send fails are skipped.
  pub async fn send_text<T: Serialize + ?Sized>(&self, message: &T) -> usize {
    let mut sent = 0;
    for (id, session) in self.snapshot().await {
      match session.send_text(message).await {
        Ok(SendOutcome::Sent) => sent += 1,
        Ok(SendOutcome::Dropped) => {}
        Err(err) => warn!(room = %self.room, peer = %id, error = %err, "text send failed"),
      }
    }
    sent
  }

  /// Sends `file` to every peer, one full transfer per peer.
  pub async fn send_file(&self, file: &OutgoingFile, chunk_size: Option<usize>) -> usize {
    let mut sent = 0;
    for (id, session) in self.snapshot().await {
      match session.send_file(file, chunk_size).await {
        Ok(SendOutcome::Sent) => sent += 1,
        Ok(SendOutcome::Dropped) => {}
        Err(err) => warn!(room = %self.room, peer = %id, error = %err, "file send failed"),
      }
    }
    sent
  }

  /// Closes every session and empties the peer map. Nothing is delivered to
  /// group observers afterwards.
  pub async fn close_all(&self) {
    let sessions: Vec<Arc<PeerSession>> = self.peers.lock().await.drain().map(|(_, session)| session).collect();
    for session in &sessions {
      session.close().await;
    }
    if let Ok(mut forwarders) = self.forwarders.lock() {
      for handle in forwarders.drain(..) {
        handle.abort();
      }
    }
    self.observers.clear();
    if !sessions.is_empty() {
      info!(room = %self.room, closed = sessions.len(), "group session closed");
    }
  }
}
