//! One negotiated connection to one remote peer.
//!
//! A [`PeerSession`] runs offer/answer/ICE over its signaling route, owns the
//! `chat` data channel, and speaks the data-channel frame protocol on it.
//! Inbound signal frames, connection events and channel events are pumped by
//! tasks owned by the session; every handler runs under the session's state
//! lock, so two handlers of the same session never interleave.

use crate::config::{compare_ids, SessionConfig};
use crate::connection::{
  ChannelEvent, ChannelHandle, Connection, ConnectionEvent, Connector, DataChannel, LocalStream, TransportState,
};
use crate::error::{Result, SessionError};
use crate::event::{Observers, ReceivedFile, SessionEvent};
use crate::frame::{DataFrame, SignalFrame};
use crate::signaling::{SignalRoute, SignalingChannel};
use crate::store::FileStore;
use crate::transfer::{file_frames, received_path, FileTransfer, OutgoingFile};
use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
  Idle,
  Negotiating,
  Connected,
  Failed,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  Unbound,
  Open,
  Closed,
}

/// Whether an outbound frame was handed to the data channel. Sends while the
/// channel is not open are dropped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
  Sent,
  Dropped,
}

/// External collaborators injected into every session.
#[derive(Clone)]
pub struct SessionDeps {
  pub signaling: Arc<dyn SignalingChannel>,
  pub connector: Arc<dyn Connector>,
  pub store: Arc<dyn FileStore>,
}

struct State {
  peer: PeerState,
  channel_state: ChannelState,
  connection: Option<Arc<dyn Connection>>,
  channel: Option<Arc<dyn DataChannel>>,
  // Bumped whenever the connection is replaced; pumps of older connections
  // carry a stale value and their events are ignored.
  generation: u64,
  offer_pending: bool,
  local_offer: Option<RTCSessionDescription>,
  // SDP of the last remote offer answered and the answer sent for it.
  answered_offer: Option<String>,
  last_answer: Option<RTCSessionDescription>,
  remote_description_set: bool,
  pending_candidates: Vec<RTCIceCandidateInit>,
  transfers: HashMap<String, FileTransfer>,
  local_stream: Option<LocalStream>,
}

impl State {
  fn is_current(&self, generation: u64) -> bool {
    self.peer != PeerState::Closed && self.generation == generation
  }
}

pub struct PeerSession {
  me: Weak<PeerSession>,
  route: SignalRoute,
  local_id: String,
  config: SessionConfig,
  deps: SessionDeps,
  state: Mutex<State>,
  observers: Observers<SessionEvent>,
  tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PeerSession {
  /// Subscribes to the route's listening room and starts pumping inbound
  /// signal frames. The session stays `idle` until it calls or is called.
  pub async fn open(
    route: SignalRoute,
    local_id: impl Into<String>,
    deps: SessionDeps,
    config: SessionConfig,
  ) -> Result<Arc<Self>> {
    let signals = deps.signaling.subscribe(&route.listen).await?;
    let local_id = local_id.into();
    let session = Arc::new_cyclic(|me| PeerSession {
      me: me.clone(),
      route,
      local_id,
      config,
      deps,
      state: Mutex::new(State {
        peer: PeerState::Idle,
        channel_state: ChannelState::Unbound,
        connection: None,
        channel: None,
        generation: 0,
        offer_pending: false,
        local_offer: None,
        answered_offer: None,
        last_answer: None,
        remote_description_set: false,
        pending_candidates: Vec::new(),
        transfers: HashMap::new(),
        local_stream: None,
      }),
      observers: Observers::new(),
      tasks: std::sync::Mutex::new(Vec::new()),
    });
    session.spawn(pump_signals(Arc::downgrade(&session), signals));
    info!(room = %session.room(), local = %session.local_id, "peer session opened");
    Ok(session)
  }

  /// The room this session is addressed at.
  pub fn room(&self) -> &str {
    self.route.name()
  }

  pub fn route(&self) -> &SignalRoute {
    &self.route
  }

  pub fn local_id(&self) -> &str {
    &self.local_id
  }

  pub async fn state(&self) -> PeerState {
    self.state.lock().await.peer
  }

  pub async fn channel_state(&self) -> ChannelState {
    self.state.lock().await.channel_state
  }

  pub async fn pending_transfers(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.state.lock().await.transfers.keys().cloned().collect();
    ids.sort();
    ids
  }

  /// Registers an observer. Dropping the receiver unsubscribes it.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
    self.observers.subscribe()
  }

  /// Creates the connection and the `chat` channel, then publishes an offer.
  ///
  /// Negotiation failures do not come back from here; they move the session
  /// to `failed` and are reported through [`SessionEvent::PeerState`]. Calling
  /// this from `failed` throws the old connection away and starts over.
  pub async fn connect_as_caller(&self) -> Result<()> {
    let mut state = self.state.lock().await;
    let current = state.peer;
    match current {
      PeerState::Closed => return Err(SessionError::Closed),
      PeerState::Negotiating | PeerState::Connected => {
        debug!(room = %self.room(), state = ?current, "negotiation already under way");
        return Ok(());
      }
      PeerState::Failed => self.reset_connection(&mut state).await,
      PeerState::Idle => {}
    }
    if let Err(err) = self.send_offer(&mut state).await {
      self.fail(&mut state, err);
    }
    Ok(())
  }

  async fn send_offer(&self, state: &mut State) -> Result<()> {
    self.transition(state, PeerState::Negotiating);
    let connection = self.ensure_connection(state).await?;
    if state.channel.is_none() {
      let handle = connection.create_data_channel(&self.config.channel_label).await?;
      let generation = state.generation;
      self.bind_channel(state, generation, handle);
    }

    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    state.offer_pending = true;
    let local = connection.local_description().await.unwrap_or(offer);
    state.local_offer = Some(local.clone());
    self
      .publish(SignalFrame::Offer {
        from: self.local_id.clone(),
        data: local,
      })
      .await
  }

  /// Handles one inbound signal frame. Normally driven by the session's own
  /// signaling pump.
  pub async fn on_signal(&self, frame: SignalFrame) {
    if frame.sender() == self.local_id {
      trace!(room = %self.room(), kind = frame.kind(), "ignoring own signal");
      return;
    }
    if !self.route.accepts(frame.sender()) {
      trace!(room = %self.room(), from = %frame.sender(), "signal for another peer");
      return;
    }
    debug!(room = %self.room(), from = %frame.sender(), kind = frame.kind(), "signal received");

    match frame {
      SignalFrame::Offer { from, data } => self.accept_offer(&from, data).await,
      SignalFrame::Answer { data, .. } => self.accept_answer(data).await,
      SignalFrame::Ice { data, .. } => self.add_remote_candidate(data).await,
    }
  }

  async fn accept_offer(&self, from: &str, offer: RTCSessionDescription) {
    let mut state = self.state.lock().await;
    if state.peer == PeerState::Closed {
      return;
    }
    if state.answered_offer.as_deref() == Some(offer.sdp.as_str()) {
      debug!(room = %self.room(), from, "offer already answered, repeating answer");
      if let Some(answer) = state.last_answer.clone() {
        self.publish_or_warn(SignalFrame::Answer {
          from: self.local_id.clone(),
          data: answer,
        })
        .await;
      }
      return;
    }

    let current = state.peer;
    match current {
      PeerState::Failed => {
        debug!(room = %self.room(), from, "remote restarted negotiation");
        self.reset_connection(&mut state).await;
      }
      _ if state.offer_pending => {
        // Either both sides called at once or the remote joined after our
        // offer went out and never saw it. The lower id keeps its offer and
        // sends it again; the other side answers it.
        if compare_ids(&self.local_id, from) == Ordering::Less {
          debug!(room = %self.room(), from, "offers crossed, repeating local offer");
          if let Some(local) = state.local_offer.clone() {
            self.publish_or_warn(SignalFrame::Offer {
              from: self.local_id.clone(),
              data: local,
            })
            .await;
          }
          return;
        }
        debug!(room = %self.room(), from, "offers crossed, answering remote offer");
        self.reset_connection(&mut state).await;
      }
      PeerState::Idle if !self.config.initiator_rule.answers_idle(&self.local_id, from) => {
        debug!(room = %self.room(), from, "remote is present, calling back");
        if let Err(err) = self.send_offer(&mut state).await {
          self.fail(&mut state, err);
        }
        return;
      }
      _ => {}
    }
    if let Err(err) = self.answer_offer(&mut state, offer).await {
      self.fail(&mut state, err);
    }
  }

  async fn answer_offer(&self, state: &mut State, offer: RTCSessionDescription) -> Result<()> {
    if matches!(state.peer, PeerState::Idle | PeerState::Failed) {
      self.transition(state, PeerState::Negotiating);
    }
    let connection = self.ensure_connection(state).await?;
    let offer_sdp = offer.sdp.clone();
    connection.set_remote_description(offer).await?;
    state.remote_description_set = true;
    self.flush_candidates(state, &connection).await;

    let answer = connection.create_answer().await?;
    connection.set_local_description(answer.clone()).await?;
    let local = connection.local_description().await.unwrap_or(answer);
    state.answered_offer = Some(offer_sdp);
    state.last_answer = Some(local.clone());
    self
      .publish(SignalFrame::Answer {
        from: self.local_id.clone(),
        data: local,
      })
      .await
  }

  async fn accept_answer(&self, answer: RTCSessionDescription) {
    let mut state = self.state.lock().await;
    if state.peer == PeerState::Closed {
      return;
    }
    if state.remote_description_set {
      debug!(room = %self.room(), "remote description already set, ignoring answer");
      return;
    }
    let connection = match (&state.connection, state.offer_pending) {
      (Some(connection), true) => connection.clone(),
      _ => {
        debug!(room = %self.room(), "answer without a pending offer");
        return;
      }
    };
    match connection.set_remote_description(answer).await {
      Ok(()) => {
        state.remote_description_set = true;
        state.offer_pending = false;
        self.flush_candidates(&mut state, &connection).await;
      }
      Err(err) => self.fail(&mut state, SessionError::Negotiation(err.to_string())),
    }
  }

  async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) {
    let mut state = self.state.lock().await;
    if state.peer == PeerState::Closed {
      return;
    }
    let connection = match (&state.connection, state.remote_description_set) {
      (Some(connection), true) => connection.clone(),
      _ => {
        state.pending_candidates.push(candidate);
        return;
      }
    };
    if let Err(err) = connection.add_ice_candidate(candidate).await {
      debug!(room = %self.room(), error = %err, "ignoring remote candidate");
    }
  }

  async fn flush_candidates(&self, state: &mut State, connection: &Arc<dyn Connection>) {
    for candidate in std::mem::take(&mut state.pending_candidates) {
      if let Err(err) = connection.add_ice_candidate(candidate).await {
        debug!(room = %self.room(), error = %err, "ignoring queued candidate");
      }
    }
  }

  async fn ensure_connection(&self, state: &mut State) -> Result<Arc<dyn Connection>> {
    if let Some(connection) = &state.connection {
      return Ok(connection.clone());
    }
    let handle = self.deps.connector.connect(&self.config.ice_servers).await?;
    state.generation += 1;
    self.spawn(pump_connection(self.me.clone(), state.generation, handle.events));
    state.connection = Some(handle.connection.clone());
    debug!(room = %self.room(), generation = state.generation, "connection created");
    Ok(handle.connection)
  }

  async fn reset_connection(&self, state: &mut State) {
    state.generation += 1;
    if let Some(channel) = state.channel.take() {
      let _ = channel.close().await;
    }
    if let Some(connection) = state.connection.take() {
      let _ = connection.close().await;
    }
    state.offer_pending = false;
    state.local_offer = None;
    state.answered_offer = None;
    state.last_answer = None;
    state.remote_description_set = false;
    state.pending_candidates.clear();
    state.local_stream = None;
    self.set_channel_state(state, ChannelState::Unbound);
  }

  fn bind_channel(&self, state: &mut State, generation: u64, handle: ChannelHandle) {
    let open = handle.channel.is_open();
    state.channel = Some(handle.channel);
    if open {
      self.set_channel_state(state, ChannelState::Open);
    }
    self.spawn(pump_channel(self.me.clone(), generation, handle.events));
  }

  async fn on_connection_event(&self, generation: u64, event: ConnectionEvent) {
    match event {
      ConnectionEvent::IceCandidate(candidate) => {
        if !self.state.lock().await.is_current(generation) {
          return;
        }
        let frame = SignalFrame::Ice {
          from: self.local_id.clone(),
          data: candidate,
        };
        if let Err(err) = self.publish(frame).await {
          warn!(room = %self.room(), error = %err, "could not forward local candidate");
        }
      }
      ConnectionEvent::StateChanged(transport) => {
        let mut state = self.state.lock().await;
        if !state.is_current(generation) {
          return;
        }
        match transport {
          TransportState::Connected if state.peer == PeerState::Negotiating => {
            self.transition(&mut state, PeerState::Connected)
          }
          TransportState::Failed if matches!(state.peer, PeerState::Negotiating | PeerState::Connected) => {
            self.fail(&mut state, SessionError::Negotiation("transport failed".to_string()))
          }
          other => debug!(room = %self.room(), transport = ?other, "transport state"),
        }
      }
      ConnectionEvent::DataChannel(handle) => {
        let mut state = self.state.lock().await;
        let label = handle.channel.label();
        if !state.is_current(generation) || state.channel.is_some() || label != self.config.channel_label {
          debug!(room = %self.room(), label = %label, "ignoring remote data channel");
          return;
        }
        self.bind_channel(&mut state, generation, handle);
      }
      ConnectionEvent::RemoteTrack(stream) => {
        if !self.state.lock().await.is_current(generation) {
          return;
        }
        self.observers.emit(SessionEvent::RemoteStream(stream));
      }
    }
  }

  async fn on_channel_event(&self, generation: u64, event: ChannelEvent) {
    match event {
      ChannelEvent::Message(text) => {
        if self.state.lock().await.is_current(generation) {
          self.on_channel_message(&text).await;
        }
      }
      ChannelEvent::Open => self.update_channel_state(generation, ChannelState::Open).await,
      ChannelEvent::Closed => self.update_channel_state(generation, ChannelState::Closed).await,
    }
  }

  async fn update_channel_state(&self, generation: u64, next: ChannelState) {
    let mut state = self.state.lock().await;
    if state.is_current(generation) {
      self.set_channel_state(&mut state, next);
    }
  }

  /// Handles one inbound data-channel payload. Normally driven by the
  /// session's own channel pump.
  pub async fn on_channel_message(&self, text: &str) {
    let frame = match DataFrame::decode(text) {
      Ok(frame) => frame,
      Err(err) => {
        warn!(room = %self.room(), error = %err, "discarding data channel payload");
        return;
      }
    };

    let mut state = self.state.lock().await;
    if state.peer == PeerState::Closed {
      return;
    }
    match frame {
      DataFrame::Text(payload) => {
        drop(state);
        self.observers.emit(SessionEvent::Message(payload));
      }
      DataFrame::FileMeta(meta) => {
        debug!(
          room = %self.room(),
          transfer_id = %meta.transfer_id,
          name = %meta.name,
          size = meta.size,
          "transfer started"
        );
        let transfer_id = meta.transfer_id.clone();
        if state.transfers.insert(transfer_id.clone(), FileTransfer::new(meta)).is_some() {
          debug!(room = %self.room(), transfer_id = %transfer_id, "replaced live transfer");
        }
      }
      DataFrame::FileChunk { transfer_id, data } => match state.transfers.get_mut(&transfer_id) {
        Some(transfer) => transfer.push(data),
        None => debug!(room = %self.room(), transfer_id = %transfer_id, "chunk for unknown transfer"),
      },
      DataFrame::FileEnd { transfer_id } => {
        let Some(transfer) = state.transfers.remove(&transfer_id) else {
          debug!(room = %self.room(), transfer_id = %transfer_id, "end for unknown transfer");
          return;
        };
        drop(state);
        self.complete_transfer(transfer).await;
      }
    }
  }

  async fn complete_transfer(&self, transfer: FileTransfer) {
    let chunks = transfer.chunk_count();
    let (meta, content) = match transfer.finish() {
      Ok(done) => done,
      Err(err) => {
        warn!(room = %self.room(), error = %err, "discarding transfer with undecodable content");
        return;
      }
    };
    if content.len() as u64 != meta.size {
      debug!(
        transfer_id = %meta.transfer_id,
        declared = meta.size,
        actual = content.len(),
        "size differs from file-meta"
      );
    }

    let path = received_path(&meta.name, &meta.transfer_id, Utc::now());
    if let Err(err) = self.deps.store.write(&path, &content).await {
      warn!(room = %self.room(), transfer_id = %meta.transfer_id, error = %err, "could not store received file");
      return;
    }
    info!(
      room = %self.room(),
      transfer_id = %meta.transfer_id,
      path = %path.display(),
      bytes = content.len(),
      chunks,
      "file received"
    );
    self.observers.emit(SessionEvent::File(ReceivedFile {
      name: meta.name,
      mime: meta.mime,
      path,
      transfer_id: meta.transfer_id,
    }));
  }

  /// Sends one `text` frame carrying `message`.
  pub async fn send_text<T: Serialize + ?Sized>(&self, message: &T) -> Result<SendOutcome> {
    let Some(channel) = self.open_channel().await else {
      debug!(room = %self.room(), "data channel not open, dropping text");
      return Ok(SendOutcome::Dropped);
    };
    let text = DataFrame::Text(serde_json::to_value(message)?).encode()?;
    channel.send_text(text).await?;
    Ok(SendOutcome::Sent)
  }

  /// Reads `file` through the store and sends it as `file-meta`, chunks and
  /// `file-end`. Every frame is queued without waiting for the remote.
  pub async fn send_file(&self, file: &OutgoingFile, chunk_size: Option<usize>) -> Result<SendOutcome> {
    let Some(channel) = self.open_channel().await else {
      debug!(room = %self.room(), name = %file.name, "data channel not open, dropping file");
      return Ok(SendOutcome::Dropped);
    };
    let content = self.deps.store.read(&file.path).await?;
    let transfer_id = file.transfer_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let chunk_size = chunk_size.filter(|size| *size > 0).unwrap_or(self.config.chunk_size);
    let frames = file_frames(file, &transfer_id, &content, chunk_size);

    info!(
      room = %self.room(),
      transfer_id = %transfer_id,
      name = %file.name,
      bytes = content.len(),
      frames = frames.len(),
      "sending file"
    );
    for frame in frames {
      channel.send_text(frame.encode()?).await?;
    }
    Ok(SendOutcome::Sent)
  }

  async fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
    let state = self.state.lock().await;
    if state.peer == PeerState::Closed || state.channel_state != ChannelState::Open {
      return None;
    }
    state.channel.clone().filter(|channel| channel.is_open())
  }

  /// Attaches a local audio and video track to the connection, creating the
  /// connection if needed. Tracks are only carried by offers and answers
  /// produced afterwards, so call this before negotiating.
  pub async fn enable_av(&self) -> Result<LocalStream> {
    let mut state = self.state.lock().await;
    if state.peer == PeerState::Closed {
      return Err(SessionError::Closed);
    }
    if let Some(stream) = &state.local_stream {
      return Ok(stream.clone());
    }
    let connection = self.ensure_connection(&mut state).await?;
    let stream = connection
      .add_local_stream(&format!("{}-{}", self.room(), self.local_id))
      .await?;
    state.local_stream = Some(stream.clone());
    Ok(stream)
  }

  /// Closes the channel and connection and drops unfinished transfers. The
  /// remote is not told. Safe to call more than once.
  pub async fn close(&self) {
    let mut state = self.state.lock().await;
    if state.peer == PeerState::Closed {
      return;
    }
    state.generation += 1;
    if let Some(channel) = state.channel.take() {
      if let Err(err) = channel.close().await {
        debug!(room = %self.room(), error = %err, "closing data channel");
      }
    }
    if let Some(connection) = state.connection.take() {
      if let Err(err) = connection.close().await {
        debug!(room = %self.room(), error = %err, "closing connection");
      }
    }
    state.transfers.clear();
    state.pending_candidates.clear();
    state.offer_pending = false;
    state.local_stream = None;
    state.channel_state = ChannelState::Closed;
    self.transition(&mut state, PeerState::Closed);
    drop(state);

    self.observers.clear();
    self.abort_tasks();
    info!(room = %self.room(), "peer session closed");
  }

  async fn publish(&self, frame: SignalFrame) -> Result<()> {
    self.deps.signaling.publish(&self.route.publish, &frame).await
  }

  async fn publish_or_warn(&self, frame: SignalFrame) {
    let kind = frame.kind();
    if let Err(err) = self.publish(frame).await {
      warn!(room = %self.room(), kind, error = %err, "could not publish signal");
    }
  }

  fn fail(&self, state: &mut State, err: SessionError) {
    warn!(room = %self.room(), error = %err, "negotiation failed");
    if matches!(state.peer, PeerState::Negotiating | PeerState::Connected) {
      self.transition(state, PeerState::Failed);
    }
  }

  fn transition(&self, state: &mut State, next: PeerState) {
    if state.peer == next {
      return;
    }
    info!(room = %self.room(), from = ?state.peer, to = ?next, "peer state");
    state.peer = next;
    self.observers.emit(SessionEvent::PeerState(next));
  }

  fn set_channel_state(&self, state: &mut State, next: ChannelState) {
    if state.channel_state == next {
      return;
    }
    debug!(room = %self.room(), from = ?state.channel_state, to = ?next, "channel state");
    state.channel_state = next;
    self.observers.emit(SessionEvent::ChannelState(next));
  }

  fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
    let handle = tokio::spawn(task);
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.retain(|task| !task.is_finished());
      tasks.push(handle);
    }
  }

  fn abort_tasks(&self) {
    if let Ok(mut tasks) = self.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }
}

impl Drop for PeerSession {
  fn drop(&mut self) {
    self.abort_tasks();
  }
}

async fn pump_signals(session: Weak<PeerSession>, mut signals: mpsc::UnboundedReceiver<SignalFrame>) {
  while let Some(frame) = signals.recv().await {
    let Some(session) = session.upgrade() else { break };
    session.on_signal(frame).await;
  }
}

async fn pump_connection(
  session: Weak<PeerSession>,
  generation: u64,
  mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
  while let Some(event) = events.recv().await {
    let Some(session) = session.upgrade() else { break };
    session.on_connection_event(generation, event).await;
  }
}

async fn pump_channel(session: Weak<PeerSession>, generation: u64, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
  while let Some(event) = events.recv().await {
    let Some(session) = session.upgrade() else { break };
    session.on_channel_event(generation, event).await;
  }
}
