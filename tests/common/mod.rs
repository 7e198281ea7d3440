#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pairmesh::config::IceServer;
use pairmesh::connection::{
  ChannelEvent, ChannelHandle, Connection, ConnectionEvent, ConnectionHandle, Connector, DataChannel, LocalStream,
  LocalTrack, MediaKind, TransportState,
};
use pairmesh::{DataFrame, LocalHub, MemoryFileStore, Result, SessionDeps, SessionError, SessionEvent, SignalFrame};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub fn sdp(sdp_type: RTCSdpType, text: &str) -> RTCSessionDescription {
  let mut desc = RTCSessionDescription::default();
  desc.sdp_type = sdp_type;
  desc.sdp = text.to_string();
  desc
}

pub fn candidate(text: &str) -> RTCIceCandidateInit {
  RTCIceCandidateInit {
    candidate: text.to_string(),
    ..Default::default()
  }
}

pub fn offer_from(from: &str, text: &str) -> SignalFrame {
  SignalFrame::Offer {
    from: from.to_string(),
    data: sdp(RTCSdpType::Offer, text),
  }
}

pub fn answer_from(from: &str, text: &str) -> SignalFrame {
  SignalFrame::Answer {
    from: from.to_string(),
    data: sdp(RTCSdpType::Answer, text),
  }
}

pub fn ice_from(from: &str, text: &str) -> SignalFrame {
  SignalFrame::Ice {
    from: from.to_string(),
    data: candidate(text),
  }
}

/// Lets spawned pumps drain their queues.
pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(25)).await;
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
  tokio::time::timeout(Duration::from_secs(1), events.recv())
    .await
    .expect("timed out waiting for event")
    .expect("event stream ended")
}

pub fn drain<E>(events: &mut mpsc::UnboundedReceiver<E>) -> Vec<E> {
  let mut out = Vec::new();
  while let Ok(event) = events.try_recv() {
    out.push(event);
  }
  out
}

pub fn deps(hub: &Arc<LocalHub>, connector: &Arc<FakeConnector>, store: &Arc<MemoryFileStore>) -> SessionDeps {
  SessionDeps {
    signaling: hub.clone(),
    connector: connector.clone(),
    store: store.clone(),
  }
}

pub struct FakeChannel {
  label: String,
  open: AtomicBool,
  closed: AtomicBool,
  sent: Mutex<Vec<String>>,
  events: mpsc::UnboundedSender<ChannelEvent>,
}

impl FakeChannel {
  pub fn create(label: &str) -> (Arc<FakeChannel>, ChannelHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let channel = Arc::new(FakeChannel {
      label: label.to_string(),
      open: AtomicBool::new(false),
      closed: AtomicBool::new(false),
      sent: Mutex::new(Vec::new()),
      events: tx,
    });
    let handle = ChannelHandle {
      channel: channel.clone(),
      events: rx,
    };
    (channel, handle)
  }

  pub fn open(&self) {
    self.open.store(true, Ordering::SeqCst);
    let _ = self.events.send(ChannelEvent::Open);
  }

  pub fn deliver(&self, text: &str) {
    let _ = self.events.send(ChannelEvent::Message(text.to_string()));
  }

  pub fn sent(&self) -> Vec<String> {
    self.sent.lock().unwrap().clone()
  }

  pub fn sent_frames(&self) -> Vec<DataFrame> {
    self.sent().iter().map(|text| DataFrame::decode(text).unwrap()).collect()
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl DataChannel for FakeChannel {
  fn label(&self) -> String {
    self.label.clone()
  }

  fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst) && !self.is_closed()
  }

  async fn send_text(&self, text: String) -> Result<()> {
    if !self.is_open() {
      return Err(SessionError::ChannelNotReady);
    }
    self.sent.lock().unwrap().push(text);
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

struct FakeTrack {
  kind: MediaKind,
}

#[async_trait]
impl LocalTrack for FakeTrack {
  fn kind(&self) -> MediaKind {
    self.kind
  }

  async fn write_sample(&self, _data: Bytes, _duration: Duration) -> Result<()> {
    Ok(())
  }
}

pub struct FakeConnection {
  pub id: usize,
  events: mpsc::UnboundedSender<ConnectionEvent>,
  reject_remote: bool,
  channels: Mutex<Vec<Arc<FakeChannel>>>,
  remote: Mutex<Vec<RTCSessionDescription>>,
  local: Mutex<Option<RTCSessionDescription>>,
  candidates: Mutex<Vec<RTCIceCandidateInit>>,
  streams: AtomicUsize,
  closed: AtomicBool,
}

impl FakeConnection {
  pub fn set_state(&self, state: TransportState) {
    let _ = self.events.send(ConnectionEvent::StateChanged(state));
  }

  pub fn local_candidate(&self, text: &str) {
    let _ = self.events.send(ConnectionEvent::IceCandidate(candidate(text)));
  }

  /// Simulates the remote opening a channel toward us.
  pub fn open_remote_channel(&self, label: &str) -> Arc<FakeChannel> {
    let (channel, handle) = FakeChannel::create(label);
    channel.open.store(true, Ordering::SeqCst);
    let _ = self.events.send(ConnectionEvent::DataChannel(handle));
    channel
  }

  pub fn channel(&self, index: usize) -> Option<Arc<FakeChannel>> {
    self.channels.lock().unwrap().get(index).cloned()
  }

  pub fn remote_sdps(&self) -> Vec<String> {
    self.remote.lock().unwrap().iter().map(|desc| desc.sdp.clone()).collect()
  }

  pub fn candidates(&self) -> Vec<String> {
    self
      .candidates
      .lock()
      .unwrap()
      .iter()
      .map(|c| c.candidate.clone())
      .collect()
  }

  pub fn stream_count(&self) -> usize {
    self.streams.load(Ordering::SeqCst)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Connection for FakeConnection {
  async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
    let (channel, handle) = FakeChannel::create(label);
    self.channels.lock().unwrap().push(channel);
    Ok(handle)
  }

  async fn create_offer(&self) -> Result<RTCSessionDescription> {
    Ok(sdp(RTCSdpType::Offer, &format!("offer-{}", self.id)))
  }

  async fn create_answer(&self) -> Result<RTCSessionDescription> {
    if self.remote.lock().unwrap().is_empty() {
      return Err(SessionError::Negotiation("no remote offer".to_string()));
    }
    Ok(sdp(RTCSdpType::Answer, &format!("answer-{}", self.id)))
  }

  async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
    *self.local.lock().unwrap() = Some(desc);
    Ok(())
  }

  async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
    if self.reject_remote {
      return Err(SessionError::Negotiation("remote description rejected".to_string()));
    }
    self.remote.lock().unwrap().push(desc);
    Ok(())
  }

  async fn local_description(&self) -> Option<RTCSessionDescription> {
    self.local.lock().unwrap().clone()
  }

  async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
    self.candidates.lock().unwrap().push(candidate);
    Ok(())
  }

  async fn add_local_stream(&self, _stream_id: &str) -> Result<LocalStream> {
    self.streams.fetch_add(1, Ordering::SeqCst);
    Ok(LocalStream {
      audio: Arc::new(FakeTrack { kind: MediaKind::Audio }),
      video: Arc::new(FakeTrack { kind: MediaKind::Video }),
    })
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

/// Hands out [`FakeConnection`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeConnector {
  connections: Mutex<Vec<Arc<FakeConnection>>>,
  reject_remote: AtomicBool,
}

impl FakeConnector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn reject_remote_descriptions(&self) {
    self.reject_remote.store(true, Ordering::SeqCst);
  }

  pub fn count(&self) -> usize {
    self.connections.lock().unwrap().len()
  }

  pub fn get(&self, index: usize) -> Arc<FakeConnection> {
    self.connections.lock().unwrap()[index].clone()
  }

  pub fn last(&self) -> Arc<FakeConnection> {
    self.connections.lock().unwrap().last().cloned().expect("no connection created")
  }
}

#[async_trait]
impl Connector for FakeConnector {
  async fn connect(&self, _ice_servers: &[IceServer]) -> Result<ConnectionHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut connections = self.connections.lock().unwrap();
    let connection = Arc::new(FakeConnection {
      id: connections.len() + 1,
      events: tx,
      reject_remote: self.reject_remote.load(Ordering::SeqCst),
      channels: Mutex::new(Vec::new()),
      remote: Mutex::new(Vec::new()),
      local: Mutex::new(None),
      candidates: Mutex::new(Vec::new()),
      streams: AtomicUsize::new(0),
      closed: AtomicBool::new(false),
    });
    connections.push(connection.clone());
    Ok(ConnectionHandle {
      connection,
      events: rx,
    })
  }
}
