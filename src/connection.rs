//! The connection-object seam.
//!
//! A [`Connector`] builds one negotiated peer connection. Everything the
//! connection reports asynchronously (trickled candidates, state changes,
//! channels opened by the remote, inbound media) arrives as
//! [`ConnectionEvent`]s on the receiver returned next to it, so callbacks never
//! touch session state directly. [`crate::rtc::RtcConnector`] is the webrtc-rs
//! implementation.

use crate::config::IceServer;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
  New,
  Connecting,
  Connected,
  Disconnected,
  Failed,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
  Audio,
  Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
  Open,
  Message(String),
  Closed,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
  fn label(&self) -> String;
  fn is_open(&self) -> bool;
  async fn send_text(&self, text: String) -> Result<()>;
  async fn close(&self) -> Result<()>;
}

pub struct ChannelHandle {
  pub channel: Arc<dyn DataChannel>,
  pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Inbound media track. Payloads are raw RTP payloads in arrival order.
#[async_trait]
pub trait RemoteTrack: Send + Sync {
  fn id(&self) -> String;
  fn stream_id(&self) -> String;
  fn kind(&self) -> MediaKind;
  async fn read_payload(&self) -> Result<Bytes>;
}

#[derive(Clone)]
pub struct RemoteStream {
  pub track: Arc<dyn RemoteTrack>,
}

impl fmt::Debug for RemoteStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RemoteStream")
      .field("id", &self.track.id())
      .field("stream_id", &self.track.stream_id())
      .field("kind", &self.track.kind())
      .finish()
  }
}

/// Outbound media track fed by the host's capture pipeline.
#[async_trait]
pub trait LocalTrack: Send + Sync {
  fn kind(&self) -> MediaKind;
  async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()>;
}

#[derive(Clone)]
pub struct LocalStream {
  pub audio: Arc<dyn LocalTrack>,
  pub video: Arc<dyn LocalTrack>,
}

impl fmt::Debug for LocalStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalStream").finish_non_exhaustive()
  }
}

pub enum ConnectionEvent {
  IceCandidate(RTCIceCandidateInit),
  StateChanged(TransportState),
  DataChannel(ChannelHandle),
  RemoteTrack(RemoteStream),
}

#[async_trait]
pub trait Connection: Send + Sync {
  async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle>;
  async fn create_offer(&self) -> Result<RTCSessionDescription>;
  async fn create_answer(&self) -> Result<RTCSessionDescription>;
  async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
  async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
  async fn local_description(&self) -> Option<RTCSessionDescription>;
  async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
  /// Attaches one audio and one video track under `stream_id`.
  async fn add_local_stream(&self, stream_id: &str) -> Result<LocalStream>;
  async fn close(&self) -> Result<()>;
}

pub struct ConnectionHandle {
  pub connection: Arc<dyn Connection>,
  pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, ice_servers: &[IceServer]) -> Result<ConnectionHandle>;
}
