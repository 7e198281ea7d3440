//! webrtc-rs implementation of the connection seam.

use crate::config::IceServer;
use crate::connection::{
  ChannelEvent, ChannelHandle, Connection, ConnectionEvent, ConnectionHandle, Connector, DataChannel, LocalStream,
  LocalTrack, MediaKind, RemoteStream, RemoteTrack, TransportState,
};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Default, Clone, Copy)]
pub struct RtcConnector;

#[async_trait]
impl Connector for RtcConnector {
  async fn connect(&self, ice_servers: &[IceServer]) -> Result<ConnectionHandle> {
    let pc = create_peer_connection(ice_servers).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    wire_connection_events(&pc, tx);
    Ok(ConnectionHandle {
      connection: Arc::new(RtcConnection { pc }),
      events: rx,
    })
  }
}

async fn create_peer_connection(ice_servers: &[IceServer]) -> Result<Arc<RTCPeerConnection>> {
  let mut media_engine = MediaEngine::default();
  media_engine.register_default_codecs()?;

  let mut registry = Registry::new();
  registry = register_default_interceptors(registry, &mut media_engine)?;

  let api = APIBuilder::new()
    .with_media_engine(media_engine)
    .with_interceptor_registry(registry)
    .build();

  let config = RTCConfiguration {
    ice_servers: ice_servers
      .iter()
      .map(|server| RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
      })
      .collect(),
    ..Default::default()
  };

  let pc = api.new_peer_connection(config).await?;
  Ok(Arc::new(pc))
}

fn wire_connection_events(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<ConnectionEvent>) {
  let ice_tx = tx.clone();
  pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
    let tx = ice_tx.clone();
    Box::pin(async move {
      if let Some(candidate) = candidate {
        match candidate.to_json() {
          Ok(init) => {
            let _ = tx.send(ConnectionEvent::IceCandidate(init));
          }
          Err(err) => debug!(error = %err, "skipping local candidate"),
        }
      }
    })
  }));

  let state_tx = tx.clone();
  pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
    let _ = state_tx.send(ConnectionEvent::StateChanged(transport_state(state)));
    Box::pin(async {})
  }));

  let dc_tx = tx.clone();
  pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
    let tx = dc_tx.clone();
    Box::pin(async move {
      let _ = tx.send(ConnectionEvent::DataChannel(wire_channel(dc)));
    })
  }));

  pc.on_track(Box::new(
    move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
      let _ = tx.send(ConnectionEvent::RemoteTrack(RemoteStream {
        track: Arc::new(RtcRemoteTrack { track }),
      }));
      Box::pin(async {})
    },
  ));
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
  match state {
    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
    RTCPeerConnectionState::Connecting => TransportState::Connecting,
    RTCPeerConnectionState::Connected => TransportState::Connected,
    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
    RTCPeerConnectionState::Failed => TransportState::Failed,
    RTCPeerConnectionState::Closed => TransportState::Closed,
  }
}

fn wire_channel(dc: Arc<RTCDataChannel>) -> ChannelHandle {
  let (tx, rx) = mpsc::unbounded_channel();

  let open_tx = tx.clone();
  dc.on_open(Box::new(move || {
    let _ = open_tx.send(ChannelEvent::Open);
    Box::pin(async {})
  }));

  let msg_tx = tx.clone();
  let label = dc.label().to_string();
  dc.on_message(Box::new(move |msg: DataChannelMessage| {
    match String::from_utf8(msg.data.to_vec()) {
      Ok(text) => {
        let _ = msg_tx.send(ChannelEvent::Message(text));
      }
      Err(_) => debug!(channel = %label, bytes = msg.data.len(), "dropping non-text data channel message"),
    }
    Box::pin(async {})
  }));

  dc.on_close(Box::new(move || {
    let _ = tx.send(ChannelEvent::Closed);
    Box::pin(async {})
  }));

  ChannelHandle {
    channel: Arc::new(RtcDataChannel { dc }),
    events: rx,
  }
}

struct RtcConnection {
  pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl Connection for RtcConnection {
  async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
    let dc = self
      .pc
      .create_data_channel(
        label,
        Some(RTCDataChannelInit {
          ordered: Some(true),
          ..Default::default()
        }),
      )
      .await?;
    Ok(wire_channel(dc))
  }

  async fn create_offer(&self) -> Result<RTCSessionDescription> {
    Ok(self.pc.create_offer(None).await?)
  }

  async fn create_answer(&self) -> Result<RTCSessionDescription> {
    Ok(self.pc.create_answer(None).await?)
  }

  async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
    Ok(self.pc.set_local_description(desc).await?)
  }

  async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
    Ok(self.pc.set_remote_description(desc).await?)
  }

  async fn local_description(&self) -> Option<RTCSessionDescription> {
    self.pc.local_description().await
  }

  async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
    Ok(self.pc.add_ice_candidate(candidate).await?)
  }

  async fn add_local_stream(&self, stream_id: &str) -> Result<LocalStream> {
    let audio = Arc::new(TrackLocalStaticSample::new(
      RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        ..Default::default()
      },
      format!("{stream_id}-audio"),
      stream_id.to_owned(),
    ));
    let video = Arc::new(TrackLocalStaticSample::new(
      RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        ..Default::default()
      },
      format!("{stream_id}-video"),
      stream_id.to_owned(),
    ));

    for track in [
      Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>,
      Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>,
    ] {
      let sender = self.pc.add_track(track).await?;
      // RTCP has to be drained for the interceptors to work.
      tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
      });
    }

    Ok(LocalStream {
      audio: Arc::new(RtcLocalTrack {
        kind: MediaKind::Audio,
        track: audio,
      }),
      video: Arc::new(RtcLocalTrack {
        kind: MediaKind::Video,
        track: video,
      }),
    })
  }

  async fn close(&self) -> Result<()> {
    Ok(self.pc.close().await?)
  }
}

struct RtcDataChannel {
  dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
  fn label(&self) -> String {
    self.dc.label().to_string()
  }

  fn is_open(&self) -> bool {
    self.dc.ready_state() == RTCDataChannelState::Open
  }

  async fn send_text(&self, text: String) -> Result<()> {
    self.dc.send_text(text).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    Ok(self.dc.close().await?)
  }
}

struct RtcLocalTrack {
  kind: MediaKind,
  track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl LocalTrack for RtcLocalTrack {
  fn kind(&self) -> MediaKind {
    self.kind
  }

  async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
    self
      .track
      .write_sample(&Sample {
        data,
        duration,
        ..Default::default()
      })
      .await?;
    Ok(())
  }
}

struct RtcRemoteTrack {
  track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for RtcRemoteTrack {
  fn id(&self) -> String {
    self.track.id()
  }

  fn stream_id(&self) -> String {
    self.track.stream_id()
  }

  fn kind(&self) -> MediaKind {
    match self.track.kind() {
      RTPCodecType::Audio => MediaKind::Audio,
      _ => MediaKind::Video,
    }
  }

  async fn read_payload(&self) -> Result<Bytes> {
    let (packet, _) = self.track.read_rtp().await?;
    Ok(packet.payload)
  }
}
