//! Websocket signaling over the Pusher channel protocol.
//!
//! Each signaling room maps to the private channel `private-<room>`; signal
//! frames are whispered as `client-signal` events. Channel authorization is
//! expected to be issued out of band and handed in as `auth`.

use crate::error::{Result, SessionError};
use crate::frame::SignalFrame;
use crate::signaling::SignalingChannel;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

pub const SIGNAL_EVENT: &str = "client-signal";
const CHANNEL_PREFIX: &str = "private-";

type Routes = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SignalFrame>>>>>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  event: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  channel: Option<String>,
  #[serde(default)]
  data: Value,
}

pub struct WsSignaling {
  outbound: mpsc::UnboundedSender<Message>,
  routes: Routes,
  auth: Option<String>,
  tasks: Vec<JoinHandle<()>>,
}

impl WsSignaling {
  pub async fn connect(url: &Url, auth: Option<String>) -> Result<Self> {
    debug!(url = %url, "connecting signaling websocket");
    let (ws_stream, _) = connect_async(url.as_str())
      .await
      .map_err(|err| SessionError::Signaling(format!("connect signaling websocket: {err}")))?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
      while let Some(msg) = outbound_rx.recv().await {
        if let Err(err) = ws_write.send(msg).await {
          warn!(error = %err, "signaling websocket write failed");
          break;
        }
      }
    });

    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    let reader_routes = routes.clone();
    let reader_outbound = outbound.clone();
    let reader = tokio::spawn(async move {
      while let Some(msg) = ws_read.next().await {
        let text = match msg {
          Ok(Message::Text(text)) => text,
          Ok(Message::Close(_)) => break,
          Ok(_) => continue,
          Err(err) => {
            warn!(error = %err, "signaling websocket read failed");
            break;
          }
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
          Ok(envelope) => envelope,
          Err(err) => {
            debug!(error = %err, "ignoring malformed signaling message");
            continue;
          }
        };
        handle_envelope(envelope, &reader_routes, &reader_outbound);
      }
      debug!("signaling websocket closed");
    });

    Ok(Self {
      outbound,
      routes,
      auth,
      tasks: vec![writer, reader],
    })
  }

  fn send(&self, envelope: &Envelope) -> Result<()> {
    let text = serde_json::to_string(envelope)?;
    self
      .outbound
      .send(Message::Text(text))
      .map_err(|_| SessionError::Signaling("signaling websocket closed".to_string()))
  }
}

impl Drop for WsSignaling {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
  async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<SignalFrame>> {
    let channel = channel_name(room);
    let (tx, rx) = mpsc::unbounded_channel();
    let first = {
      let mut routes = self
        .routes
        .lock()
        .map_err(|_| SessionError::Signaling("route table poisoned".to_string()))?;
      let subscribers = routes.entry(channel.clone()).or_default();
      subscribers.retain(|tx| !tx.is_closed());
      subscribers.push(tx);
      subscribers.len() == 1
    };
    if first {
      let mut data = json!({ "channel": channel });
      if let Some(auth) = &self.auth {
        data["auth"] = Value::String(auth.clone());
      }
      self.send(&Envelope {
        event: "pusher:subscribe".to_string(),
        channel: None,
        data,
      })?;
    }
    Ok(rx)
  }

  async fn publish(&self, room: &str, frame: &SignalFrame) -> Result<()> {
    self.send(&Envelope {
      event: SIGNAL_EVENT.to_string(),
      channel: Some(channel_name(room)),
      data: serde_json::to_value(frame)?,
    })
  }
}

fn channel_name(room: &str) -> String {
  format!("{CHANNEL_PREFIX}{room}")
}

fn handle_envelope(envelope: Envelope, routes: &Routes, outbound: &mpsc::UnboundedSender<Message>) {
  match envelope.event.as_str() {
    "pusher:ping" => {
      let _ = outbound.send(Message::Text(json!({"event": "pusher:pong", "data": {}}).to_string()));
    }
    "pusher:error" => warn!(data = %envelope.data, "signaling server error"),
    SIGNAL_EVENT => {
      let Some((channel, frame)) = decode_signal(envelope) else {
        return;
      };
      let Ok(mut routes) = routes.lock() else {
        return;
      };
      if let Some(subscribers) = routes.get_mut(&channel) {
        subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        if subscribers.is_empty() {
          routes.remove(&channel);
          let _ = outbound.send(Message::Text(
            json!({"event": "pusher:unsubscribe", "data": {"channel": channel}}).to_string(),
          ));
        }
      }
    }
    other => trace!(event = other, "signaling event"),
  }
}

/// Pusher delivers event data either as an object or as a JSON string.
fn decode_signal(envelope: Envelope) -> Option<(String, SignalFrame)> {
  let channel = envelope.channel?;
  let data = match envelope.data {
    Value::String(text) => match serde_json::from_str(&text) {
      Ok(value) => value,
      Err(err) => {
        debug!(channel = %channel, error = %err, "ignoring unparsable signal");
        return None;
      }
    },
    value => value,
  };
  match SignalFrame::decode(data) {
    Ok(frame) => Some((channel, frame)),
    Err(err) => {
      debug!(channel = %channel, error = %err, "ignoring unrecognized signal");
      None
    }
  }
}

/// Builds the Pusher websocket URL for `endpoint`, accepting http(s) or
/// ws(s) schemes.
pub fn build_ws_url(endpoint: &str, app_key: &str) -> Result<Url> {
  let mut url = Url::parse(endpoint).map_err(|err| SessionError::Signaling(format!("invalid endpoint: {err}")))?;
  let scheme = match url.scheme() {
    "https" | "wss" => "wss",
    "http" | "ws" => "ws",
    other => return Err(SessionError::Signaling(format!("unsupported endpoint scheme: {other}"))),
  };
  url
    .set_scheme(scheme)
    .map_err(|_| SessionError::Signaling("invalid endpoint scheme".to_string()))?;
  url.set_path(&format!("/app/{app_key}"));
  url.set_query(Some(&format!(
    "protocol=7&client=pairmesh&version={}",
    env!("CARGO_PKG_VERSION")
  )));
  url.set_fragment(None);
  Ok(url)
}
