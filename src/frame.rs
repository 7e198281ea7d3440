//! Wire frames.
//!
//! Two families travel on two different paths: [`SignalFrame`] goes over the
//! signaling room during negotiation, [`DataFrame`] goes over the negotiated
//! data channel afterwards. Both are JSON text.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// `{type, from, data}` on the signaling room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalFrame {
  Offer { from: String, data: RTCSessionDescription },
  Answer { from: String, data: RTCSessionDescription },
  Ice { from: String, data: RTCIceCandidateInit },
}

impl SignalFrame {
  pub fn sender(&self) -> &str {
    match self {
      SignalFrame::Offer { from, .. } | SignalFrame::Answer { from, .. } | SignalFrame::Ice { from, .. } => from,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      SignalFrame::Offer { .. } => "offer",
      SignalFrame::Answer { .. } => "answer",
      SignalFrame::Ice { .. } => "ice",
    }
  }

  pub fn decode(value: Value) -> Result<Self> {
    Ok(serde_json::from_value(value)?)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
  pub name: String,
  pub mime: String,
  pub size: u64,
  #[serde(rename = "transferId")]
  pub transfer_id: String,
}

/// `{kind, payload}` on the data channel.
///
/// Unknown kinds fail to decode and the whole payload is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum DataFrame {
  Text(Value),
  FileMeta(FileMeta),
  FileChunk {
    #[serde(rename = "transferId")]
    transfer_id: String,
    data: String,
  },
  FileEnd {
    #[serde(rename = "transferId")]
    transfer_id: String,
  },
}

impl DataFrame {
  pub fn decode(text: &str) -> Result<Self> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }
}
