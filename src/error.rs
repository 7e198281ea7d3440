use thiserror::Error;

/// Failures surfaced by the session layer.
///
/// Most of these never reach the host: inbound problems are logged and the
/// offending frame is dropped. They are returned only from operations the host
/// calls directly (`send_file` reading a missing path, a signaling publish that
/// could not be queued, and so on).
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("signaling error: {0}")]
  Signaling(String),
  #[error("negotiation error: {0}")]
  Negotiation(String),
  #[error("data channel is not open")]
  ChannelNotReady,
  #[error("decode error: {0}")]
  Decode(String),
  #[error("transport error: {0}")]
  Transport(String),
  #[error("file store error: {0}")]
  Store(#[from] std::io::Error),
  #[error("session is closed")]
  Closed,
}

impl From<serde_json::Error> for SessionError {
  fn from(err: serde_json::Error) -> Self {
    SessionError::Decode(err.to_string())
  }
}

impl From<base64::DecodeError> for SessionError {
  fn from(err: base64::DecodeError) -> Self {
    SessionError::Decode(err.to_string())
  }
}

impl From<webrtc::Error> for SessionError {
  fn from(err: webrtc::Error) -> Self {
    SessionError::Transport(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SessionError>;
