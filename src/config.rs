use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_STUN_URL: &str = "stun:stun.cloudflare.com:3478";
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// One STUN or TURN entry handed to the connection object at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
  pub urls: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub credential: Option<String>,
}

impl IceServer {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      urls: vec![url.into()],
      username: None,
      credential: None,
    }
  }

  /// Parses a comma separated list such as
  /// `stun:stun.example.com:3478,turn:user:secret@turn.example.com:3478`.
  ///
  /// TURN entries may carry `user:credential@` ahead of the host.
  pub fn parse_list(value: &str) -> Vec<IceServer> {
    value
      .split(',')
      .map(str::trim)
      .filter(|entry| !entry.is_empty())
      .map(parse_entry)
      .collect()
  }
}

fn parse_entry(entry: &str) -> IceServer {
  let (scheme, rest) = match entry.split_once(':') {
    Some(parts) => parts,
    None => return IceServer::new(entry),
  };
  if !scheme.starts_with("turn") {
    return IceServer::new(entry);
  }
  match rest.rsplit_once('@') {
    Some((auth, host)) => {
      let (username, credential) = match auth.split_once(':') {
        Some((user, secret)) => (user.to_string(), Some(secret.to_string())),
        None => (auth.to_string(), None),
      };
      IceServer {
        urls: vec![format!("{scheme}:{host}")],
        username: Some(username),
        credential,
      }
    }
    None => IceServer::new(entry),
  }
}

/// Decides which side of a pair ends up sending the offer.
///
/// Signaling does not replay, so every member offers when it joins; a member
/// that joined earlier only learns about a late joiner from that joiner's
/// offer. When offers cross, the lower id keeps its offer and the higher id
/// answers it. `LowerIdCalls` also makes an idle lower id call back instead of
/// answering a higher id, so the lower id is always the caller. `Everyone`
/// answers whichever offer reaches an idle member first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitiatorRule {
  #[default]
  LowerIdCalls,
  Everyone,
}

impl InitiatorRule {
  /// Whether an idle `local_id` should answer an offer from `remote_id` or
  /// send its own offer back.
  pub fn answers_idle(self, local_id: &str, remote_id: &str) -> bool {
    match self {
      InitiatorRule::Everyone => true,
      InitiatorRule::LowerIdCalls => compare_ids(local_id, remote_id) != Ordering::Less,
    }
  }
}

/// Orders user ids numerically when both parse as integers, otherwise
/// lexicographically.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
  match (a.parse::<u64>(), b.parse::<u64>()) {
    (Ok(a), Ok(b)) => a.cmp(&b),
    _ => a.cmp(b),
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  pub ice_servers: Vec<IceServer>,
  pub chunk_size: usize,
  pub channel_label: String,
  pub initiator_rule: InitiatorRule,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      ice_servers: vec![IceServer::new(DEFAULT_STUN_URL)],
      chunk_size: DEFAULT_CHUNK_SIZE,
      channel_label: DATA_CHANNEL_LABEL.to_string(),
      initiator_rule: InitiatorRule::default(),
    }
  }
}

impl SessionConfig {
  pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
    if !servers.is_empty() {
      self.ice_servers = servers;
    }
    self
  }

  pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
    if chunk_size > 0 {
      self.chunk_size = chunk_size;
    }
    self
  }

  pub fn with_initiator_rule(mut self, rule: InitiatorRule) -> Self {
    self.initiator_rule = rule;
    self
  }
}
