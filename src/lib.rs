//! Peer-to-peer sessions over WebRTC data channels.
//!
//! A [`PeerSession`] negotiates one connection through a [`SignalingChannel`]
//! and exchanges chat messages and chunked files over its `chat` data
//! channel. A [`GroupSession`] keeps one session per remote member of a room.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod group;
pub mod history;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod ws;

pub use config::{IceServer, InitiatorRule, SessionConfig};
pub use error::{Result, SessionError};
pub use event::{ReceivedFile, SessionEvent};
pub use frame::{DataFrame, FileMeta, SignalFrame};
pub use group::{GroupEvent, GroupSession};
pub use history::{JsonFileMessageLog, MemoryMessageLog, MessageLog};
pub use rtc::RtcConnector;
pub use session::{ChannelState, PeerSession, PeerState, SendOutcome, SessionDeps};
pub use signaling::{LocalHub, SignalRoute, SignalingChannel};
pub use store::{DirFileStore, FileStore, MemoryFileStore};
pub use transfer::OutgoingFile;
pub use ws::WsSignaling;
