mod common;

use common::*;
use pairmesh::connection::TransportState;
use pairmesh::{
  DataFrame, GroupEvent, GroupSession, InitiatorRule, LocalHub, MemoryFileStore, OutgoingFile, PeerSession, PeerState,
  SessionConfig, SessionEvent, SignalFrame, SignalRoute, SignalingChannel,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn offers_from(frames: Vec<SignalFrame>, sender: &str) -> usize {
  frames
    .iter()
    .filter(|frame| frame.kind() == "offer" && frame.sender() == sender)
    .count()
}

async fn next_group_event(events: &mut mpsc::UnboundedReceiver<GroupEvent>) -> GroupEvent {
  tokio::time::timeout(Duration::from_secs(1), events.recv())
    .await
    .expect("timed out waiting for event")
    .expect("event stream ended")
}

#[tokio::test]
async fn opens_one_session_per_remote_member() {
  let hub = Arc::new(LocalHub::new());
  let connector = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());
  let mut inbox_2 = hub.subscribe("chat.2").await.unwrap();
  let mut inbox_3 = hub.subscribe("chat.3").await.unwrap();

  let group = GroupSession::new(
    "chat",
    "1",
    ["1", "2", "3"],
    deps(&hub, &connector, &store),
    SessionConfig::default(),
  );
  group.init().await.unwrap();
  settle().await;

  assert_eq!(group.peer_ids().await, vec!["2", "3"]);
  assert_eq!(group.peer("2").await.unwrap().room(), "chat.2");
  assert_eq!(group.peer("3").await.unwrap().room(), "chat.3");
  assert!(group.peer("1").await.is_none());
  assert_eq!(offers_from(drain(&mut inbox_2), "1"), 1);
  assert_eq!(offers_from(drain(&mut inbox_3), "1"), 1);
  assert_eq!(connector.count(), 2);

  // A second init keeps the existing sessions.
  group.init().await.unwrap();
  settle().await;
  assert_eq!(connector.count(), 2);
  assert!(drain(&mut inbox_2).is_empty());
}

#[tokio::test]
async fn every_member_gets_an_offer_on_init() {
  let hub = Arc::new(LocalHub::new());
  let connector = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());
  let mut inbox_1 = hub.subscribe("chat.1").await.unwrap();
  let mut inbox_3 = hub.subscribe("chat.3").await.unwrap();

  let group = GroupSession::new(
    "chat",
    "2",
    ["1", "2", "3"],
    deps(&hub, &connector, &store),
    SessionConfig::default(),
  );
  group.init().await.unwrap();
  settle().await;

  assert_eq!(offers_from(drain(&mut inbox_1), "2"), 1);
  assert_eq!(offers_from(drain(&mut inbox_3), "2"), 1);
  assert_eq!(connector.count(), 2);
  assert_eq!(
    group.peer_states().await,
    vec![
      ("1".to_string(), PeerState::Negotiating),
      ("3".to_string(), PeerState::Negotiating)
    ]
  );
}

/// Member "1" joins an empty room, so its offer reaches nobody. Member "2"
/// joins later and the pair still has to finish negotiating.
async fn lower_id_joins_first(config: SessionConfig) {
  let hub = Arc::new(LocalHub::new());
  let connector_1 = FakeConnector::new();
  let connector_2 = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());

  let group_1 = GroupSession::new("chat", "1", ["1", "2"], deps(&hub, &connector_1, &store), config.clone());
  group_1.init().await.unwrap();
  settle().await;
  let group_2 = GroupSession::new("chat", "2", ["1", "2"], deps(&hub, &connector_2, &store), config);
  group_2.init().await.unwrap();
  settle().await;

  // "1" sends its offer again, "2" drops its own connection and answers.
  assert_eq!(connector_1.count(), 1);
  assert_eq!(connector_1.get(0).remote_sdps(), vec!["answer-2"]);
  assert!(connector_2.get(0).is_closed());
  assert_eq!(connector_2.last().remote_sdps(), vec!["offer-1"]);
  assert_eq!(group_1.peer_states().await, vec![("2".to_string(), PeerState::Negotiating)]);
  assert_eq!(group_2.peer_states().await, vec![("1".to_string(), PeerState::Negotiating)]);

  group_1.close_all().await;
  group_2.close_all().await;
}

#[tokio::test]
async fn lower_id_joining_first_still_connects() {
  lower_id_joins_first(SessionConfig::default()).await;
}

#[tokio::test]
async fn lower_id_joining_first_still_connects_with_everyone_rule() {
  lower_id_joins_first(SessionConfig::default().with_initiator_rule(InitiatorRule::Everyone)).await;
}

#[tokio::test]
async fn two_members_meet_and_exchange_text() {
  let hub = Arc::new(LocalHub::new());
  let connector_1 = FakeConnector::new();
  let connector_2 = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());

  let group_1 = GroupSession::new(
    "team",
    "1",
    ["1", "2"],
    deps(&hub, &connector_1, &store),
    SessionConfig::default(),
  );
  let group_2 = GroupSession::new(
    "team",
    "2",
    ["1", "2"],
    deps(&hub, &connector_2, &store),
    SessionConfig::default(),
  );
  let mut events_2 = group_2.subscribe();
  group_2.init().await.unwrap();
  group_1.init().await.unwrap();
  settle().await;

  // Only the offer from "1" was heard; "2" answers it on a fresh connection.
  let conn_1 = connector_1.last();
  let conn_2 = connector_2.last();
  assert!(connector_2.get(0).is_closed());
  assert_eq!(conn_2.remote_sdps(), vec!["offer-1"]);
  assert_eq!(conn_1.remote_sdps(), vec!["answer-2"]);

  conn_1.set_state(TransportState::Connected);
  conn_2.set_state(TransportState::Connected);
  let chan_2 = conn_2.open_remote_channel("chat");
  let chan_1 = conn_1.channel(0).unwrap();
  chan_1.open();
  settle().await;

  assert_eq!(group_1.send_text(&json!({"text": "hello team"})).await, 1);
  for text in chan_1.sent() {
    chan_2.deliver(&text);
  }

  loop {
    let GroupEvent { peer_id, event } = next_group_event(&mut events_2).await;
    if let SessionEvent::Message(message) = event {
      assert_eq!(peer_id, "1");
      assert_eq!(message["text"], "hello team");
      break;
    }
  }

  group_1.close_all().await;
  group_2.close_all().await;
}

#[tokio::test]
async fn sends_count_only_open_peers() {
  let hub = Arc::new(LocalHub::new());
  let connector = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());
  store.insert("doc.txt", "doc");

  let group = GroupSession::new(
    "chat",
    "1",
    ["2", "3"],
    deps(&hub, &connector, &store),
    SessionConfig::default(),
  );
  group.init().await.unwrap();
  assert_eq!(group.send_text("nobody listening").await, 0);

  // Open the channel toward "2" only.
  let toward_2 = connector.get(0);
  toward_2.channel(0).unwrap().open();
  settle().await;

  assert_eq!(group.send_text("hi").await, 1);
  let file = OutgoingFile::new("doc.txt", "doc.txt", "text/plain");
  assert_eq!(group.send_file(&file, Some(2)).await, 1);
  // text, file-meta, two chunks of "ZG9j", file-end
  assert_eq!(toward_2.channel(0).unwrap().sent().len(), 5);
  assert!(connector.get(1).channel(0).unwrap().sent().is_empty());
}

#[tokio::test]
async fn file_fans_out_to_every_member() {
  let hub = Arc::new(LocalHub::new());
  let connector = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());
  store.insert("a.txt", "hello world");

  let group = GroupSession::new(
    "chat",
    "1",
    ["1", "2", "3"],
    deps(&hub, &connector, &store),
    SessionConfig::default(),
  );
  group.init().await.unwrap();
  let channels = vec![connector.get(0).channel(0).unwrap(), connector.get(1).channel(0).unwrap()];
  for channel in &channels {
    channel.open();
  }
  settle().await;

  let file = OutgoingFile::new("a.txt", "a.txt", "text/plain").with_transfer_id("t-a");
  assert_eq!(group.send_file(&file, Some(4)).await, 2);

  let receiver_store = Arc::new(MemoryFileStore::new());
  let receiver = PeerSession::open(
    SignalRoute::shared("scratch"),
    "2",
    deps(&hub, &FakeConnector::new(), &receiver_store),
    SessionConfig::default(),
  )
  .await
  .unwrap();
  let mut received = receiver.subscribe();
  for channel in &channels {
    let frames = channel.sent_frames();
    assert_eq!(frames.len(), 6);
    assert!(matches!(frames.first(), Some(DataFrame::FileMeta(meta)) if meta.size == 11));
    assert!(matches!(frames.last(), Some(DataFrame::FileEnd { .. })));
  }
  for text in channels[0].sent() {
    receiver.on_channel_message(&text).await;
  }

  match received.try_recv().unwrap() {
    SessionEvent::File(file) => assert_eq!(receiver_store.get(&file.path).unwrap(), b"hello world"),
    other => panic!("unexpected event {other:?}"),
  }
}

#[tokio::test]
async fn close_all_empties_the_room_and_silences_observers() {
  let hub = Arc::new(LocalHub::new());
  let connector = FakeConnector::new();
  let store = Arc::new(MemoryFileStore::new());

  let group = GroupSession::new(
    "chat",
    "1",
    ["1", "2", "3"],
    deps(&hub, &connector, &store),
    SessionConfig::default(),
  );
  let mut events = group.subscribe();
  group.init().await.unwrap();
  settle().await;
  let sessions = vec![group.peer("2").await.unwrap(), group.peer("3").await.unwrap()];

  group.close_all().await;
  group.close_all().await;

  assert!(group.peer_ids().await.is_empty());
  for session in &sessions {
    assert_eq!(session.state().await, PeerState::Closed);
  }
  assert!(connector.get(0).is_closed());
  assert!(connector.get(1).is_closed());

  drain(&mut events);
  hub.publish("chat.1", &answer_from("2", "late")).await.unwrap();
  settle().await;
  let tail = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap();
  assert!(tail.is_none());
}
