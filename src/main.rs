use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pairmesh::config::DATA_CHANNEL_LABEL;
use pairmesh::ws::build_ws_url;
use pairmesh::{
  DirFileStore, GroupEvent, GroupSession, IceServer, JsonFileMessageLog, MessageLog, OutgoingFile, RtcConnector,
  SessionConfig, SessionDeps, SessionEvent, WsSignaling,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_ENDPOINT: &str = "wss://ws-mt1.pusher.com";
// webrtc-rs caps a data channel message at 64 KiB, so the encoded chunk plus
// the frame envelope has to stay well under that.
const MAX_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Parser, Debug)]
#[command(name = "pairmesh")]
#[command(about = "P2P chat and file sharing over WebRTC data channels")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Join a room and chat with every other member
  Chat {
    #[arg(value_name = "ROOM", help = "Room name shared by all members")]
    room: String,
    #[arg(long, value_name = "ID", help = "Local user id")]
    user: String,
    #[arg(
      long = "members",
      value_name = "IDS",
      value_delimiter = ',',
      required = true,
      help = "Comma separated member ids (the local id may be included)"
    )]
    members: Vec<String>,
    #[arg(long, env = "PAIRMESH_ENDPOINT", value_name = "URL", help = "Override signaling endpoint")]
    endpoint: Option<String>,
    #[arg(long, env = "PAIRMESH_APP_KEY", value_name = "KEY", help = "Signaling application key")]
    app_key: String,
    #[arg(long, env = "PAIRMESH_AUTH", value_name = "TOKEN", help = "Channel authorization token")]
    auth: Option<String>,
    #[arg(long, env = "PAIRMESH_ICE_SERVERS", value_name = "URLS", help = "Comma separated STUN/TURN urls")]
    ice_servers: Option<String>,
    #[arg(long, default_value = ".", value_name = "DIR", help = "Directory for received files")]
    output_dir: PathBuf,
    #[arg(long, default_value = ".pairmesh/history", value_name = "DIR", help = "Message cache directory")]
    history_dir: PathBuf,
    #[arg(long, default_value_t = MAX_CHUNK_SIZE, value_name = "BYTES", help = "Encoded chunk size for files")]
    chunk_size: usize,
  },
  /// Print messages cached for a room, newest first
  History {
    #[arg(value_name = "ROOM")]
    room: String,
    #[arg(long, default_value = ".pairmesh/history", value_name = "DIR", help = "Message cache directory")]
    history_dir: PathBuf,
    #[arg(long, value_name = "N", help = "Only print the newest N messages")]
    limit: Option<usize>,
  },
}

struct ChatOptions {
  room: String,
  user: String,
  members: Vec<String>,
  endpoint: Option<String>,
  app_key: String,
  auth: Option<String>,
  ice_servers: Option<String>,
  output_dir: PathBuf,
  history_dir: PathBuf,
  chunk_size: usize,
}

enum Input {
  Text(String),
  SendFile(PathBuf),
  Peers,
  Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pairmesh=info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  match cli.command {
    Command::Chat {
      room,
      user,
      members,
      endpoint,
      app_key,
      auth,
      ice_servers,
      output_dir,
      history_dir,
      chunk_size,
    } => {
      run_chat(ChatOptions {
        room,
        user,
        members,
        endpoint,
        app_key,
        auth,
        ice_servers,
        output_dir,
        history_dir,
        chunk_size,
      })
      .await
    }
    Command::History {
      room,
      history_dir,
      limit,
    } => run_history(&room, &history_dir, limit).await,
  }
}

async fn run_chat(opts: ChatOptions) -> Result<()> {
  if opts.chunk_size == 0 || opts.chunk_size > MAX_CHUNK_SIZE {
    return Err(anyhow!("chunk size must be between 1 and {MAX_CHUNK_SIZE}"));
  }
  let endpoint = opts.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
  let ws_url = build_ws_url(endpoint, &opts.app_key).context("build signaling url")?;
  log_line("[room] id", &opts.room);
  log_line("[ws] connecting", ws_url.as_str());
  let signaling = WsSignaling::connect(&ws_url, opts.auth.clone())
    .await
    .context("connect signaling")?;

  let mut config = SessionConfig::default().with_chunk_size(opts.chunk_size);
  if let Some(list) = opts.ice_servers.as_deref() {
    config = config.with_ice_servers(IceServer::parse_list(list));
  }
  let deps = SessionDeps {
    signaling: Arc::new(signaling),
    connector: Arc::new(RtcConnector),
    store: Arc::new(DirFileStore::new(&opts.output_dir)),
  };

  let group = GroupSession::new(&opts.room, &opts.user, opts.members.clone(), deps, config);
  if group.members().next().is_none() {
    return Err(anyhow!("no other members in room {}", opts.room));
  }
  let mut events = group.subscribe();
  group.init().await.context("open peer sessions")?;
  log_line(
    "[room] members",
    &group.members().collect::<Vec<_>>().join(", "),
  );
  log_line("[chat] ready", "type a message, /send <path>, /peers or /quit");

  let log = JsonFileMessageLog::new(&opts.history_dir);
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      event = events.recv() => {
        let Some(event) = event else { break };
        if let Err(err) = handle_event(&log, &opts.room, event).await {
          log_line("[chat] error", &format!("{err:#}"));
        }
      }
      line = lines.next_line() => {
        let Some(line) = line.context("read stdin")? else { break };
        let Some(input) = parse_input(&line) else { continue };
        match input {
          Input::Quit => break,
          Input::Peers => {
            for (id, state) in group.peer_states().await {
              log_line(&format!("[peer] {id}"), &format!("{state:?}"));
            }
          }
          Input::Text(text) => {
            let message = json!({
              "from": opts.user,
              "text": text,
              "sentAt": chrono::Utc::now().to_rfc3339(),
            });
            let sent = group.send_text(&message).await;
            log_line("[send] text", &format!("delivered to {sent} peer(s)"));
            if let Err(err) = log.append(&opts.room, message).await {
              log_line("[chat] error", &format!("cache message: {err}"));
            }
          }
          Input::SendFile(path) => match outgoing_file(&path).await {
            Ok(file) => {
              let sent = group.send_file(&file, Some(opts.chunk_size)).await;
              log_line("[send] file", &format!("{} to {sent} peer(s)", file.name));
            }
            Err(err) => log_line("[send] error", &format!("{err:#}")),
          },
        }
      }
    }
  }

  group.close_all().await;
  log_line("[chat] closed", &opts.room);
  Ok(())
}

fn parse_input(line: &str) -> Option<Input> {
  let line = line.trim();
  if line.is_empty() {
    return None;
  }
  match line.split_once(' ') {
    Some(("/send", path)) if !path.trim().is_empty() => Some(Input::SendFile(PathBuf::from(path.trim()))),
    _ => match line {
      "/quit" | "/exit" => Some(Input::Quit),
      "/peers" => Some(Input::Peers),
      _ => Some(Input::Text(line.to_string())),
    },
  }
}

async fn outgoing_file(path: &Path) -> Result<OutgoingFile> {
  let path = tokio::fs::canonicalize(path)
    .await
    .with_context(|| format!("resolve {}", path.display()))?;
  let metadata = tokio::fs::metadata(&path).await.context("read file metadata")?;
  if !metadata.is_file() {
    return Err(anyhow!("not a file: {}", path.display()));
  }
  Ok(OutgoingFile::from_path(path))
}

async fn handle_event(log: &JsonFileMessageLog, room: &str, GroupEvent { peer_id, event }: GroupEvent) -> Result<()> {
  match event {
    SessionEvent::Message(message) => {
      log_line(&format!("[{peer_id}]"), &display_message(&message));
      log.append(room, message).await.context("cache message")?;
    }
    SessionEvent::File(file) => {
      log_line(
        &format!("[recv] {peer_id}"),
        &format!("{} ({}) -> {}", file.name, file.mime, file.path.display()),
      );
    }
    SessionEvent::PeerState(state) => log_line(&format!("[rtc] {peer_id}"), &format!("{state:?}")),
    SessionEvent::ChannelState(state) => {
      log_line(&format!("[{DATA_CHANNEL_LABEL}] {peer_id}"), &format!("{state:?}"))
    }
    SessionEvent::RemoteStream(stream) => log_line(&format!("[media] {peer_id}"), &format!("{stream:?}")),
  }
  Ok(())
}

fn display_message(message: &Value) -> String {
  match message.get("text").and_then(Value::as_str) {
    Some(text) => text.to_string(),
    None => message.to_string(),
  }
}

async fn run_history(room: &str, history_dir: &Path, limit: Option<usize>) -> Result<()> {
  let log = JsonFileMessageLog::new(history_dir);
  let messages = log.list(room).await.context("read message cache")?;
  if messages.is_empty() {
    log_line("[history] empty", room);
    return Ok(());
  }
  for message in messages.iter().take(limit.unwrap_or(usize::MAX)) {
    let from = message.get("from").and_then(Value::as_str).unwrap_or("?");
    let at = message.get("sentAt").and_then(Value::as_str).unwrap_or("");
    println!("{at} {from}: {}", display_message(message));
  }
  Ok(())
}

fn log_line(label: &str, value: &str) {
  let now = chrono::Utc::now().format("%H:%M:%S%.3f");
  println!("[{now}] {label}: {value}");
}
