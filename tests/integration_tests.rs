//! End-to-end tests against an in-process fake SquirrelDB server.
//!
//! The fake server speaks the real wire protocol over a loopback TCP
//! listener, so these tests cover the handshake, request correlation,
//! change routing and subscription teardown paths.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use squirreldb::protocol::{
  build_frame, decode_message, encode_message, parse_frame_header, ChangeEvent, ClientMessage,
  Document, Encoding, MessageType, ServerMessage, FRAME_HEADER_LEN, MAGIC, PROTOCOL_VERSION,
};
use squirreldb::{ConnectOptions, Error, SquirrelDB};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

#[derive(Clone, Copy)]
enum ServerMode {
  Open,
  RequireToken(&'static str),
  VersionMismatch,
}

#[derive(Default)]
struct ServerState {
  connections: AtomicUsize,
  unsubscribes: AtomicUsize,
}

async fn spawn_server(mode: ServerMode) -> (SocketAddr, Arc<ServerState>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let state = Arc::new(ServerState::default());

  let accept_state = Arc::clone(&state);
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      accept_state.connections.fetch_add(1, Ordering::SeqCst);
      let conn_state = Arc::clone(&accept_state);
      tokio::spawn(async move {
        let _ = serve_connection(stream, conn_state, mode).await;
      });
    }
  });

  (addr, state)
}

fn fake_document(collection: &str, data: serde_json::Value) -> Document {
  Document {
    id: Uuid::new_v4(),
    collection: collection.to_string(),
    data,
    created_at: "2024-01-01T00:00:00Z".to_string(),
    updated_at: "2024-01-01T00:00:00Z".to_string(),
  }
}

async fn send_message(
  stream: &mut TcpStream,
  msg: &ServerMessage,
  encoding: Encoding,
) -> std::io::Result<()> {
  let payload = encode_message(msg, encoding).unwrap();
  let frame = build_frame(MessageType::Response, encoding, &payload);
  stream.write_all(&frame).await
}

async fn serve_connection(
  mut stream: TcpStream,
  state: Arc<ServerState>,
  mode: ServerMode,
) -> std::io::Result<()> {
  // Handshake: MAGIC | version | flags | token_len | token.
  let mut fixed = [0u8; 8];
  stream.read_exact(&mut fixed).await?;
  assert_eq!(&fixed[0..4], MAGIC);
  assert_eq!(fixed[4], PROTOCOL_VERSION);

  let token_len = u16::from_be_bytes([fixed[6], fixed[7]]) as usize;
  let mut token = vec![0u8; token_len];
  stream.read_exact(&mut token).await?;

  let (status, version) = match mode {
    ServerMode::Open => (0x00u8, PROTOCOL_VERSION),
    ServerMode::RequireToken(expected) if token == expected.as_bytes() => {
      (0x00u8, PROTOCOL_VERSION)
    }
    ServerMode::RequireToken(_) => (0x02u8, PROTOCOL_VERSION),
    ServerMode::VersionMismatch => (0x01u8, 0x02),
  };

  let mut reply = vec![status, version, 0x03];
  reply.extend_from_slice(Uuid::new_v4().as_bytes());
  stream.write_all(&reply).await?;
  if status != 0x00 {
    return Ok(());
  }

  loop {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (len, _msg_type, encoding) = parse_frame_header(&header).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let msg: ClientMessage = decode_message(&payload, encoding).unwrap();

    match msg {
      ClientMessage::Ping { id } => {
        send_message(&mut stream, &ServerMessage::Pong { id }, encoding).await?;
      }
      ClientMessage::Insert { id, collection, data } => {
        if data.get("__invalid").is_some() {
          let msg = ServerMessage::Error {
            id,
            error: "document rejected".to_string(),
          };
          send_message(&mut stream, &msg, encoding).await?;
        } else {
          let doc = fake_document(&collection, data);
          let msg = ServerMessage::Result {
            id,
            data: serde_json::to_value(&doc).unwrap(),
          };
          send_message(&mut stream, &msg, encoding).await?;
        }
      }
      ClientMessage::Update { id, collection, document_id, data } => {
        let mut doc = fake_document(&collection, data);
        doc.id = document_id;
        let msg = ServerMessage::Result {
          id,
          data: serde_json::to_value(&doc).unwrap(),
        };
        send_message(&mut stream, &msg, encoding).await?;
      }
      ClientMessage::Delete { id, collection, document_id } => {
        let mut doc = fake_document(&collection, json!({}));
        doc.id = document_id;
        let msg = ServerMessage::Result {
          id,
          data: serde_json::to_value(&doc).unwrap(),
        };
        send_message(&mut stream, &msg, encoding).await?;
      }
      ClientMessage::Query { id, query } => {
        if query.contains("boom") {
          let msg = ServerMessage::Error {
            id,
            error: "predicate failed".to_string(),
          };
          send_message(&mut stream, &msg, encoding).await?;
        } else if query.contains("false") {
          let msg = ServerMessage::Result {
            id,
            data: json!([]),
          };
          send_message(&mut stream, &msg, encoding).await?;
        } else {
          let doc = fake_document("users", json!({"name": "Alice"}));
          let msg = ServerMessage::Result {
            id,
            data: json!([serde_json::to_value(&doc).unwrap()]),
          };
          send_message(&mut stream, &msg, encoding).await?;
        }
      }
      ClientMessage::Subscribe { id, query } => {
        send_message(
          &mut stream,
          &ServerMessage::Subscribed { id: id.clone() },
          encoding,
        )
        .await?;

        for n in 0..3 {
          let change = ChangeEvent::Insert {
            new: fake_document("users", json!({"n": n})),
          };
          let msg = ServerMessage::Change {
            id: id.clone(),
            change,
          };
          send_message(&mut stream, &msg, encoding).await?;
        }

        // A subscription to this marker collection simulates the server
        // dropping the connection mid-stream.
        if query.contains("flaky") {
          return Ok(());
        }
      }
      ClientMessage::Unsubscribe { id } => {
        state.unsubscribes.fetch_add(1, Ordering::SeqCst);
        send_message(&mut stream, &ServerMessage::Unsubscribed { id }, encoding).await?;
      }
      ClientMessage::ListCollections { id } => {
        let msg = ServerMessage::Result {
          id,
          data: json!(["users", "posts"]),
        };
        send_message(&mut stream, &msg, encoding).await?;
      }
    }
  }
}

#[tokio::test]
async fn test_insert_returns_id_and_preserves_fields() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let doc = client
    .table("users")
    .insert(json!({"name": "Alice", "email": "alice@example.com"}))
    .await
    .unwrap();

  assert!(!doc.id.is_nil());
  assert_eq!(doc.collection, "users");
  assert_eq!(doc.data["name"], "Alice");
  assert_eq!(doc.data["email"], "alice@example.com");
}

#[tokio::test]
async fn test_end_to_end_with_auth_token() {
  let (addr, _state) = spawn_server(ServerMode::RequireToken("t")).await;

  let opts = ConnectOptions::new("127.0.0.1", addr.port()).with_auth("t");
  let client = SquirrelDB::connect_with_options(opts).await.unwrap();

  let doc = client
    .table("users")
    .insert(json!({"name": "Alice", "email": "alice@example.com"}))
    .await
    .unwrap();

  assert!(!doc.id.is_nil());
  assert_eq!(doc.data["name"], "Alice");
}

#[tokio::test]
async fn test_rejected_token_fails_handshake() {
  let (addr, _state) = spawn_server(ServerMode::RequireToken("t")).await;

  let opts = ConnectOptions::new("127.0.0.1", addr.port()).with_auth("wrong");
  let err = SquirrelDB::connect_with_options(opts).await.unwrap_err();
  assert!(matches!(err, Error::AuthFailed));
}

#[tokio::test]
async fn test_version_mismatch_reported() {
  let (addr, _state) = spawn_server(ServerMode::VersionMismatch).await;

  let err = SquirrelDB::connect(&addr.to_string()).await.unwrap_err();
  match err {
    Error::VersionMismatch { server, client } => {
      assert_eq!(server, 0x02);
      assert_eq!(client, PROTOCOL_VERSION);
    }
    other => panic!("Expected VersionMismatch, got {:?}", other),
  }
}

#[tokio::test]
async fn test_options_construction_performs_no_io() {
  let (addr, state) = spawn_server(ServerMode::Open).await;

  let opts = ConnectOptions::new("127.0.0.1", addr.port()).with_auth("t");
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  assert_eq!(state.connections.load(Ordering::SeqCst), 0);

  let _client = SquirrelDB::connect_with_options(opts).await.unwrap();
  assert_eq!(state.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_table_handles_are_equivalent() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let first = client.table("users");
  let second = client.table("users");
  assert_eq!(first.name(), second.name());

  let a = first.insert(json!({"n": 1})).await.unwrap();
  let b = second.insert(json!({"n": 2})).await.unwrap();
  assert_eq!(a.collection, b.collection);
}

#[tokio::test]
async fn test_filter_matching_nothing_returns_empty_vec() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let docs = client
    .table("users")
    .filter("u => false")
    .run()
    .await
    .unwrap();
  assert!(docs.is_empty());
}

#[tokio::test]
async fn test_filter_returns_documents() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let docs = client
    .table("users")
    .filter("u => u.name === 'Alice'")
    .run()
    .await
    .unwrap();
  assert_eq!(docs.len(), 1);
  assert_eq!(docs[0].data["name"], "Alice");
}

#[tokio::test]
async fn test_query_error_surfaces_as_query_variant() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let err = client
    .table("users")
    .filter("u => boom()")
    .run()
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Query(_)));
}

#[tokio::test]
async fn test_insert_rejection_surfaces_as_validation() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let err = client
    .table("users")
    .insert(json!({"__invalid": true}))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_update_and_delete_roundtrip() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();
  let users = client.table("users");

  let doc = users.insert(json!({"name": "Bob"})).await.unwrap();
  let updated = users.update(doc.id, json!({"name": "Bobby"})).await.unwrap();
  assert_eq!(updated.id, doc.id);
  assert_eq!(updated.data["name"], "Bobby");

  let deleted = users.delete(doc.id).await.unwrap();
  assert_eq!(deleted.id, doc.id);
}

#[tokio::test]
async fn test_list_collections_and_ping() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  client.ping().await.unwrap();
  let collections = client.list_collections().await.unwrap();
  assert_eq!(collections, vec!["users", "posts"]);
}

#[tokio::test]
async fn test_changes_yields_events_in_order() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let mut sub = client.table("users").changes().await.unwrap();
  for expected in 0..3 {
    let event = sub.next().await.unwrap().unwrap();
    match event {
      ChangeEvent::Insert { new } => assert_eq!(new.data["n"], expected),
      other => panic!("Expected Insert, got {:?}", other),
    }
  }
}

#[tokio::test]
async fn test_dropping_subscription_unsubscribes_exactly_once() {
  let (addr, state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let mut sub = client.table("users").changes().await.unwrap();
  let _first = sub.next().await.unwrap().unwrap();
  drop(sub);

  // Ping sequences after the queued unsubscribe frame on the same socket.
  client.ping().await.unwrap();
  assert_eq!(state.unsubscribes.load(Ordering::SeqCst), 1);

  client.ping().await.unwrap();
  assert_eq!(state.unsubscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_explicit_unsubscribe_releases_once() {
  let (addr, state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let sub = client.table("users").changes().await.unwrap();
  sub.unsubscribe();

  client.ping().await.unwrap();
  assert_eq!(state.unsubscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_interrupted_stream_terminates_with_error() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let mut sub = client.table("flaky").changes().await.unwrap();

  // Drain the events sent before the server hangs up.
  let mut events = 0;
  let outcome = loop {
    match sub.next().await {
      Some(Ok(_)) => events += 1,
      Some(Err(e)) => break Some(e),
      None => break None,
    }
  };

  assert_eq!(events, 3);
  match outcome {
    Some(Error::Stream(_)) => {}
    other => panic!("Expected terminating stream error, got {:?}", other),
  }
  assert!(sub.next().await.is_none());
}

#[tokio::test]
async fn test_subscription_implements_stream() {
  use futures::StreamExt;

  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  let sub = client.table("users").changes().await.unwrap();
  let events: Vec<_> = sub.take(3).collect().await;
  assert_eq!(events.len(), 3);
  assert!(events.iter().all(|e| e.is_ok()));
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
  let (addr, _state) = spawn_server(ServerMode::Open).await;
  let client = SquirrelDB::connect(&addr.to_string()).await.unwrap();

  client.ping().await.unwrap();
  client.close();

  let err = client.ping().await.unwrap_err();
  assert!(matches!(err, Error::ChannelClosed | Error::Connection(_)));
}
