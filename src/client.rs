//! SquirrelDB connection, table handles and change subscriptions.
//!
//! A [`SquirrelDB`] owns one TCP connection. Requests are written by a
//! dedicated writer task and correlated with responses by id, so the client
//! can be shared by concurrent callers without external locking. Change
//! notifications are routed to per-subscription channels; a [`Subscription`]
//! releases its server-side resources when dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{
  build_frame, build_handshake, decode_message, encode_message, parse_frame_header,
  parse_handshake_response, ChangeEvent, ClientMessage, Document, Encoding, HandshakeStatus,
  MessageType, ProtocolFlags, ServerMessage, FRAME_HEADER_LEN, HANDSHAKE_RESPONSE_LEN,
  PROTOCOL_VERSION,
};
use crate::query::{Expression, QueryBuilder, SortDir};

/// Connection options for [`SquirrelDB::connect_with_options`].
///
/// Constructing options performs no I/O; the connection is only opened by
/// the connect call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
  pub host: String,
  pub port: u16,
  pub auth_token: Option<String>,
  pub use_messagepack: bool,
  pub json_fallback: bool,
}

impl ConnectOptions {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      auth_token: None,
      use_messagepack: true,
      json_fallback: true,
    }
  }

  /// Set the bearer token sent during the handshake.
  pub fn with_auth(mut self, token: impl Into<String>) -> Self {
    self.auth_token = Some(token.into());
    self
  }

  fn flags(&self) -> ProtocolFlags {
    ProtocolFlags {
      messagepack: self.use_messagepack,
      json_fallback: self.json_fallback,
    }
  }
}

/// State shared between the client handle and its background tasks.
#[derive(Debug, Default)]
struct Shared {
  pending: Mutex<HashMap<String, oneshot::Sender<Result<ServerMessage>>>>,
  subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Result<ChangeEvent>>>>,
  closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Async TCP client for SquirrelDB.
#[derive(Debug)]
pub struct SquirrelDB {
  shared: Arc<Shared>,
  outgoing: mpsc::UnboundedSender<Vec<u8>>,
  session_id: Uuid,
  encoding: Encoding,
  next_id: AtomicU64,
  reader_task: JoinHandle<()>,
  writer_task: JoinHandle<()>,
}

impl SquirrelDB {
  /// Connect to a server at `"host:port"` with default options.
  pub async fn connect(addr: &str) -> Result<Self> {
    let (host, port) = addr
      .rsplit_once(':')
      .ok_or_else(|| Error::Connection(format!("invalid address: {}", addr)))?;
    let port: u16 = port
      .parse()
      .map_err(|_| Error::Connection(format!("invalid port in address: {}", addr)))?;
    Self::connect_with_options(ConnectOptions::new(host, port)).await
  }

  /// Connect and perform the protocol handshake.
  pub async fn connect_with_options(opts: ConnectOptions) -> Result<Self> {
    let addr = format!("{}:{}", opts.host, opts.port);
    let mut stream = TcpStream::connect(&addr)
      .await
      .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", addr, e)))?;

    let handshake = build_handshake(opts.auth_token.as_deref().unwrap_or(""), opts.flags());
    stream.write_all(&handshake).await?;

    let mut buf = [0u8; HANDSHAKE_RESPONSE_LEN];
    stream.read_exact(&mut buf).await?;
    let reply = parse_handshake_response(&buf)?;

    match reply.status {
      HandshakeStatus::Success => {}
      HandshakeStatus::VersionMismatch => {
        return Err(Error::VersionMismatch {
          server: reply.version,
          client: PROTOCOL_VERSION,
        })
      }
      HandshakeStatus::AuthFailed => return Err(Error::AuthFailed),
    }

    let encoding = if reply.flags.messagepack {
      Encoding::MessagePack
    } else {
      Encoding::Json
    };
    debug!(session_id = %reply.session_id, ?encoding, "connected to {}", addr);

    let (read_half, write_half) = stream.into_split();
    let shared = Arc::new(Shared::default());
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

    let writer_task = tokio::spawn(write_loop(write_half, outgoing_rx));
    let reader_task = tokio::spawn(receive_loop(read_half, Arc::clone(&shared)));

    Ok(Self {
      shared,
      outgoing,
      session_id: reply.session_id,
      encoding,
      next_id: AtomicU64::new(0),
      reader_task,
      writer_task,
    })
  }

  /// The session id assigned by the server during the handshake.
  pub fn session_id(&self) -> Uuid {
    self.session_id
  }

  /// A handle bound to the named collection.
  ///
  /// Purely local; the collection is not validated until first use.
  pub fn table(&self, name: impl Into<String>) -> Table<'_> {
    Table {
      client: self,
      name: name.into(),
    }
  }

  /// Ping the server.
  pub async fn ping(&self) -> Result<()> {
    let id = self.next_request_id();
    match self.request(ClientMessage::Ping { id }).await? {
      ServerMessage::Pong { .. } => Ok(()),
      ServerMessage::Error { error, .. } => Err(Error::Server(error)),
      other => Err(Error::Server(format!("unexpected response: {:?}", other))),
    }
  }

  /// Execute a query and return the raw result value.
  pub async fn query_raw(&self, query: &str) -> Result<serde_json::Value> {
    let id = self.next_request_id();
    let msg = ClientMessage::Query {
      id,
      query: query.to_string(),
    };
    match self.request(msg).await? {
      ServerMessage::Result { data, .. } => Ok(data),
      ServerMessage::Error { error, .. } => Err(Error::Query(error)),
      other => Err(Error::Server(format!("unexpected response: {:?}", other))),
    }
  }

  /// Execute a query and return the matching documents.
  ///
  /// A query that matches nothing returns an empty vec, not an error.
  pub async fn query(&self, query: &str) -> Result<Vec<Document>> {
    let data = self.query_raw(query).await?;
    Ok(serde_json::from_value(data)?)
  }

  /// Insert a document into a collection.
  ///
  /// Returns the stored document with its server-assigned id.
  pub async fn insert(
    &self,
    collection: &str,
    data: serde_json::Value,
  ) -> Result<Document> {
    let id = self.next_request_id();
    let msg = ClientMessage::Insert {
      id,
      collection: collection.to_string(),
      data,
    };
    self.document_request(msg).await
  }

  /// Update a document by id.
  pub async fn update(
    &self,
    collection: &str,
    document_id: Uuid,
    data: serde_json::Value,
  ) -> Result<Document> {
    let id = self.next_request_id();
    let msg = ClientMessage::Update {
      id,
      collection: collection.to_string(),
      document_id,
      data,
    };
    self.document_request(msg).await
  }

  /// Delete a document by id. Returns the deleted document.
  pub async fn delete(&self, collection: &str, document_id: Uuid) -> Result<Document> {
    let id = self.next_request_id();
    let msg = ClientMessage::Delete {
      id,
      collection: collection.to_string(),
      document_id,
    };
    self.document_request(msg).await
  }

  /// List all collections.
  pub async fn list_collections(&self) -> Result<Vec<String>> {
    let id = self.next_request_id();
    match self.request(ClientMessage::ListCollections { id }).await? {
      ServerMessage::Result { data, .. } => Ok(serde_json::from_value(data)?),
      ServerMessage::Error { error, .. } => Err(Error::Server(error)),
      other => Err(Error::Server(format!("unexpected response: {:?}", other))),
    }
  }

  /// Subscribe to a change feed query, e.g. `db.table("users").changes()`.
  pub async fn subscribe(&self, query: &str) -> Result<Subscription> {
    let sub_id = self.next_request_id();
    let (tx, rx) = mpsc::unbounded_channel();

    // Register before the ack so no early change notification is dropped.
    lock(&self.shared.subscriptions).insert(sub_id.clone(), tx);

    let msg = ClientMessage::Subscribe {
      id: sub_id.clone(),
      query: query.to_string(),
    };
    match self.request(msg).await {
      Ok(ServerMessage::Subscribed { .. }) => Ok(Subscription {
        id: sub_id,
        rx,
        outgoing: self.outgoing.clone(),
        shared: Arc::clone(&self.shared),
        encoding: self.encoding,
        active: true,
      }),
      Ok(ServerMessage::Error { error, .. }) => {
        lock(&self.shared.subscriptions).remove(&sub_id);
        Err(Error::Query(error))
      }
      Ok(other) => {
        lock(&self.shared.subscriptions).remove(&sub_id);
        Err(Error::Server(format!("unexpected response: {:?}", other)))
      }
      Err(e) => {
        lock(&self.shared.subscriptions).remove(&sub_id);
        Err(e)
      }
    }
  }

  /// Close the connection, failing all in-flight requests.
  pub fn close(&self) {
    self.shared.closed.store(true, Ordering::SeqCst);
    for (_, tx) in lock(&self.shared.pending).drain() {
      let _ = tx.send(Err(Error::ChannelClosed));
    }
    lock(&self.shared.subscriptions).clear();
    self.reader_task.abort();
    self.writer_task.abort();
  }

  async fn document_request(&self, msg: ClientMessage) -> Result<Document> {
    match self.request(msg).await? {
      ServerMessage::Result { data, .. } => Ok(serde_json::from_value(data)?),
      ServerMessage::Error { error, .. } => Err(Error::Validation(error)),
      other => Err(Error::Server(format!("unexpected response: {:?}", other))),
    }
  }

  async fn request(&self, msg: ClientMessage) -> Result<ServerMessage> {
    let id = msg.request_id().to_string();
    let (tx, rx) = oneshot::channel();
    lock(&self.shared.pending).insert(id.clone(), tx);

    if let Err(e) = self.send(&msg) {
      lock(&self.shared.pending).remove(&id);
      return Err(e);
    }

    match rx.await {
      Ok(result) => result,
      Err(_) => Err(Error::ChannelClosed),
    }
  }

  fn send(&self, msg: &ClientMessage) -> Result<()> {
    if self.shared.closed.load(Ordering::SeqCst) {
      return Err(Error::ChannelClosed);
    }
    let payload = encode_message(msg, self.encoding)?;
    let frame = build_frame(MessageType::Request, self.encoding, &payload);
    self
      .outgoing
      .send(frame)
      .map_err(|_| Error::ChannelClosed)
  }

  fn next_request_id(&self) -> String {
    (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
  }
}

impl Drop for SquirrelDB {
  fn drop(&mut self) {
    self.reader_task.abort();
    self.writer_task.abort();
  }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
  while let Some(frame) = rx.recv().await {
    if let Err(e) = writer.write_all(&frame).await {
      warn!(error = %e, "write failed");
      break;
    }
    if let Err(e) = writer.flush().await {
      warn!(error = %e, "flush failed");
      break;
    }
  }
}

async fn receive_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
  let reason = match read_frames(&mut reader, &shared).await {
    Ok(()) => "connection closed".to_string(),
    Err(e) => e.to_string(),
  };

  if !shared.closed.load(Ordering::SeqCst) {
    warn!(%reason, "receive loop ended");
  }

  let pending: Vec<_> = lock(&shared.pending).drain().collect();
  for (_, tx) in pending {
    let _ = tx.send(Err(Error::Connection(reason.clone())));
  }

  // Surface the interruption to every live subscription, then drop the
  // senders so the streams terminate instead of stalling.
  let subscriptions: Vec<_> = lock(&shared.subscriptions).drain().collect();
  for (_, tx) in subscriptions {
    let _ = tx.send(Err(Error::Stream(reason.clone())));
  }
}

async fn read_frames(reader: &mut OwnedReadHalf, shared: &Shared) -> Result<()> {
  loop {
    let mut header = [0u8; FRAME_HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
      if e.kind() == std::io::ErrorKind::UnexpectedEof {
        return Ok(());
      }
      return Err(e.into());
    }
    let (payload_len, _msg_type, encoding) = parse_frame_header(&header)?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    let msg: ServerMessage = decode_message(&payload, encoding)?;
    dispatch(shared, msg);
  }
}

fn dispatch(shared: &Shared, msg: ServerMessage) {
  match msg {
    ServerMessage::Change { id, change } => {
      let subscriptions = lock(&shared.subscriptions);
      match subscriptions.get(&id) {
        Some(tx) => {
          let _ = tx.send(Ok(change));
        }
        None => debug!(%id, "change for unknown subscription"),
      }
    }
    other => {
      let id = other.request_id().to_string();
      match lock(&shared.pending).remove(&id) {
        Some(tx) => {
          let _ = tx.send(Ok(other));
        }
        // Unsubscribe is fire-and-forget, its ack has no pending entry.
        None if matches!(other, ServerMessage::Unsubscribed { .. }) => {}
        None => debug!(%id, "response for unknown request"),
      }
    }
  }
}

/// Handle bound to a named collection.
///
/// Two handles for the same name on the same connection behave identically.
pub struct Table<'a> {
  client: &'a SquirrelDB,
  name: String,
}

impl<'a> Table<'a> {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Insert a document. Returns it with its server-assigned id.
  pub async fn insert(&self, data: serde_json::Value) -> Result<Document> {
    self.client.insert(&self.name, data).await
  }

  pub async fn update(&self, document_id: Uuid, data: serde_json::Value) -> Result<Document> {
    self.client.update(&self.name, document_id, data).await
  }

  pub async fn delete(&self, document_id: Uuid) -> Result<Document> {
    self.client.delete(&self.name, document_id).await
  }

  /// Filter with a server-evaluated predicate expression.
  ///
  /// The predicate text, e.g. `u => u.status === 'active'`, is sent to the
  /// server verbatim; the client never interprets it.
  pub fn filter(&self, predicate: impl Into<Expression>) -> TableQuery<'a> {
    TableQuery {
      client: self.client,
      query: QueryBuilder::table(&self.name).filter(predicate),
    }
  }

  /// All documents in the collection.
  pub async fn all(&self) -> Result<Vec<Document>> {
    self.client.query(&QueryBuilder::table(&self.name).compile()).await
  }

  /// Subscribe to this collection's change feed.
  pub async fn changes(&self) -> Result<Subscription> {
    let query = QueryBuilder::table(&self.name).changes().compile();
    self.client.subscribe(&query).await
  }
}

/// A filtered query bound to a collection, executed with [`TableQuery::run`].
pub struct TableQuery<'a> {
  client: &'a SquirrelDB,
  query: QueryBuilder,
}

impl<'a> TableQuery<'a> {
  pub fn sort(mut self, field: impl Into<String>, direction: SortDir) -> Self {
    self.query = self.query.sort(field, direction);
    self
  }

  pub fn limit(mut self, n: usize) -> Self {
    self.query = self.query.limit(n);
    self
  }

  pub fn skip(mut self, n: usize) -> Self {
    self.query = self.query.skip(n);
    self
  }

  /// Execute and return all matching documents.
  pub async fn run(self) -> Result<Vec<Document>> {
    self.client.query(&self.query.compile()).await
  }

  /// Execute and return the raw result value.
  pub async fn run_raw(self) -> Result<serde_json::Value> {
    self.client.query_raw(&self.query.compile()).await
  }
}

/// A live change subscription.
///
/// Yields change events until unsubscribed or the connection fails; a
/// connection failure surfaces as one final `Err` item. Dropping the
/// subscription releases it on the server.
pub struct Subscription {
  id: String,
  rx: mpsc::UnboundedReceiver<Result<ChangeEvent>>,
  outgoing: mpsc::UnboundedSender<Vec<u8>>,
  shared: Arc<Shared>,
  encoding: Encoding,
  active: bool,
}

impl Subscription {
  pub fn id(&self) -> &str {
    &self.id
  }

  /// The next change event, or `None` once the subscription has ended.
  pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
    self.rx.recv().await
  }

  /// Explicitly release the subscription.
  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if !self.active {
      return;
    }
    self.active = false;
    lock(&self.shared.subscriptions).remove(&self.id);

    let msg = ClientMessage::Unsubscribe {
      id: self.id.clone(),
    };
    if let Ok(payload) = encode_message(&msg, self.encoding) {
      let frame = build_frame(MessageType::Request, self.encoding, &payload);
      let _ = self.outgoing.send(frame);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl Stream for Subscription {
  type Item = Result<ChangeEvent>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}
