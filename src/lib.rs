//! SquirrelDB Rust Client SDK
//!
//! A native TCP client for SquirrelDB, a realtime document database.
//!
//! # Example
//!
//! ```no_run
//! use squirreldb::{ConnectOptions, SquirrelDB};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> squirreldb::Result<()> {
//!     // Construction performs no I/O; the connection opens on connect.
//!     let opts = ConnectOptions::new("localhost", 8082).with_auth("token");
//!     let client = SquirrelDB::connect_with_options(opts).await?;
//!
//!     let users = client.table("users");
//!
//!     // Insert a document; the result carries the server-assigned id.
//!     let doc = users.insert(json!({
//!         "name": "Alice",
//!         "email": "alice@example.com"
//!     })).await?;
//!     println!("Inserted: {}", doc.id);
//!
//!     // Filter with a server-evaluated predicate expression.
//!     let active = users.filter("u => u.status === 'active'").run().await?;
//!     println!("Found: {} active users", active.len());
//!
//!     // Subscribe to changes; dropping the subscription releases it.
//!     let mut sub = users.changes().await?;
//!     while let Some(change) = sub.next().await {
//!         println!("Change: {:?}", change?);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
mod client;
mod error;
pub mod protocol;
pub mod query;
pub mod storage;

pub use client::{ConnectOptions, SquirrelDB, Subscription, Table, TableQuery};
pub use error::{Error, Result};
pub use protocol::{
  ChangeEvent, ClientMessage, Document, Encoding, HandshakeStatus, MessageType, ProtocolFlags,
  ServerMessage, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use query::Expression;
pub use storage::{Bucket, MultipartUpload, Storage, StorageObject, UploadPart};
