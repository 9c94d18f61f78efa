//! Basic example demonstrating SquirrelDB Rust SDK usage.

use serde_json::json;
use squirreldb::{ChangeEvent, ConnectOptions, SquirrelDB};

#[tokio::main]
async fn main() -> squirreldb::Result<()> {
  tracing_subscriber::fmt::init();

  // Token is a caller concern; the library never reads the environment.
  let mut opts = ConnectOptions::new("localhost", 8082);
  if let Ok(token) = std::env::var("SQUIRRELDB_TOKEN") {
    opts = opts.with_auth(token);
  }

  let client = SquirrelDB::connect_with_options(opts).await?;
  println!("Connected! Session ID: {}", client.session_id());

  // Ping the server
  client.ping().await?;
  println!("Ping successful!");

  // List collections
  let collections = client.list_collections().await?;
  println!("Collections: {:?}", collections);

  let users = client.table("users");

  // Insert a document
  let doc = users
    .insert(json!({
        "name": "Alice",
        "email": "alice@example.com",
        "active": true
    }))
    .await?;
  println!("Inserted document: {:?}", doc);

  // Query with a server-evaluated predicate
  let active = users.filter("u => u.active").run().await?;
  println!("Active users: {}", active.len());

  // Update the document
  let updated = users
    .update(
      doc.id,
      json!({
          "name": "Alice Updated",
          "email": "alice.updated@example.com",
          "active": true
      }),
    )
    .await?;
  println!("Updated document: {:?}", updated);

  // Subscribe to changes (in a real app, you'd run this in a separate task)
  println!("\nSubscribing to user changes...");
  println!("(Insert/update/delete users from another client to see changes)");
  println!("Press Ctrl+C to exit.\n");

  let mut sub = users.changes().await?;

  while let Some(change) = sub.next().await {
    match change? {
      ChangeEvent::Initial { document } => {
        println!("Initial: {}", document.data);
      }
      ChangeEvent::Insert { new } => {
        println!("Insert: {}", new.data);
      }
      ChangeEvent::Update { old, new } => {
        println!("Update: {} -> {}", old, new.data);
      }
      ChangeEvent::Delete { old } => {
        println!("Delete: {}", old.data);
      }
    }
  }

  Ok(())
}
