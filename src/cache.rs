//! Redis-compatible async cache client for SquirrelDB's cache service.
//!
//! Speaks the Redis Serialization Protocol (RESP) over TCP. One command is
//! in flight at a time; the connection is serialized internally.

use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Default cache service port.
pub const DEFAULT_CACHE_PORT: u16 = 6379;

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// RESP value types
#[derive(Debug, Clone)]
pub enum RespValue {
    SimpleString(String),
    Integer(i64),
    BulkString(Option<String>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    fn into_string(self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) | RespValue::BulkString(Some(s)) => Some(s),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }
}

/// Encode a RESP command as an array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Incremental RESP reader over a buffered stream.
pub struct RespReader<R> {
    inner: R,
}

impl<R: AsyncBufReadExt + Unpin> RespReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    async fn read_line(&mut self) -> CacheResult<String> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line).await?;
        if n == 0 {
            return Err(CacheError::Connection("connection closed".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Parse one RESP value. Server `-ERR` replies surface as
    /// [`CacheError::Server`].
    pub async fn parse(&mut self) -> CacheResult<RespValue> {
        let line = self.read_line().await?;
        let Some(prefix) = line.chars().next() else {
            return Err(CacheError::Protocol("empty response line".to_string()));
        };
        // Slice on the char boundary so a multi-byte prefix reaches the
        // unknown-prefix arm instead of panicking.
        let content = &line[prefix.len_utf8()..];

        match prefix {
            '+' => Ok(RespValue::SimpleString(content.to_string())),
            '-' => Err(CacheError::Server(content.to_string())),
            ':' => {
                let i = content
                    .parse::<i64>()
                    .map_err(|_| CacheError::Protocol(format!("invalid integer: {}", content)))?;
                Ok(RespValue::Integer(i))
            }
            '$' => {
                let len = content.parse::<i64>().map_err(|_| {
                    CacheError::Protocol(format!("invalid bulk string length: {}", content))
                })?;

                if len < 0 {
                    return Ok(RespValue::BulkString(None));
                }

                // Payload plus trailing CRLF.
                let mut data = vec![0u8; len as usize + 2];
                self.inner.read_exact(&mut data).await?;
                data.truncate(len as usize);

                let s = String::from_utf8(data).map_err(|_| {
                    CacheError::Protocol("invalid UTF-8 in bulk string".to_string())
                })?;
                Ok(RespValue::BulkString(Some(s)))
            }
            '*' => {
                let count = content.parse::<i64>().map_err(|_| {
                    CacheError::Protocol(format!("invalid array length: {}", content))
                })?;

                if count < 0 {
                    return Ok(RespValue::Array(None));
                }

                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(Box::pin(self.parse()).await?);
                }
                Ok(RespValue::Array(Some(items)))
            }
            _ => Err(CacheError::Protocol(format!(
                "unknown RESP prefix: {}",
                prefix
            ))),
        }
    }
}

/// Redis-compatible async cache client
pub struct CacheClient {
    reader: RespReader<BufReader<TcpStream>>,
}

impl CacheClient {
    /// Connect to a cache server.
    pub async fn connect(host: &str, port: u16) -> CacheResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| CacheError::Connection(format!("failed to connect to {}: {}", addr, e)))?;

        Ok(Self {
            reader: RespReader::new(BufReader::new(stream)),
        })
    }

    /// Send a command and receive the response
    async fn command(&mut self, args: &[&str]) -> CacheResult<RespValue> {
        let cmd = encode_command(args);
        let stream = self.reader.inner.get_mut();
        stream.write_all(&cmd).await?;
        stream.flush().await?;
        self.reader.parse().await
    }

    /// Get a value by key
    pub async fn get(&mut self, key: &str) -> CacheResult<Option<String>> {
        let resp = self.command(&["GET", key]).await?;
        Ok(resp.into_string())
    }

    /// Set a value with optional TTL in seconds
    pub async fn set(&mut self, key: &str, value: &str, ttl: Option<u64>) -> CacheResult<()> {
        let resp = match ttl {
            Some(seconds) => {
                let ttl_str = seconds.to_string();
                self.command(&["SET", key, value, "EX", &ttl_str]).await?
            }
            None => self.command(&["SET", key, value]).await?,
        };

        if resp.is_ok() {
            Ok(())
        } else {
            Err(CacheError::Protocol("SET did not return OK".to_string()))
        }
    }

    /// Delete a key, returns true if key existed
    pub async fn del(&mut self, key: &str) -> CacheResult<bool> {
        let resp = self.command(&["DEL", key]).await?;
        Ok(resp.as_integer().unwrap_or(0) > 0)
    }

    /// Check if a key exists
    pub async fn exists(&mut self, key: &str) -> CacheResult<bool> {
        let resp = self.command(&["EXISTS", key]).await?;
        Ok(resp.as_integer().unwrap_or(0) > 0)
    }

    /// Set expiration on a key
    pub async fn expire(&mut self, key: &str, seconds: u64) -> CacheResult<bool> {
        let ttl_str = seconds.to_string();
        let resp = self.command(&["EXPIRE", key, &ttl_str]).await?;
        Ok(resp.as_integer().unwrap_or(0) > 0)
    }

    /// Get TTL of a key in seconds (-1 = no expiry, -2 = key doesn't exist)
    pub async fn ttl(&mut self, key: &str) -> CacheResult<i64> {
        let resp = self.command(&["TTL", key]).await?;
        Ok(resp.as_integer().unwrap_or(-2))
    }

    /// Remove expiration from a key
    pub async fn persist(&mut self, key: &str) -> CacheResult<bool> {
        let resp = self.command(&["PERSIST", key]).await?;
        Ok(resp.as_integer().unwrap_or(0) > 0)
    }

    /// Increment a key's integer value by 1
    pub async fn incr(&mut self, key: &str) -> CacheResult<i64> {
        let resp = self.command(&["INCR", key]).await?;
        resp.as_integer()
            .ok_or_else(|| CacheError::Protocol("INCR did not return integer".to_string()))
    }

    /// Decrement a key's integer value by 1
    pub async fn decr(&mut self, key: &str) -> CacheResult<i64> {
        let resp = self.command(&["DECR", key]).await?;
        resp.as_integer()
            .ok_or_else(|| CacheError::Protocol("DECR did not return integer".to_string()))
    }

    /// Increment a key's integer value by amount
    pub async fn incrby(&mut self, key: &str, amount: i64) -> CacheResult<i64> {
        let amount_str = amount.to_string();
        let resp = self.command(&["INCRBY", key, &amount_str]).await?;
        resp.as_integer()
            .ok_or_else(|| CacheError::Protocol("INCRBY did not return integer".to_string()))
    }

    /// Get all keys matching a pattern
    pub async fn keys(&mut self, pattern: &str) -> CacheResult<Vec<String>> {
        let resp = self.command(&["KEYS", pattern]).await?;
        match resp {
            RespValue::Array(Some(arr)) => {
                Ok(arr.into_iter().filter_map(|v| v.into_string()).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Get multiple values at once
    pub async fn mget(&mut self, keys: &[&str]) -> CacheResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["MGET"];
        args.extend(keys);

        let resp = self.command(&args).await?;
        match resp {
            RespValue::Array(Some(arr)) => Ok(arr.into_iter().map(|v| v.into_string()).collect()),
            _ => Ok(vec![None; keys.len()]),
        }
    }

    /// Set multiple key-value pairs at once
    pub async fn mset(&mut self, pairs: &[(&str, &str)]) -> CacheResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut args = vec!["MSET"];
        for (k, v) in pairs {
            args.push(k);
            args.push(v);
        }

        let resp = self.command(&args).await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(CacheError::Protocol("MSET did not return OK".to_string()))
        }
    }

    /// Get number of keys in the database
    pub async fn dbsize(&mut self) -> CacheResult<i64> {
        let resp = self.command(&["DBSIZE"]).await?;
        resp.as_integer()
            .ok_or_else(|| CacheError::Protocol("DBSIZE did not return integer".to_string()))
    }

    /// Delete all keys in the current database
    pub async fn flush(&mut self) -> CacheResult<()> {
        let resp = self.command(&["FLUSHDB"]).await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(CacheError::Protocol(
                "FLUSHDB did not return OK".to_string(),
            ))
        }
    }

    /// Get server information, keyed by `key:value` lines
    pub async fn info(&mut self) -> CacheResult<HashMap<String, String>> {
        let resp = self.command(&["INFO"]).await?;
        let text = resp
            .into_string()
            .ok_or_else(|| CacheError::Protocol("INFO did not return string".to_string()))?;

        let mut result = HashMap::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                result.insert(key.to_string(), value.to_string());
            }
        }
        Ok(result)
    }

    /// Ping the server
    pub async fn ping(&mut self) -> CacheResult<()> {
        let resp = self.command(&["PING"]).await?;
        match &resp {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            _ => Err(CacheError::Protocol("PING did not return PONG".to_string())),
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> CacheResult<()> {
        let _ = self.command(&["QUIT"]).await;
        Ok(())
    }
}
