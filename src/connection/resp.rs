//! RESP Client Connections
//!
//! A [`RespConnection`] speaks RESP2 to a Redis-compatible server over any
//! byte stream. Commands are encoded as arrays of bulk strings and replies
//! are read back with the incremental [`RespParser`].
//!
//! ## Modes
//!
//! ```text
//!   Ready ──── subscribe ────▶ Subscribed ──── close ───▶ Closed
//!     │                                                     ▲
//!     └──────────── close / I/O or protocol error ──────────┘
//! ```
//!
//! In `Ready` mode one command is in flight at a time; the mutex around the
//! stream serializes concurrent callers. After `SUBSCRIBE` the stream is
//! handed to a reader task that forwards `message` pushes to the
//! [`Subscription`].

use crate::connection::{
    ttl_millis, Connection, Connector, StoreError, Subscription, SUBSCRIPTION_BUFFER,
};
use crate::protocol::{RespParser, RespValue};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Opens RESP connections over TCP.
///
/// # Example
///
/// ```no_run
/// use flashmq::connection::{Connector, TcpConnector};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), flashmq::connection::StoreError> {
/// let connector = TcpConnector::new("127.0.0.1:6379");
/// let conn = connector.connect().await?;
/// let value = conn.get(b"fedify::greeting").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Creates a connector for `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// The address connections are opened to.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, StoreError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "Connected to server");
        Ok(Arc::new(RespConnection::new(stream)))
    }
}

/// The stream plus the read state that survives between replies.
struct Framed<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
    parser: RespParser,
}

impl<S> Framed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn request(&mut self, command: &RespValue) -> Result<RespValue, StoreError> {
        let bytes = command.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        trace!(bytes = bytes.len(), "Sent command");
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<RespValue, StoreError> {
        loop {
            if !self.buffer.is_empty() {
                if let Some((value, consumed)) = self.parser.parse(&self.buffer)? {
                    self.buffer.advance(consumed);
                    return Ok(value);
                }
            }

            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(StoreError::Closed);
            }
            trace!(bytes = n, "Read data");
        }
    }
}

enum Mode<S> {
    Ready(Box<Framed<S>>),
    Subscribed(AbortHandle),
    Closed,
}

/// A RESP2 client connection over a byte stream.
pub struct RespConnection<S> {
    mode: Mutex<Mode<S>>,
}

impl<S> std::fmt::Debug for RespConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespConnection").finish_non_exhaustive()
    }
}

impl<S> RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            mode: Mutex::new(Mode::Ready(Box::new(Framed {
                stream: BufWriter::new(stream),
                buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
                parser: RespParser::new(),
            }))),
        }
    }

    /// Sends one command and returns its reply. Error replies become
    /// [`StoreError::Server`]; a broken stream closes the connection.
    async fn execute(&self, command: RespValue) -> Result<RespValue, StoreError> {
        let mut mode = self.mode.lock().await;
        let framed = match &mut *mode {
            Mode::Ready(framed) => framed,
            Mode::Subscribed(_) => return Err(StoreError::Subscribed),
            Mode::Closed => return Err(StoreError::Closed),
        };

        match framed.request(&command).await {
            Ok(RespValue::Error(message)) => Err(StoreError::Server(message)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(error = %e, "Connection unusable, closing");
                *mode = Mode::Closed;
                Err(e)
            }
        }
    }
}

fn score_arg(score: f64) -> Bytes {
    if score == f64::INFINITY {
        Bytes::from_static(b"+inf")
    } else if score == f64::NEG_INFINITY {
        Bytes::from_static(b"-inf")
    } else {
        Bytes::from(score.to_string())
    }
}

fn integer_reply(command: &'static str, reply: RespValue) -> Result<i64, StoreError> {
    reply
        .as_integer()
        .ok_or_else(|| unexpected(command, reply))
}

fn unexpected(command: &'static str, reply: RespValue) -> StoreError {
    StoreError::UnexpectedReply {
        command,
        reply: reply.to_string(),
    }
}

fn set_command(key: &[u8], value: Bytes, nx: bool, ttl: Option<Duration>) -> RespValue {
    let mut args = vec![
        Bytes::from_static(b"SET"),
        Bytes::copy_from_slice(key),
        value,
    ];
    if nx {
        args.push(Bytes::from_static(b"NX"));
    }
    if let Some(ttl) = ttl {
        args.push(Bytes::from_static(b"PX"));
        args.push(Bytes::from(ttl_millis(ttl).to_string()));
    }
    RespValue::command(args)
}

/// Pulls the payload out of a `["message", channel, payload]` push.
fn message_payload(push: RespValue) -> Option<Bytes> {
    let mut parts = push.into_array()?;
    if parts.len() != 3 || parts[0].as_str() != Some("message") {
        return None;
    }
    parts.pop()?.into_bulk()
}

#[async_trait]
impl<S> Connection for RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let reply = self
            .execute(RespValue::command([
                Bytes::from_static(b"GET"),
                Bytes::copy_from_slice(key),
            ]))
            .await?;
        match reply {
            RespValue::Null => Ok(None),
            RespValue::BulkString(value) => Ok(Some(value)),
            other => Err(unexpected("GET", other)),
        }
    }

    async fn set(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        match self.execute(set_command(key, value, false, ttl)).await? {
            RespValue::SimpleString(s) if s == "OK" => Ok(()),
            other => Err(unexpected("SET", other)),
        }
    }

    async fn set_nx(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        match self.execute(set_command(key, value, true, ttl)).await? {
            RespValue::SimpleString(s) if s == "OK" => Ok(true),
            RespValue::Null => Ok(false),
            other => Err(unexpected("SET", other)),
        }
    }

    async fn del(&self, key: &[u8]) -> Result<bool, StoreError> {
        let reply = self
            .execute(RespValue::command([
                Bytes::from_static(b"DEL"),
                Bytes::copy_from_slice(key),
            ]))
            .await?;
        Ok(integer_reply("DEL", reply)? > 0)
    }

    async fn zadd(&self, key: &[u8], score: f64, member: Bytes) -> Result<bool, StoreError> {
        let reply = self
            .execute(RespValue::command([
                Bytes::from_static(b"ZADD"),
                Bytes::copy_from_slice(key),
                score_arg(score),
                member,
            ]))
            .await?;
        Ok(integer_reply("ZADD", reply)? > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
    ) -> Result<Vec<Bytes>, StoreError> {
        let reply = self
            .execute(RespValue::command([
                Bytes::from_static(b"ZRANGEBYSCORE"),
                Bytes::copy_from_slice(key),
                score_arg(min),
                score_arg(max),
            ]))
            .await?;
        let members = match reply {
            RespValue::Array(members) => members,
            other => return Err(unexpected("ZRANGEBYSCORE", other)),
        };
        members
            .into_iter()
            .map(|member| match member {
                RespValue::BulkString(m) => Ok(m),
                other => Err(unexpected("ZRANGEBYSCORE", other)),
            })
            .collect()
    }

    async fn zrem(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
        let reply = self
            .execute(RespValue::command([
                Bytes::from_static(b"ZREM"),
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(member),
            ]))
            .await?;
        Ok(integer_reply("ZREM", reply)? > 0)
    }

    async fn publish(&self, channel: &[u8], message: Bytes) -> Result<u64, StoreError> {
        let reply = self
            .execute(RespValue::command([
                Bytes::from_static(b"PUBLISH"),
                Bytes::copy_from_slice(channel),
                message,
            ]))
            .await?;
        Ok(integer_reply("PUBLISH", reply)?.max(0) as u64)
    }

    async fn subscribe(&self, channel: &[u8]) -> Result<Subscription, StoreError> {
        let mut mode = self.mode.lock().await;
        let mut framed = match std::mem::replace(&mut *mode, Mode::Closed) {
            Mode::Ready(framed) => framed,
            Mode::Subscribed(handle) => {
                *mode = Mode::Subscribed(handle);
                return Err(StoreError::Subscribed);
            }
            Mode::Closed => return Err(StoreError::Closed),
        };

        let channel = Bytes::copy_from_slice(channel);
        let command = RespValue::command([Bytes::from_static(b"SUBSCRIBE"), channel.clone()]);
        let confirmation = framed.request(&command).await?;
        let confirmed = matches!(
            confirmation.clone().into_array().as_deref(),
            Some([kind, _, _]) if kind.as_str() == Some("subscribe")
        );
        if !confirmed {
            if let RespValue::Error(message) = confirmation {
                *mode = Mode::Ready(framed);
                return Err(StoreError::Server(message));
            }
            return Err(unexpected("SUBSCRIBE", confirmation));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let reader = tokio::spawn(async move {
            loop {
                let push = match framed.read_reply().await {
                    Ok(push) => push,
                    Err(e) => {
                        debug!(error = %e, "Subscription stream ended");
                        break;
                    }
                };
                match message_payload(push) {
                    Some(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    None => trace!("Ignoring non-message push"),
                }
            }
        });

        *mode = Mode::Subscribed(reader.abort_handle());
        debug!(channel = ?channel, "Subscribed");
        Ok(Subscription::new(channel, rx, reader))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut mode = self.mode.lock().await;
        match std::mem::replace(&mut *mode, Mode::Closed) {
            Mode::Ready(mut framed) => {
                if let Err(e) = framed.stream.shutdown().await {
                    trace!(error = %e, "Shutdown failed on close");
                }
            }
            Mode::Subscribed(reader) => reader.abort(),
            Mode::Closed => {}
        }
        Ok(())
    }
}
