//! Correlated request/reply messaging over an NDJSON stream.
//!
//! Every outbound request carries a fresh correlation id and is registered
//! in the pending table before it is written. A single reader task per
//! connection matches replies to pending requests; everything else is
//! surfaced on the [`Inbound`] stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::cancel::CancelToken;

/// Expired correlation ids remembered for discarding late replies.
const EXPIRED_MEMORY: usize = 1024;

/// Errors produced by the [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// No reply arrived before the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The connection went away before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,
    /// The caller gave up waiting, typically on force-stop.
    #[error("request cancelled")]
    Cancelled,
    /// I/O error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Envelope (de)serialisation error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Logical channel (`atomic`, `report`, `debug`, ...).
    pub channel: String,
    /// Operation or event key within the channel.
    pub key: String,
    /// Identifier shared by a request and its reply.
    pub correlation_id: String,
    /// Identity of the sending side.
    pub sender_id: String,
    /// Whether the sender waits for a reply.
    #[serde(default)]
    pub needs_reply: bool,
    /// Message body.
    #[serde(default)]
    pub payload: JsonValue,
}

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    expired: Mutex<(HashSet<String>, VecDeque<String>)>,
    closed: AtomicBool,
}

impl Shared {
    fn expire(&self, id: String) {
        let mut expired = self.expired.lock();
        let (set, order) = &mut *expired;
        if set.insert(id.clone()) {
            order.push_back(id);
        }
        while order.len() > EXPIRED_MEMORY {
            if let Some(old) = order.pop_front() {
                set.remove(&old);
            }
        }
    }

    fn was_expired(&self, id: &str) -> bool {
        let mut expired = self.expired.lock();
        let (set, order) = &mut *expired;
        if set.remove(id) {
            order.retain(|known| known != id);
            true
        } else {
            false
        }
    }

    /// Fail every waiter; dropping a oneshot sender wakes its receiver.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests, connection closed");
        }
    }
}

/// Handle for sending messages on one connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Envelope>,
    sender_id: String,
    runtime: Handle,
}

/// Inbound envelopes that are not replies to our own requests.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbound {
    /// Next inbound envelope, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Stream for Inbound {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        self.rx.poll_recv(cx)
    }
}

impl Transport {
    /// Start reader and writer tasks on `stream`. Must be called from within
    /// a tokio runtime.
    pub fn connect<S>(stream: S, sender_id: impl Into<String>) -> (Self, Inbound)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            expired: Mutex::new((HashSet::new(), VecDeque::new())),
            closed: AtomicBool::new(false),
        });
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let mut line = match serde_json::to_vec(&envelope) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                line.push(b'\n');
                let written = async {
                    writer.write_all(&line).await?;
                    writer.flush().await
                }
                .await;
                if let Err(err) = written {
                    tracing::warn!(error = %err, "transport write failed");
                    break;
                }
            }
            writer_shared.close();
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "transport read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let envelope: Envelope = match serde_json::from_str(&line) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding malformed envelope");
                        continue;
                    }
                };
                let waiter = reader_shared.pending.lock().remove(&envelope.correlation_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(envelope);
                } else if reader_shared.was_expired(&envelope.correlation_id) {
                    tracing::debug!(id = %envelope.correlation_id, "discarding late reply");
                } else if inbound_tx.send(envelope).is_err() {
                    tracing::trace!("inbound receiver dropped");
                }
            }
            reader_shared.close();
        });

        let transport = Self {
            shared,
            outbound,
            sender_id: sender_id.into(),
            runtime: Handle::current(),
        };
        (transport, Inbound { rx: inbound_rx })
    }

    /// Identity stamped on outbound envelopes.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn envelope(&self, channel: &str, key: &str, id: String, needs_reply: bool, payload: JsonValue) -> Envelope {
        Envelope {
            channel: channel.to_string(),
            key: key.to_string(),
            correlation_id: id,
            sender_id: self.sender_id.clone(),
            needs_reply,
            payload,
        }
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub async fn send(
        &self,
        channel: &str,
        key: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> TransportResult<Envelope> {
        self.request(channel, key, payload, timeout, None).await
    }

    /// Like [`Transport::send`], but gives up with
    /// [`TransportError::Cancelled`] as soon as `cancel` fires.
    pub async fn send_cancellable(
        &self,
        channel: &str,
        key: &str,
        payload: JsonValue,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> TransportResult<Envelope> {
        self.request(channel, key, payload, timeout, Some(cancel)).await
    }

    /// Blocking form of [`Transport::send_cancellable`] for non-async
    /// threads. Must not be called from inside the runtime.
    pub fn send_blocking(
        &self,
        channel: &str,
        key: &str,
        payload: JsonValue,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> TransportResult<Envelope> {
        self.runtime
            .block_on(self.request(channel, key, payload, timeout, cancel))
    }

    async fn request(
        &self,
        channel: &str,
        key: &str,
        payload: JsonValue,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> TransportResult<Envelope> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(TransportError::Cancelled);
        }
        let id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);
        // The connection may have closed between the check and the insert.
        if self.is_closed() {
            self.shared.pending.lock().remove(&id);
            return Err(TransportError::ConnectionClosed);
        }
        let envelope = self.envelope(channel, key, id.clone(), true, payload);
        if self.outbound.send(envelope).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(TransportError::ConnectionClosed);
        }

        let waited = tokio::time::timeout(timeout, &mut rx);
        let outcome = match cancel {
            Some(cancel) => tokio::select! {
                waited = waited => Some(waited),
                () = cancel.cancelled() => None,
            },
            None => Some(waited.await),
        };
        match outcome {
            Some(Ok(Ok(reply))) => Ok(reply),
            Some(Ok(Err(_))) => Err(TransportError::ConnectionClosed),
            Some(Err(_)) => {
                tracing::debug!(channel, key, ?timeout, "request timed out");
                self.abandon(id, rx, TransportError::Timeout(timeout)).await
            }
            None => {
                tracing::debug!(channel, key, "request cancelled");
                self.abandon(id, rx, TransportError::Cancelled).await
            }
        }
    }

    /// Give up on request `id`. If the reader already claimed the waiter,
    /// its reply is in flight and is returned instead of `error`.
    async fn abandon(
        &self,
        id: String,
        rx: oneshot::Receiver<Envelope>,
        error: TransportError,
    ) -> TransportResult<Envelope> {
        let removed = self.shared.pending.lock().remove(&id);
        if removed.is_some() {
            self.shared.expire(id);
            return Err(error);
        }
        // The reader sends right after removing the waiter; this resolves
        // promptly with the reply, or with an error once the sender drops.
        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) if self.is_closed() => Err(TransportError::ConnectionClosed),
            Err(_) => Err(error),
        }
    }

    /// Send a message that expects no reply.
    pub fn notify(&self, channel: &str, key: &str, payload: JsonValue) -> TransportResult<()> {
        let envelope = self.envelope(channel, key, Uuid::new_v4().to_string(), false, payload);
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Answer an inbound request.
    pub fn reply(&self, request: &Envelope, payload: JsonValue) -> TransportResult<()> {
        let envelope = self.envelope(
            &request.channel,
            &request.key,
            request.correlation_id.clone(),
            false,
            payload,
        );
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
