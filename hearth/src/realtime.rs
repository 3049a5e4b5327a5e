//! WebSocket client for `hearth-relay`.
//!
//! One connection carries both request/response traffic (history pages,
//! sends, edits, deletes) and the unsolicited change feed of subscribed
//! conversations. A background reader task demultiplexes incoming frames:
//! responses are handed to the request waiting on their [`RequestId`],
//! changes are pushed into the [`ChangeFeed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use hearth_proto::codec::{self, CodecError};
use hearth_proto::message::{CanonicalMessage, ConversationId, MessageDraft, MessageId, TempId};
use hearth_proto::realtime::{ClientFrame, MessageChange, Page, RequestId, ServerFrame};

use crate::chat::{MessageSender, MessageSource, RemoteError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Errors raised by the realtime client.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The relay URL could not be parsed.
    #[error("invalid relay URL {url}: {source}")]
    InvalidUrl {
        /// The URL as given.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },

    /// The relay URL is not `ws://` or `wss://`.
    #[error("unsupported relay URL scheme {0:?} (expected ws or wss)")]
    UnsupportedScheme(String),

    /// Connecting or waiting for a response took too long.
    #[error("timed out")]
    Timeout,

    /// The WebSocket handshake failed.
    #[error("failed to connect to relay: {0}")]
    Connect(String),

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The relay refused the request.
    #[error("rejected by relay: {0}")]
    Rejected(String),

    /// The relay answered with a frame of the wrong kind.
    #[error("unexpected response to request {0}")]
    UnexpectedResponse(RequestId),
}

impl From<RealtimeError> for RemoteError {
    fn from(err: RealtimeError) -> Self {
        match err {
            RealtimeError::Rejected(reason) => Self::Rejected(reason),
            RealtimeError::Timeout => Self::Timeout,
            RealtimeError::ConnectionClosed => Self::ConnectionClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeOptions {
    /// Limit on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Limit on waiting for a response to a request.
    pub request_timeout: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Unsolicited changes of subscribed conversations.
///
/// The feed is unbounded: the reader task never waits on it, so responses
/// keep reaching their requests while changes sit unconsumed.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<MessageChange>,
}

impl ChangeFeed {
    /// Waits for the next change. Returns `None` once the connection closed
    /// and every buffered change was consumed.
    pub async fn next_change(&mut self) -> Option<MessageChange> {
        self.rx.recv().await
    }
}

/// State shared with the reader task.
#[derive(Debug, Default)]
struct Shared {
    waiters: parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<ServerFrame>>>,
    connected: AtomicBool,
}

struct Inner {
    url: String,
    writer: Mutex<WsSender>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    request_timeout: Duration,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Handle to a relay connection. Cheap to clone; the connection closes
/// when the last clone is dropped.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.inner.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Connects to the relay at `relay_url` and starts the reader task.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::InvalidUrl`] / [`RealtimeError::UnsupportedScheme`]
    ///   for a malformed URL.
    /// - [`RealtimeError::Timeout`] if the handshake exceeds the connect timeout.
    /// - [`RealtimeError::Connect`] if the handshake fails.
    pub async fn connect(
        relay_url: &str,
        options: RealtimeOptions,
    ) -> Result<(Self, ChangeFeed), RealtimeError> {
        let parsed = url::Url::parse(relay_url).map_err(|source| RealtimeError::InvalidUrl {
            url: relay_url.to_string(),
            source,
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RealtimeError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let (ws_stream, _response) =
            tokio::time::timeout(options.connect_timeout, connect_async(relay_url))
                .await
                .map_err(|_| {
                    tracing::warn!(url = relay_url, "relay connect timed out");
                    RealtimeError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = relay_url, err = %e, "relay connect failed");
                    RealtimeError::Connect(e.to_string())
                })?;

        let (writer, reader) = ws_stream.split();
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::Relaxed);
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(reader, Arc::clone(&shared), change_tx));

        tracing::info!(url = relay_url, "connected to relay");

        let client = Self {
            inner: Arc::new(Inner {
                url: relay_url.to_string(),
                writer: Mutex::new(writer),
                shared,
                next_request: AtomicU64::new(1),
                request_timeout: options.request_timeout,
                reader,
            }),
        };
        Ok((client, ChangeFeed { rx: change_rx }))
    }

    /// The relay URL this client is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.shared.connected.load(Ordering::Relaxed)
    }

    /// Starts receiving changes for `conversation_id`.
    ///
    /// Frames are processed in order, so a request issued after this call
    /// completes only once the subscription is active.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] if the frame cannot be written.
    pub async fn subscribe(&self, conversation_id: &ConversationId) -> Result<(), RealtimeError> {
        self.send_frame(&ClientFrame::Subscribe {
            conversation_id: conversation_id.clone(),
        })
        .await
    }

    /// Stops receiving changes for `conversation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] if the frame cannot be written.
    pub async fn unsubscribe(&self, conversation_id: &ConversationId) -> Result<(), RealtimeError> {
        self.send_frame(&ClientFrame::Unsubscribe {
            conversation_id: conversation_id.clone(),
        })
        .await
    }

    /// Fetches a page of history.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] on transport failure, timeout or rejection.
    pub async fn fetch(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: u32,
    ) -> Result<Page, RealtimeError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::FetchPage {
            request_id,
            conversation_id: conversation_id.clone(),
            before: before.cloned(),
            limit,
        };
        match self.request(request_id, &frame).await? {
            ServerFrame::Page { page, .. } => Ok(page),
            ServerFrame::Rejected { reason, .. } => Err(RealtimeError::Rejected(reason)),
            _ => Err(RealtimeError::UnexpectedResponse(request_id)),
        }
    }

    /// Persists a new message.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] on transport failure, timeout or rejection.
    pub async fn submit(
        &self,
        temp_id: &TempId,
        draft: &MessageDraft,
    ) -> Result<CanonicalMessage, RealtimeError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::Send {
            request_id,
            temp_id: temp_id.clone(),
            draft: draft.clone(),
        };
        self.expect_ack(request_id, &frame).await
    }

    /// Replaces the content of a message.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] on transport failure, timeout or rejection.
    pub async fn edit(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<CanonicalMessage, RealtimeError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::Edit {
            request_id,
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            content: content.to_string(),
        };
        self.expect_ack(request_id, &frame).await
    }

    /// Deletes (tombstones) a message.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] on transport failure, timeout or rejection.
    pub async fn delete(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<CanonicalMessage, RealtimeError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::Delete {
            request_id,
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        };
        self.expect_ack(request_id, &frame).await
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed))
    }

    async fn expect_ack(
        &self,
        request_id: RequestId,
        frame: &ClientFrame,
    ) -> Result<CanonicalMessage, RealtimeError> {
        match self.request(request_id, frame).await? {
            ServerFrame::Ack { message, .. } => Ok(message),
            ServerFrame::Rejected { reason, .. } => Err(RealtimeError::Rejected(reason)),
            _ => Err(RealtimeError::UnexpectedResponse(request_id)),
        }
    }

    /// Writes `frame` and waits for the response carrying `request_id`.
    async fn request(
        &self,
        request_id: RequestId,
        frame: &ClientFrame,
    ) -> Result<ServerFrame, RealtimeError> {
        let (tx, rx) = oneshot::channel();
        self.inner.shared.waiters.lock().insert(request_id, tx);

        if let Err(e) = self.send_frame(frame).await {
            self.inner.shared.waiters.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Reader task exited and dropped the waiter.
            Ok(Err(_)) => Err(RealtimeError::ConnectionClosed),
            Err(_) => {
                self.inner.shared.waiters.lock().remove(&request_id);
                tracing::warn!(request = %request_id, "relay request timed out");
                Err(RealtimeError::Timeout)
            }
        }
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::ConnectionClosed);
        }
        let bytes = codec::encode(frame)?;
        let mut writer = self.inner.writer.lock().await;
        writer
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "relay write failed");
                self.inner.shared.connected.store(false, Ordering::Relaxed);
                RealtimeError::ConnectionClosed
            })
    }
}

impl MessageSource for RealtimeClient {
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: u32,
    ) -> Result<Page, RemoteError> {
        Ok(self.fetch(conversation_id, before, limit).await?)
    }
}

impl MessageSender for RealtimeClient {
    async fn send(
        &self,
        temp_id: &TempId,
        draft: &MessageDraft,
    ) -> Result<CanonicalMessage, RemoteError> {
        Ok(self.submit(temp_id, draft).await?)
    }
}

/// Reads frames until the socket closes, routing responses to their
/// waiters and changes to the feed. Malformed frames are logged and
/// skipped.
async fn reader_loop(
    mut reader: WsReader,
    shared: Arc<Shared>,
    changes: mpsc::UnboundedSender<MessageChange>,
) {
    while let Some(result) = reader.next().await {
        match result {
            Ok(Message::Binary(data)) => match codec::decode::<ServerFrame>(&data) {
                Ok(ServerFrame::Change(change)) => {
                    if changes.send(change).is_err() {
                        tracing::debug!("change feed dropped, discarding change");
                    }
                }
                Ok(ServerFrame::Subscribed { conversation_id }) => {
                    tracing::info!(conversation = %conversation_id, "subscribed");
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "relay error");
                }
                Ok(response) => {
                    let Some(request_id) = response.request_id() else {
                        continue;
                    };
                    let waiter = shared.waiters.lock().remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => {
                            tracing::debug!(request = %request_id, "response for unknown request");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed relay frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("relay closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "relay read error");
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::Relaxed);
    // Dropping the senders wakes every in-flight request.
    shared.waiters.lock().clear();
    tracing::info!("relay reader task exiting");
}
