//! Relay server core: shared state, WebSocket handler, subscriptions and
//! request handling.
//!
//! Every accepted WebSocket gets a connection id and an outbound channel
//! drained by a writer task. Requests are answered on the requesting
//! connection; changes to a conversation are fanned out to every
//! connection subscribed to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use hearth_proto::codec;
use hearth_proto::message::{
    CanonicalMessage, ConversationId, MAX_MESSAGE_SIZE, MessageBody, MessageDraft, MessageId,
    TempId,
};
use hearth_proto::realtime::{ClientFrame, MessageChange, RequestId, ServerFrame};
use hearth_proto::timestamp::now_iso8601;
use tokio::sync::{RwLock, mpsc};

use crate::store::{Appended, HistoryStore};

/// Identifies one accepted WebSocket connection.
pub type ConnectionId = u64;

/// Shared relay state: live connections, subscriptions and history.
pub struct RelayState {
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
    subscriptions: RwLock<HashMap<ConversationId, HashSet<ConnectionId>>>,
    /// Canonical message history.
    pub store: HistoryStore,
    max_message_size: usize,
    next_connection: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MAX_MESSAGE_SIZE, HistoryStore::new())
    }

    /// Creates a relay state with a custom message size limit and store.
    #[must_use]
    pub fn with_config(max_message_size: usize, store: HistoryStore) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            store,
            max_message_size,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Registers a connection's outbound channel and returns its id.
    pub async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(id, sender);
        id
    }

    /// Removes a connection and all of its subscriptions.
    pub async fn unregister(&self, connection: ConnectionId) {
        self.connections.write().await.remove(&connection);
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
    }

    /// Subscribes `connection` to changes of `conversation_id`.
    pub async fn subscribe(&self, connection: ConnectionId, conversation_id: ConversationId) {
        self.subscriptions
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(connection);
    }

    /// Stops sending changes of `conversation_id` to `connection`.
    pub async fn unsubscribe(&self, connection: ConnectionId, conversation_id: &ConversationId) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subscribers) = subscriptions.get_mut(conversation_id) {
            subscribers.remove(&connection);
            if subscribers.is_empty() {
                subscriptions.remove(conversation_id);
            }
        }
    }

    /// Number of connections subscribed to `conversation_id`.
    pub async fn subscriber_count(&self, conversation_id: &ConversationId) -> usize {
        self.subscriptions
            .read()
            .await
            .get(conversation_id)
            .map_or(0, HashSet::len)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends a WebSocket Close frame to every connection.
    pub async fn close_all_connections(&self) {
        let connections = self.connections.read().await;
        for (connection, sender) in connections.iter() {
            tracing::info!(connection, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }

    /// Encodes `frame` and queues it on one connection.
    async fn send_to(&self, connection: ConnectionId, frame: &ServerFrame) {
        let bytes = match codec::encode(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode server frame");
                return;
            }
        };
        if let Some(sender) = self.connections.read().await.get(&connection) {
            let _ = sender.send(Message::Binary(bytes.into()));
        }
    }

    /// Fans a change out to every subscriber of its conversation.
    async fn broadcast(&self, change: MessageChange) {
        let conversation_id = change.message().body.conversation_id.clone();
        let subscribers: Vec<ConnectionId> = self
            .subscriptions
            .read()
            .await
            .get(&conversation_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return;
        }

        let bytes = match codec::encode(&ServerFrame::Change(change)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode change frame");
                return;
            }
        };
        let connections = self.connections.read().await;
        for connection in &subscribers {
            if let Some(sender) = connections.get(connection) {
                let _ = sender.send(Message::Binary(bytes.clone().into()));
            }
        }
        tracing::debug!(
            conversation = %conversation_id,
            subscribers = subscribers.len(),
            "change broadcast"
        );
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Register the outbound channel and spawn the writer task.
/// 2. Process incoming frames until the socket closes.
/// 3. Unregister the connection and drop its subscriptions.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(tx).await;
    tracing::info!(connection, "client connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(connection, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(connection).await;
    tracing::info!(connection, "client disconnected");
}

/// Decodes and dispatches one frame from a connection.
async fn handle_binary_message(connection: ConnectionId, data: &[u8], state: &RelayState) {
    let frame = match codec::decode::<ClientFrame>(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(connection, error = %e, "failed to decode client frame");
            let error = ServerFrame::Error {
                reason: format!("malformed frame: {e}"),
            };
            state.send_to(connection, &error).await;
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { conversation_id } => {
            state.subscribe(connection, conversation_id.clone()).await;
            tracing::info!(connection, conversation = %conversation_id, "subscribed");
            state
                .send_to(connection, &ServerFrame::Subscribed { conversation_id })
                .await;
        }
        ClientFrame::Unsubscribe { conversation_id } => {
            state.unsubscribe(connection, &conversation_id).await;
            tracing::info!(connection, conversation = %conversation_id, "unsubscribed");
        }
        ClientFrame::FetchPage {
            request_id,
            conversation_id,
            before,
            limit,
        } => {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            let page = state
                .store
                .page(&conversation_id, before.as_ref(), limit)
                .await;
            state
                .send_to(connection, &ServerFrame::Page { request_id, page })
                .await;
        }
        ClientFrame::Send {
            request_id,
            temp_id,
            draft,
        } => {
            match handle_send(state, &temp_id, draft).await {
                Ok(SendOutcome::Duplicate(message)) => {
                    // Subscribers saw the first copy; only the requester needs an answer.
                    state
                        .send_to(connection, &ServerFrame::Ack { request_id, message })
                        .await;
                }
                Ok(SendOutcome::Stored(message)) => {
                    respond_with_change(
                        state,
                        connection,
                        request_id,
                        Ok(message),
                        MessageChange::Inserted,
                    )
                    .await;
                }
                Err(reason) => {
                    let response = rejected(connection, request_id, reason);
                    state.send_to(connection, &response).await;
                }
            }
        }
        ClientFrame::Edit {
            request_id,
            conversation_id,
            message_id,
            content,
        } => {
            let result = handle_edit(state, &conversation_id, &message_id, content).await;
            respond_with_change(state, connection, request_id, result, MessageChange::Updated)
                .await;
        }
        ClientFrame::Delete {
            request_id,
            conversation_id,
            message_id,
        } => {
            let result = handle_delete(state, &conversation_id, &message_id).await;
            respond_with_change(state, connection, request_id, result, MessageChange::Updated)
                .await;
        }
    }
}

/// Result of a `Send` request.
enum SendOutcome {
    /// The message was stored.
    Stored(CanonicalMessage),
    /// The sender already submitted this temp id.
    Duplicate(CanonicalMessage),
}

/// Validates and persists a draft. A resend of a temp id the sender
/// already submitted yields the stored copy.
async fn handle_send(
    state: &RelayState,
    temp_id: &TempId,
    draft: MessageDraft,
) -> Result<SendOutcome, String> {
    draft
        .validate_with_limit(state.max_message_size)
        .map_err(|e| e.to_string())?;

    let message = CanonicalMessage {
        id: MessageId::generate(),
        body: MessageBody::from_draft(draft, now_iso8601()),
    };
    match state.store.append_send(temp_id, message.clone()).await {
        Appended::Stored(len) => {
            tracing::debug!(
                temp_id = %temp_id,
                message_id = %message.id,
                conversation = %message.body.conversation_id,
                history = len,
                "message persisted"
            );
            Ok(SendOutcome::Stored(message))
        }
        Appended::Duplicate(existing) => {
            tracing::info!(
                temp_id = %temp_id,
                message_id = %existing.id,
                "duplicate send, returning stored message"
            );
            Ok(SendOutcome::Duplicate(existing))
        }
    }
}

async fn handle_edit(
    state: &RelayState,
    conversation_id: &ConversationId,
    message_id: &MessageId,
    content: String,
) -> Result<CanonicalMessage, String> {
    if content.trim().is_empty() {
        return Err("message content is empty".to_string());
    }
    if content.len() > state.max_message_size {
        return Err(format!(
            "message too large ({} bytes, max {} bytes)",
            content.len(),
            state.max_message_size
        ));
    }
    match state.store.get(conversation_id, message_id).await {
        None => return Err(format!("message {message_id} not found")),
        Some(existing) if existing.body.is_deleted() => {
            return Err(format!("message {message_id} is deleted"));
        }
        Some(_) => {}
    }
    let edited_at = now_iso8601();
    state
        .store
        .update(conversation_id, message_id, move |body| {
            body.content = content;
            body.edited_at = Some(edited_at);
        })
        .await
        .ok_or_else(|| format!("message {message_id} not found"))
}

async fn handle_delete(
    state: &RelayState,
    conversation_id: &ConversationId,
    message_id: &MessageId,
) -> Result<CanonicalMessage, String> {
    let deleted_at = now_iso8601();
    state
        .store
        .update(conversation_id, message_id, move |body| {
            if body.deleted_at.is_none() {
                body.content.clear();
                body.deleted_at = Some(deleted_at);
            }
        })
        .await
        .ok_or_else(|| format!("message {message_id} not found"))
}

/// Acks a successful write, then broadcasts it to subscribers.
///
/// The requester always sees its ack before the matching change.
async fn respond_with_change(
    state: &RelayState,
    connection: ConnectionId,
    request_id: RequestId,
    result: Result<CanonicalMessage, String>,
    change: fn(CanonicalMessage) -> MessageChange,
) {
    match result {
        Ok(message) => {
            state
                .send_to(
                    connection,
                    &ServerFrame::Ack {
                        request_id,
                        message: message.clone(),
                    },
                )
                .await;
            state.broadcast(change(message)).await;
        }
        Err(reason) => {
            let response = rejected(connection, request_id, reason);
            state.send_to(connection, &response).await;
        }
    }
}

fn rejected(connection: ConnectionId, request_id: RequestId, reason: String) -> ServerFrame {
    tracing::warn!(connection, request = %request_id, reason = %reason, "request rejected");
    ServerFrame::Rejected { request_id, reason }
}

/// Starts the relay server on the given address and returns the bound
/// address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
