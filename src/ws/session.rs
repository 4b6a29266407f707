//! Session handling for the socket endpoint.
//!
//! Authenticates the upgrade request, resolves identity claims to a local
//! user, registers the connection with the hub and drives the read loop.
//! Each valid inbound frame is dispatched synchronously; replies to the
//! sending client go straight onto its own outbound queue, room-level
//! effects go through the hub.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ClientFrameKind, Envelope, ErrorCode, InboundEnvelope, JoinRoomPayload, LeaveRoomPayload,
    MarkReadPayload, MessageReadPayload, NewMessagePayload, RoomRef, SendMessagePayload,
    ServerFrame, TypingPayload, UserJoinedPayload, UserLeftPayload, UserTypingPayload,
};
use crate::repo::{NewChatMessage, PushNotification, User, UserStatus, UserSummary};
use crate::AppState;
use super::connection::{write_pump, ConnectionHandle};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws?token=<bearer>` upgrade endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let token = bearer_token(query.token.as_deref(), &headers).ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state.verifier.validate(&token).await.map_err(|e| {
        debug!(error = %e, "rejected websocket upgrade");
        StatusCode::UNAUTHORIZED
    })?;

    let user = state
        .users
        .get_or_create_from_claims(&claims)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to resolve user from claims");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(ws
        .max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, user)))
}

/// Bearer token from the query string, falling back to the
/// `Authorization` header.
pub(crate) fn bearer_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (handle, queue) = ConnectionHandle::new(
        user.id,
        user.username.clone(),
        state.config.outbound_queue_capacity,
    );
    info!(conn_id = %handle.id, user_id = user.id, "websocket connected");

    let came_online = state.hub.register(handle.clone()).await;
    if came_online {
        if let Err(e) = state.users.update_status(user.id, UserStatus::Online).await {
            warn!(user_id = user.id, error = %e, "failed to persist online status");
        }
        state
            .hub
            .broadcast_presence(user.id, UserStatus::Online)
            .await;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(
        sink,
        queue,
        handle.cancel_token(),
        state.config.clone(),
    ));

    read_pump(stream, &state, &handle).await;

    let went_offline = state.hub.unregister(handle.id).await;
    if went_offline {
        if let Err(e) = state.users.update_status(user.id, UserStatus::Offline).await {
            warn!(user_id = user.id, error = %e, "failed to persist offline status");
        }
        state
            .hub
            .broadcast_presence(user.id, UserStatus::Offline)
            .await;
    }

    let _ = writer.await;
    info!(conn_id = %handle.id, user_id = user.id, "websocket disconnected");
}

/// Reads frames until EOF, error, oversize close or cancellation. Any
/// inbound traffic (pongs included) keeps the pong window open.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    conn: &Arc<ConnectionHandle>,
) {
    let cancel = conn.cancel_token();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(state.config.pong_wait, stream.next()) => next,
        };
        match next {
            Err(_) => {
                debug!(conn_id = %conn.id, "no traffic within the pong window");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn_id = %conn.id, error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                dispatch_frame(state, conn, text.as_bytes()).await;
            }
            Ok(Some(Ok(Message::Binary(bytes)))) => {
                dispatch_frame(state, conn, &bytes).await;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
}

/// Decodes one inbound frame and routes it by type.
pub(crate) async fn dispatch_frame(state: &AppState, conn: &Arc<ConnectionHandle>, bytes: &[u8]) {
    let envelope = match InboundEnvelope::decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(conn_id = %conn.id, error = %e, "undecodable inbound frame");
            conn.send_error(ErrorCode::InvalidMessage, "invalid message format", None);
            return;
        }
    };

    match envelope.kind {
        ClientFrameKind::JoinRoom => handle_join_room(state, conn, &envelope).await,
        ClientFrameKind::LeaveRoom => handle_leave_room(state, conn, &envelope).await,
        ClientFrameKind::SendMessage => handle_send_message(state, conn, &envelope).await,
        ClientFrameKind::Typing => handle_typing(state, conn, &envelope).await,
        ClientFrameKind::MarkRead => handle_mark_read(state, conn, &envelope).await,
        ClientFrameKind::Ping => {
            conn.send_envelope(&Envelope::new(ServerFrame::Pong));
        }
        ClientFrameKind::Unknown => {
            conn.send_error(
                ErrorCode::UnknownType,
                "unknown message type",
                envelope.request_id.clone(),
            );
        }
    }
}

async fn handle_join_room(state: &AppState, conn: &Arc<ConnectionHandle>, envelope: &InboundEnvelope) {
    let Some(payload) = decode_payload::<JoinRoomPayload>(conn, envelope) else {
        return;
    };
    let room_id = payload.room_id;

    match state.members.is_member(room_id, conn.user_id).await {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            conn.send_error(
                ErrorCode::NotMember,
                "you are not a member of this room",
                envelope.request_id.clone(),
            );
            return;
        }
    }

    state.hub.join_room(conn.id, room_id).await;
    conn.send_envelope(&Envelope::new(ServerFrame::RoomJoined(RoomRef { room_id })));

    let member_count = state.members.member_count(room_id).await.unwrap_or(0);
    let Some(user) = lookup_user(state, conn.user_id).await else {
        return;
    };
    let notification = Envelope::new(ServerFrame::UserJoined(UserJoinedPayload {
        room_id,
        user: UserSummary::from(&user),
        member_count,
    }));
    if let Ok(bytes) = notification.encode() {
        // Membership events include the joining connection itself.
        state.hub.broadcast_to_room(room_id, &bytes, None).await;
    }
}

async fn handle_leave_room(state: &AppState, conn: &Arc<ConnectionHandle>, envelope: &InboundEnvelope) {
    let Some(payload) = decode_payload::<LeaveRoomPayload>(conn, envelope) else {
        return;
    };
    let room_id = payload.room_id;

    state.hub.leave_room(conn.id, room_id).await;
    conn.send_envelope(&Envelope::new(ServerFrame::RoomLeft(RoomRef { room_id })));

    let member_count = state.members.member_count(room_id).await.unwrap_or(0);
    let notification = Envelope::new(ServerFrame::UserLeft(UserLeftPayload {
        room_id,
        user_id: conn.user_id,
        username: conn.username.clone(),
        member_count,
    }));
    if let Ok(bytes) = notification.encode() {
        state.hub.broadcast_to_room(room_id, &bytes, None).await;
    }
}

async fn handle_send_message(
    state: &AppState,
    conn: &Arc<ConnectionHandle>,
    envelope: &InboundEnvelope,
) {
    let Some(payload) = decode_payload::<SendMessagePayload>(conn, envelope) else {
        return;
    };
    let room_id = payload.room_id;

    if payload.content.is_empty() && payload.file_url.is_none() {
        conn.send_error(
            ErrorCode::EmptyContent,
            "message content cannot be empty",
            envelope.request_id.clone(),
        );
        return;
    }

    match state.members.is_member(room_id, conn.user_id).await {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            conn.send_error(
                ErrorCode::NotMember,
                "you are not a member of this room",
                envelope.request_id.clone(),
            );
            return;
        }
    }

    let stored = match state
        .messages
        .insert(NewChatMessage {
            room_id,
            sender_id: conn.user_id,
            content: payload.content,
            message_type: payload.message_type,
            file_url: payload.file_url,
            thumbnail_url: payload.thumbnail_url,
        })
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            warn!(conn_id = %conn.id, room_id, error = %e, "message insert failed");
            conn.send_error(
                ErrorCode::SendFailed,
                "failed to send message",
                envelope.request_id.clone(),
            );
            return;
        }
    };

    let unread_count = state
        .messages
        .unread_count_snapshot(room_id, stored.created_at, conn.user_id)
        .await
        .unwrap_or(0);

    let Some(sender) = lookup_user(state, conn.user_id).await else {
        return;
    };

    let notification = Envelope::new(ServerFrame::NewMessage(NewMessagePayload {
        id: stored.id,
        room_id,
        sender: UserSummary::from(&sender),
        content: stored.content.clone(),
        message_type: stored.message_type,
        file_url: stored.file_url.clone(),
        thumbnail_url: stored.thumbnail_url.clone(),
        created_at: stored.created_at,
        unread_count,
    }));
    if let Ok(bytes) = notification.encode() {
        // The sender sees its own message with the server-assigned id.
        state.hub.broadcast_to_room(room_id, &bytes, None).await;
    }

    let push = state.push.clone();
    let push_note = PushNotification {
        room_id,
        sender_name: sender.display_name.clone(),
        body: stored.content,
    };
    let sender_id = conn.user_id;
    tokio::spawn(async move {
        push.send_to_room_members(room_id, sender_id, push_note).await;
    });
}

async fn handle_typing(state: &AppState, conn: &Arc<ConnectionHandle>, envelope: &InboundEnvelope) {
    let Some(payload) = decode_payload::<TypingPayload>(conn, envelope) else {
        return;
    };

    let notification = Envelope::new(ServerFrame::UserTyping(UserTypingPayload {
        room_id: payload.room_id,
        user_id: conn.user_id,
        username: conn.username.clone(),
        is_typing: payload.is_typing,
    }));
    if let Ok(bytes) = notification.encode() {
        state
            .hub
            .broadcast_to_room(payload.room_id, &bytes, Some(conn.id))
            .await;
    }
}

async fn handle_mark_read(state: &AppState, conn: &Arc<ConnectionHandle>, envelope: &InboundEnvelope) {
    let Some(payload) = decode_payload::<MarkReadPayload>(conn, envelope) else {
        return;
    };

    if let Err(e) = state
        .members
        .update_last_read(payload.room_id, conn.user_id)
        .await
    {
        warn!(conn_id = %conn.id, room_id = payload.room_id, error = %e, "failed to update last-read watermark");
    }

    let notification = Envelope::new(ServerFrame::MessageRead(MessageReadPayload {
        room_id: payload.room_id,
        user_id: conn.user_id,
        username: conn.username.clone(),
    }));
    if let Ok(bytes) = notification.encode() {
        state
            .hub
            .broadcast_to_room(payload.room_id, &bytes, Some(conn.id))
            .await;
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    conn: &Arc<ConnectionHandle>,
    envelope: &InboundEnvelope,
) -> Option<T> {
    match envelope.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(_) => {
            conn.send_error(
                ErrorCode::InvalidPayload,
                "invalid payload",
                envelope.request_id.clone(),
            );
            None
        }
    }
}

async fn lookup_user(state: &AppState, user_id: u64) -> Option<User> {
    match state.users.get_by_id(user_id).await {
        Ok(Some(user)) => Some(user),
        Ok(None) => {
            warn!(user_id, "connected user disappeared from the store");
            None
        }
        Err(e) => {
            warn!(user_id, error = %e, "user lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_prefers_the_query_string() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        assert_eq!(
            bearer_token(Some("from-query"), &headers).as_deref(),
            Some("from-query")
        );
    }

    #[test]
    fn bearer_token_falls_back_to_the_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        assert_eq!(bearer_token(None, &headers).as_deref(), Some("tok"));
        assert_eq!(bearer_token(Some(""), &headers).as_deref(), Some("tok"));
    }

    #[test]
    fn bearer_token_requires_the_bearer_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(None, &headers), None);
        assert_eq!(bearer_token(None, &HeaderMap::new()), None);
    }
}
