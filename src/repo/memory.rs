//! In-memory implementations of the store contracts.
//!
//! Backs the integration tests and the self-contained server binary. All
//! state lives behind a single `tokio::sync::RwLock`; ids are assigned
//! monotonically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::auth::Claims;
use super::{
    MembershipRepo, MessageRepo, NewChatMessage, PushNotification, PushSink, RepoError,
    RoomSummary, StoredChatMessage, User, UserRepo, UserStatus,
};

/// Content substituted for deleted messages in read paths.
pub const DELETED_MESSAGE_TOMBSTONE: &str = "[message deleted]";

#[derive(Debug, Default)]
struct RoomRecord {
    name: String,
    description: Option<String>,
    room_type: String,
    /// user id -> last-read watermark
    members: HashMap<u64, Option<DateTime<Utc>>>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<u64, User>,
    rooms: HashMap<u64, RoomRecord>,
    messages: Vec<StoredChatMessage>,
    next_user_id: u64,
    next_message_id: u64,
}

/// Single-process store implementing every repository contract.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user row and returns its id.
    pub async fn add_user(
        &self,
        username: impl Into<String>,
        display_name: impl Into<String>,
        email: impl Into<String>,
    ) -> u64 {
        let mut state = self.inner.write().await;
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.insert(
            id,
            User {
                id,
                subject: None,
                username: username.into(),
                display_name: display_name.into(),
                email: email.into(),
                status: UserStatus::Offline,
            },
        );
        id
    }

    /// Seeds a room with the given id.
    pub async fn add_room(&self, room_id: u64, name: impl Into<String>) {
        let mut state = self.inner.write().await;
        state.rooms.insert(
            room_id,
            RoomRecord {
                name: name.into(),
                description: None,
                room_type: "group".into(),
                members: HashMap::new(),
            },
        );
    }

    /// Adds a user to a room's authoritative membership.
    pub async fn add_member(&self, room_id: u64, user_id: u64) {
        let mut state = self.inner.write().await;
        if let Some(room) = state.rooms.get_mut(&room_id) {
            room.members.entry(user_id).or_insert(None);
        }
    }

    /// Flags a message as deleted; read paths render the tombstone.
    pub async fn mark_deleted(&self, message_id: u64) {
        let mut state = self.inner.write().await;
        if let Some(msg) = state.messages.iter_mut().find(|m| m.id == message_id) {
            msg.is_deleted = true;
        }
    }

    /// Public room shape for invites.
    pub async fn room_summary(&self, room_id: u64) -> Option<RoomSummary> {
        let state = self.inner.read().await;
        state.rooms.get(&room_id).map(|room| RoomSummary {
            id: room_id,
            name: room.name.clone(),
            description: room.description.clone(),
            room_type: room.room_type.clone(),
            member_count: room.members.len(),
        })
    }
}

#[async_trait]
impl MembershipRepo for MemoryStore {
    async fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, RepoError> {
        let state = self.inner.read().await;
        Ok(state
            .rooms
            .get(&room_id)
            .is_some_and(|room| room.members.contains_key(&user_id)))
    }

    async fn member_count(&self, room_id: u64) -> Result<usize, RepoError> {
        let state = self.inner.read().await;
        Ok(state.rooms.get(&room_id).map_or(0, |r| r.members.len()))
    }

    async fn update_last_read(&self, room_id: u64, user_id: u64) -> Result<(), RepoError> {
        let mut state = self.inner.write().await;
        let room = state.rooms.get_mut(&room_id).ok_or(RepoError::NotFound)?;
        let watermark = room.members.get_mut(&user_id).ok_or(RepoError::NotFound)?;
        *watermark = Some(Utc::now());
        Ok(())
    }

    async fn user_ids_by_room(&self, room_id: u64) -> Result<Vec<u64>, RepoError> {
        let state = self.inner.read().await;
        Ok(state
            .rooms
            .get(&room_id)
            .map_or_else(Vec::new, |r| r.members.keys().copied().collect()))
    }
}

#[async_trait]
impl MessageRepo for MemoryStore {
    async fn insert(&self, msg: NewChatMessage) -> Result<StoredChatMessage, RepoError> {
        let mut state = self.inner.write().await;
        if !state.rooms.contains_key(&msg.room_id) {
            return Err(RepoError::NotFound);
        }
        state.next_message_id += 1;
        let stored = StoredChatMessage {
            id: state.next_message_id,
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            content: msg.content,
            message_type: msg.message_type,
            file_url: msg.file_url,
            thumbnail_url: msg.thumbnail_url,
            is_edited: false,
            is_deleted: false,
            created_at: Utc::now(),
        };
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn get_by_room_after(
        &self,
        room_id: u64,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredChatMessage>, RepoError> {
        let state = self.inner.read().await;
        let mut rows: Vec<StoredChatMessage> = state
            .messages
            .iter()
            .filter(|m| m.room_id == room_id && m.id > after_id)
            .map(|m| {
                let mut row = m.clone();
                if row.is_deleted {
                    row.content = DELETED_MESSAGE_TOMBSTONE.into();
                }
                row
            })
            .collect();
        rows.sort_by_key(|m| m.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn unread_count_snapshot(
        &self,
        room_id: u64,
        created_at: DateTime<Utc>,
        sender_id: u64,
    ) -> Result<usize, RepoError> {
        let state = self.inner.read().await;
        let room = state.rooms.get(&room_id).ok_or(RepoError::NotFound)?;
        Ok(room
            .members
            .iter()
            .filter(|(id, last_read)| {
                **id != sender_id && last_read.map_or(true, |at| at < created_at)
            })
            .count())
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn get_or_create_from_claims(&self, claims: &Claims) -> Result<User, RepoError> {
        let mut state = self.inner.write().await;

        // Lookup by subject id first.
        if let Some(id) = state
            .users
            .values()
            .find(|u| u.subject.as_deref() == Some(claims.subject.as_str()))
            .map(|u| u.id)
        {
            let user = state.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            user.status = UserStatus::Online;
            return Ok(user.clone());
        }

        // Bridge by email: attach the subject to an existing row.
        if let Some(id) = state
            .users
            .values()
            .find(|u| u.email == claims.email)
            .map(|u| u.id)
        {
            let user = state.users.get_mut(&id).ok_or(RepoError::NotFound)?;
            user.subject = Some(claims.subject.clone());
            user.status = UserStatus::Online;
            return Ok(user.clone());
        }

        state.next_user_id += 1;
        let id = state.next_user_id;
        let user = User {
            id,
            subject: Some(claims.subject.clone()),
            username: claims.email.clone(),
            display_name: claims.preferred_name.clone(),
            email: claims.email.clone(),
            status: UserStatus::Online,
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_by_id(&self, id: u64) -> Result<Option<User>, RepoError> {
        let state = self.inner.read().await;
        Ok(state.users.get(&id).cloned())
    }

    async fn update_status(&self, id: u64, status: UserStatus) -> Result<(), RepoError> {
        let mut state = self.inner.write().await;
        let user = state.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        user.status = status;
        Ok(())
    }
}

/// Push sink that only logs; the default for the server binary.
#[derive(Debug, Default)]
pub struct LoggingPushSink;

#[async_trait]
impl PushSink for LoggingPushSink {
    async fn send_to_room_members(
        &self,
        room_id: u64,
        exclude_user: u64,
        notification: PushNotification,
    ) {
        info!(
            room_id,
            exclude_user,
            sender = %notification.sender_name,
            "push notification dispatched"
        );
    }
}

/// Push sink that records every call, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingPushSink {
    calls: Mutex<Vec<(u64, u64, PushNotification)>>,
}

impl RecordingPushSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<(u64, u64, PushNotification)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PushSink for RecordingPushSink {
    async fn send_to_room_members(
        &self,
        room_id: u64,
        exclude_user: u64,
        notification: PushNotification,
    ) {
        self.calls
            .lock()
            .await
            .push((room_id, exclude_user, notification));
    }
}
