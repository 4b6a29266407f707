//! Contracts for the durable-store collaborators.
//!
//! Authoritative users, rooms, memberships and messages live outside the
//! delivery plane. The plane talks to them through these traits; the
//! in-memory implementations in [`memory`] back the tests and the
//! self-contained server binary.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Claims;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Presence status stored on the user row and carried in presence frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
}

/// Kind of chat message content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

/// A user row as the durable store sees it.
#[derive(Debug, Clone)]
pub struct User {
    pub id: u64,
    /// Subject id from the identity provider, once attached.
    pub subject: Option<String>,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub status: UserStatus,
}

/// Public projection of a user, embedded in outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: u64,
    pub username: String,
    pub display_name: String,
    pub status: UserStatus,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            status: user.status,
        }
    }
}

/// A message to persist, as received from a client.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub room_id: u64,
    pub sender_id: u64,
    pub content: String,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// A persisted message row; also the backfill response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChatMessage {
    pub id: u64,
    pub room_id: u64,
    pub sender_id: u64,
    pub content: String,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Public room shape carried in `room_invited` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: u64,
    pub name: String,
    pub description: Option<String>,
    pub room_type: String,
    pub member_count: usize,
}

/// Notification handed to the push sink for members without a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub room_id: u64,
    pub sender_name: String,
    pub body: String,
}

/// Authoritative room membership and read-state watermarks.
#[async_trait]
pub trait MembershipRepo: Send + Sync {
    async fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, RepoError>;

    async fn member_count(&self, room_id: u64) -> Result<usize, RepoError>;

    /// Moves the (room, user) last-read watermark to now.
    async fn update_last_read(&self, room_id: u64, user_id: u64) -> Result<(), RepoError>;

    async fn user_ids_by_room(&self, room_id: u64) -> Result<Vec<u64>, RepoError>;
}

/// Durable message storage.
#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Persists the message and returns the stored row with its assigned
    /// id and creation timestamp.
    async fn insert(&self, msg: NewChatMessage) -> Result<StoredChatMessage, RepoError>;

    /// Messages with id strictly greater than `after_id`, ascending by id.
    async fn get_by_room_after(
        &self,
        room_id: u64,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<StoredChatMessage>, RepoError>;

    /// Number of room members other than the sender whose last-read
    /// watermark is unset or earlier than `created_at`.
    async fn unread_count_snapshot(
        &self,
        room_id: u64,
        created_at: DateTime<Utc>,
        sender_id: u64,
    ) -> Result<usize, RepoError>;
}

/// Local user rows bridged from identity-provider claims.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Resolves claims to a local user: lookup by subject id first, then
    /// attach the subject to a row found by email, else create a new row.
    async fn get_or_create_from_claims(&self, claims: &Claims) -> Result<User, RepoError>;

    async fn get_by_id(&self, id: u64) -> Result<Option<User>, RepoError>;

    async fn update_status(&self, id: u64, status: UserStatus) -> Result<(), RepoError>;
}

/// Fire-and-forget push delivery for members who are not connected.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn send_to_room_members(
        &self,
        room_id: u64,
        exclude_user: u64,
        notification: PushNotification,
    );
}
