//! Cross-instance pub/sub bridge.
//!
//! Every instance publishes its outbound broadcasts to a shared fabric and
//! subscribes to the same three channels, so the cluster behaves as one
//! logical broker. Publications are tagged with the origin instance id;
//! the subscriber side drops messages it published itself, which is the
//! only dedup the fabric is asked for. Delivery is at-least-once and
//! best-effort: publish failures are logged, never retried.

pub mod bridge;
pub mod memory;
pub mod mqtt;

pub use bridge::ClusterBridge;
pub use memory::InProcessFabric;
pub use mqtt::{MqttConfig, MqttFabric};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::PresencePayload;
use crate::repo::UserStatus;

pub const CHANNEL_ROOM_MESSAGE: &str = "room:message";
pub const CHANNEL_USER_MESSAGE: &str = "user:message";
pub const CHANNEL_PRESENCE: &str = "presence";

/// Every channel an instance subscribes to.
pub const CHANNELS: [&str; 3] = [CHANNEL_ROOM_MESSAGE, CHANNEL_USER_MESSAGE, CHANNEL_PRESENCE];

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("subscribe error: {0}")]
    Subscribe(String),
    #[error("invalid cluster message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMessageKind {
    RoomMessage,
    UserMessage,
    Presence,
}

/// Envelope carried on the fabric. The `payload` is the already-encoded
/// client-facing frame (or, for presence, the bare presence payload); the
/// `origin` tag never leaks into anything a client sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMessage {
    #[serde(rename = "type")]
    pub kind: ClusterMessageKind,
    pub origin: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    pub payload: Box<RawValue>,
}

impl ClusterMessage {
    pub fn room(origin: Uuid, room_id: u64, frame: &[u8]) -> Result<Self, ClusterError> {
        Ok(Self {
            kind: ClusterMessageKind::RoomMessage,
            origin,
            room_id: Some(room_id),
            user_id: None,
            payload: raw_payload(frame)?,
        })
    }

    pub fn user(origin: Uuid, user_id: u64, frame: &[u8]) -> Result<Self, ClusterError> {
        Ok(Self {
            kind: ClusterMessageKind::UserMessage,
            origin,
            room_id: None,
            user_id: Some(user_id),
            payload: raw_payload(frame)?,
        })
    }

    pub fn presence(origin: Uuid, payload: PresencePayload) -> Result<Self, ClusterError> {
        Ok(Self {
            kind: ClusterMessageKind::Presence,
            origin,
            room_id: None,
            user_id: Some(payload.user_id),
            payload: serde_json::value::to_raw_value(&payload)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClusterError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.get().as_bytes()
    }
}

fn raw_payload(frame: &[u8]) -> Result<Box<RawValue>, ClusterError> {
    let raw: Box<RawValue> = serde_json::from_slice(frame)?;
    Ok(raw)
}

/// A message received from the fabric, before cluster-envelope decoding.
#[derive(Debug, Clone)]
pub struct FabricEvent {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// The pub/sub transport. Implementations deliver every publication on a
/// subscribed channel to every subscriber, including the publisher itself.
#[async_trait]
pub trait Fabric: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ClusterError>;

    /// Receiver for all messages arriving on the subscribed channels.
    fn events(&self) -> broadcast::Receiver<FabricEvent>;
}

/// Outbound half of the bridge, owned by the hub. Failures are logged and
/// swallowed; local delivery never depends on the fabric.
#[derive(Clone)]
pub struct ClusterPublisher {
    fabric: Arc<dyn Fabric>,
    origin: Uuid,
}

impl ClusterPublisher {
    pub fn new(fabric: Arc<dyn Fabric>, origin: Uuid) -> Self {
        Self { fabric, origin }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub async fn publish_room_message(&self, room_id: u64, frame: &[u8]) {
        match ClusterMessage::room(self.origin, room_id, frame).and_then(|m| m.encode()) {
            Ok(bytes) => self.send(CHANNEL_ROOM_MESSAGE, bytes).await,
            Err(e) => warn!(room_id, error = %e, "failed to encode room publication"),
        }
    }

    pub async fn publish_user_message(&self, user_id: u64, frame: &[u8]) {
        match ClusterMessage::user(self.origin, user_id, frame).and_then(|m| m.encode()) {
            Ok(bytes) => self.send(CHANNEL_USER_MESSAGE, bytes).await,
            Err(e) => warn!(user_id, error = %e, "failed to encode user publication"),
        }
    }

    pub async fn publish_presence(&self, user_id: u64, status: UserStatus) {
        let payload = PresencePayload { user_id, status };
        match ClusterMessage::presence(self.origin, payload).and_then(|m| m.encode()) {
            Ok(bytes) => self.send(CHANNEL_PRESENCE, bytes).await,
            Err(e) => warn!(user_id, error = %e, "failed to encode presence publication"),
        }
    }

    async fn send(&self, channel: &str, bytes: Vec<u8>) {
        if let Err(e) = self.fabric.publish(channel, bytes).await {
            warn!(channel, error = %e, "cluster publish failed");
        }
    }
}
