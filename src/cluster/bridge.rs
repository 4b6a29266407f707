//! Inbound half of the cluster bridge.
//!
//! A single task per instance consumes fabric events, drops publications
//! tagged with the local instance id, and re-injects the rest into local
//! delivery through the hub's `inject_*` operations, which never publish
//! back to the fabric.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::PresencePayload;
use crate::ws::hub::Hub;
use super::{
    ClusterMessage, Fabric, FabricEvent, CHANNEL_PRESENCE, CHANNEL_ROOM_MESSAGE,
    CHANNEL_USER_MESSAGE,
};

pub struct ClusterBridge {
    hub: Arc<Hub>,
    fabric: Arc<dyn Fabric>,
    instance_id: Uuid,
}

impl ClusterBridge {
    pub fn new(hub: Arc<Hub>, fabric: Arc<dyn Fabric>, instance_id: Uuid) -> Self {
        Self {
            hub,
            fabric,
            instance_id,
        }
    }

    /// Spawns the subscriber task.
    pub fn spawn(hub: Arc<Hub>, fabric: Arc<dyn Fabric>, instance_id: Uuid) {
        tokio::spawn(Self::new(hub, fabric, instance_id).run());
    }

    /// Consumes fabric events until the fabric closes.
    pub async fn run(self) {
        let mut events = self.fabric.events();
        loop {
            match events.recv().await {
                Ok(event) => self.dispatch(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "cluster subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("cluster fabric closed, stopping bridge");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, event: FabricEvent) {
        let message = match ClusterMessage::decode(&event.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %event.channel, error = %e, "undecodable cluster message");
                return;
            }
        };

        // Our own publication coming back from the fabric.
        if message.origin == self.instance_id {
            return;
        }

        match event.channel.as_str() {
            CHANNEL_ROOM_MESSAGE => {
                if let Some(room_id) = message.room_id {
                    self.hub
                        .inject_room_message(room_id, message.payload_bytes())
                        .await;
                }
            }
            CHANNEL_USER_MESSAGE => {
                if let Some(user_id) = message.user_id {
                    self.hub
                        .inject_user_message(user_id, message.payload_bytes())
                        .await;
                }
            }
            CHANNEL_PRESENCE => {
                match serde_json::from_slice::<PresencePayload>(message.payload_bytes()) {
                    Ok(payload) => self.hub.inject_presence(payload).await,
                    Err(e) => warn!(error = %e, "undecodable presence payload"),
                }
            }
            other => debug!(channel = other, "ignoring message on unknown channel"),
        }
    }
}
