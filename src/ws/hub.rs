//! Per-instance connection registry and fan-out engine.
//!
//! The hub is the serialization point for membership mutations on one
//! instance. It owns three cooperating indices (all live connections,
//! connections per user, connections per room) behind a single `RwLock`,
//! so no reader can observe a connection in one index and not another.
//!
//! Fan-out snapshots the room under the shared lock, then attempts a
//! non-blocking enqueue per recipient. A recipient whose queue is full is
//! a slow consumer: it is evicted under the exclusive lock rather than
//! backpressured, and its user's `offline` transition is broadcast once
//! the per-user refcount reaches zero.
//!
//! Delivery ops come in two flavors with distinct code paths: the public
//! `broadcast_*`/`send_*` ops deliver locally *and* publish to the cluster
//! fabric, while the `inject_*` ops (fed by the cluster bridge) deliver
//! locally only, so a frame arriving from the fabric can never re-enter it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::cluster::ClusterPublisher;
use crate::protocol::{Envelope, PresencePayload, RoomInvitedPayload, ServerFrame};
use crate::repo::{RoomSummary, UserStatus};
use super::connection::{ConnectionHandle, ConnectionId};

struct ConnEntry {
    handle: Arc<ConnectionHandle>,
    /// Rooms this connection has joined on this instance.
    rooms: HashSet<u64>,
}

#[derive(Default)]
struct Indices {
    conns: HashMap<ConnectionId, ConnEntry>,
    by_user: HashMap<u64, HashSet<ConnectionId>>,
    by_room: HashMap<u64, HashSet<ConnectionId>>,
}

impl Indices {
    /// Removes the connection from every index. Returns the handle and
    /// whether this was the user's last local connection.
    fn remove(&mut self, id: ConnectionId) -> Option<(Arc<ConnectionHandle>, bool)> {
        let entry = self.conns.remove(&id)?;
        for room_id in &entry.rooms {
            let emptied = self
                .by_room
                .get_mut(room_id)
                .map(|members| {
                    members.remove(&id);
                    members.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                self.by_room.remove(room_id);
            }
        }
        let user_id = entry.handle.user_id;
        let went_offline = match self.by_user.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&id);
                if conns.is_empty() {
                    self.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        Some((entry.handle, went_offline))
    }
}

/// The per-instance authority over local connections.
pub struct Hub {
    indices: RwLock<Indices>,
    publisher: Option<ClusterPublisher>,
}

impl Hub {
    /// A hub without a cluster fabric; delivery stays instance-local.
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            publisher: None,
        }
    }

    /// A hub whose outbound broadcasts are also published to the fabric.
    pub fn with_publisher(publisher: ClusterPublisher) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            publisher: Some(publisher),
        }
    }

    /// Adds a connection to the registry. Returns `true` when this is the
    /// user's first local connection (an `online` transition).
    pub async fn register(&self, handle: Arc<ConnectionHandle>) -> bool {
        let mut ix = self.indices.write().await;
        let conns = ix.by_user.entry(handle.user_id).or_default();
        let came_online = conns.is_empty();
        conns.insert(handle.id);
        ix.conns.insert(
            handle.id,
            ConnEntry {
                handle,
                rooms: HashSet::new(),
            },
        );
        came_online
    }

    /// Removes a connection from every index and shuts its tasks down.
    /// Idempotent. Returns `true` when the user's last local connection is
    /// gone (an `offline` transition).
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.indices.write().await.remove(id);
        match removed {
            Some((handle, went_offline)) => {
                handle.shut_down();
                went_offline
            }
            None => false,
        }
    }

    /// Inserts the connection into the room's connectivity projection.
    pub async fn join_room(&self, id: ConnectionId, room_id: u64) -> bool {
        let mut ix = self.indices.write().await;
        let Some(entry) = ix.conns.get_mut(&id) else {
            return false;
        };
        entry.rooms.insert(room_id);
        ix.by_room.entry(room_id).or_default().insert(id);
        true
    }

    pub async fn leave_room(&self, id: ConnectionId, room_id: u64) {
        let mut ix = self.indices.write().await;
        if let Some(entry) = ix.conns.get_mut(&id) {
            entry.rooms.remove(&room_id);
        }
        let emptied = ix
            .by_room
            .get_mut(&room_id)
            .map(|members| {
                members.remove(&id);
                members.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            ix.by_room.remove(&room_id);
        }
    }

    pub async fn is_user_online_local(&self, user_id: u64) -> bool {
        self.indices.read().await.by_user.contains_key(&user_id)
    }

    /// User ids with at least one connection in the room on this instance.
    pub async fn local_room_user_ids(&self, room_id: u64) -> Vec<u64> {
        let ix = self.indices.read().await;
        ix.by_room
            .get(&room_id)
            .map(|members| {
                let mut ids: Vec<u64> = members
                    .iter()
                    .filter_map(|id| ix.conns.get(id))
                    .map(|entry| entry.handle.user_id)
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            })
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.indices.read().await.conns.len()
    }

    // -----------------------------------------------------------------
    // Outbound delivery: local fan-out plus cluster publish
    // -----------------------------------------------------------------

    /// Fans the frame out to the room locally and publishes it to the
    /// fabric. `exclude` skips one connection (the sender, for frame types
    /// whose policy excludes it).
    pub async fn broadcast_to_room(
        &self,
        room_id: u64,
        frame: &[u8],
        exclude: Option<ConnectionId>,
    ) {
        let slow = self.fan_out_room(room_id, frame, exclude).await;
        if let Some(publisher) = &self.publisher {
            publisher.publish_room_message(room_id, frame).await;
        }
        self.reap(slow).await;
    }

    /// Delivers the frame to every local connection of the user and
    /// publishes it for the user's connections on other instances.
    pub async fn send_to_user(&self, user_id: u64, frame: &[u8]) {
        let slow = self.deliver_to_user(user_id, frame).await;
        if let Some(publisher) = &self.publisher {
            publisher.publish_user_message(user_id, frame).await;
        }
        self.reap(slow).await;
    }

    /// Broadcasts a presence transition to every local connection except
    /// the subject user's own, and publishes it to the fabric.
    pub async fn broadcast_presence(&self, user_id: u64, status: UserStatus) {
        let slow = self.emit_presence(user_id, status).await;
        self.reap(slow).await;
    }

    /// Delivers a `room_invited` frame to the user, wherever connected.
    pub async fn send_room_invite(&self, user_id: u64, room: RoomSummary) {
        let envelope = Envelope::new(ServerFrame::RoomInvited(RoomInvitedPayload { room }));
        if let Ok(bytes) = envelope.encode() {
            self.send_to_user(user_id, &bytes).await;
        }
    }

    // -----------------------------------------------------------------
    // Inbound cluster injection: local delivery only, never re-published
    // -----------------------------------------------------------------

    /// Local fan-out of a frame that arrived from the fabric. Exclusion
    /// was already applied on the origin instance.
    pub async fn inject_room_message(&self, room_id: u64, frame: &[u8]) {
        let slow = self.fan_out_room(room_id, frame, None).await;
        self.reap(slow).await;
    }

    pub async fn inject_user_message(&self, user_id: u64, frame: &[u8]) {
        let slow = self.deliver_to_user(user_id, frame).await;
        self.reap(slow).await;
    }

    /// Rebroadcasts a presence transition from another instance to the
    /// local connections, except the subject user's own.
    pub async fn inject_presence(&self, payload: PresencePayload) {
        let envelope = Envelope::new(ServerFrame::PresenceUpdate(payload));
        let Ok(bytes) = envelope.encode() else { return };
        let slow = self.fan_out_except_user(payload.user_id, &bytes).await;
        self.reap(slow).await;
    }

    // -----------------------------------------------------------------
    // Fan-out internals
    // -----------------------------------------------------------------

    async fn fan_out_room(
        &self,
        room_id: u64,
        frame: &[u8],
        exclude: Option<ConnectionId>,
    ) -> Vec<Arc<ConnectionHandle>> {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let ix = self.indices.read().await;
            match ix.by_room.get(&room_id) {
                Some(members) => members
                    .iter()
                    .filter(|id| Some(**id) != exclude)
                    .filter_map(|id| ix.conns.get(id))
                    .map(|entry| entry.handle.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        send_all(targets, frame)
    }

    async fn deliver_to_user(&self, user_id: u64, frame: &[u8]) -> Vec<Arc<ConnectionHandle>> {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let ix = self.indices.read().await;
            match ix.by_user.get(&user_id) {
                Some(conns) => conns
                    .iter()
                    .filter_map(|id| ix.conns.get(id))
                    .map(|entry| entry.handle.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        send_all(targets, frame)
    }

    async fn fan_out_except_user(
        &self,
        user_id: u64,
        frame: &[u8],
    ) -> Vec<Arc<ConnectionHandle>> {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let ix = self.indices.read().await;
            ix.conns
                .values()
                .filter(|entry| entry.handle.user_id != user_id)
                .map(|entry| entry.handle.clone())
                .collect()
        };
        send_all(targets, frame)
    }

    /// Encodes and fans out one presence transition; returns newly slow
    /// connections for the caller to reap.
    async fn emit_presence(
        &self,
        user_id: u64,
        status: UserStatus,
    ) -> Vec<Arc<ConnectionHandle>> {
        let envelope = Envelope::new(ServerFrame::PresenceUpdate(PresencePayload {
            user_id,
            status,
        }));
        let Ok(bytes) = envelope.encode() else {
            return Vec::new();
        };
        let slow = self.fan_out_except_user(user_id, &bytes).await;
        if let Some(publisher) = &self.publisher {
            publisher.publish_presence(user_id, status).await;
        }
        slow
    }

    /// Evicts slow consumers under the exclusive lock. Offline broadcasts
    /// triggered by an eviction can themselves reveal more slow consumers,
    /// so this loops until the batch is empty.
    async fn reap(&self, mut slow: Vec<Arc<ConnectionHandle>>) {
        while !slow.is_empty() {
            let mut follow_up = Vec::new();
            for candidate in slow {
                let removed = self.indices.write().await.remove(candidate.id);
                let Some((handle, went_offline)) = removed else {
                    continue;
                };
                warn!(
                    conn_id = %handle.id,
                    user_id = handle.user_id,
                    "evicting slow consumer"
                );
                handle.shut_down();
                if went_offline {
                    follow_up.extend(
                        self.emit_presence(handle.user_id, UserStatus::Offline).await,
                    );
                }
            }
            slow = follow_up;
        }
    }

    #[cfg(test)]
    pub(crate) async fn assert_invariants(&self) {
        let ix = self.indices.read().await;
        for (room_id, members) in &ix.by_room {
            assert!(!members.is_empty(), "room {room_id} has an empty member set");
            for id in members {
                let entry = ix
                    .conns
                    .get(id)
                    .unwrap_or_else(|| panic!("conn {id} in by_room but not in conns"));
                assert!(
                    entry.rooms.contains(room_id),
                    "conn {id} missing room {room_id} in its own set"
                );
            }
        }
        for (user_id, conns) in &ix.by_user {
            assert!(!conns.is_empty(), "user {user_id} has an empty conn set");
            for id in conns {
                let entry = ix
                    .conns
                    .get(id)
                    .unwrap_or_else(|| panic!("conn {id} in by_user but not in conns"));
                assert_eq!(entry.handle.user_id, *user_id);
            }
        }
        for (id, entry) in &ix.conns {
            assert!(
                ix.by_user
                    .get(&entry.handle.user_id)
                    .is_some_and(|conns| conns.contains(id)),
                "conn {id} not indexed under its user"
            );
            for room_id in &entry.rooms {
                assert!(
                    ix.by_room.get(room_id).is_some_and(|m| m.contains(id)),
                    "conn {id} has room {room_id} but is not in by_room"
                );
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn send_all(targets: Vec<Arc<ConnectionHandle>>, frame: &[u8]) -> Vec<Arc<ConnectionHandle>> {
    targets
        .into_iter()
        .filter(|handle| !handle.try_send(frame.to_vec()))
        .collect()
}
