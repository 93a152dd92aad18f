//! Room registry
//!
//! Authoritative mapping of room membership. Both directions of the
//! relation (room → members and connection → rooms) live behind one lock,
//! so every join, leave, and fan-out observes a consistent member set.
//! Fan-out enqueues while the lock is held, which makes the registry the
//! single sequencing point for every room.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::RoomPreset;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::server::{RoomInfo, ServerMessage};

/// Derive a room id from a display name ("Private Channel" → "private_channel")
pub fn slugify(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Result of a join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already a member
    pub newly_joined: bool,
    /// Member connections after the join
    pub member_count: usize,
}

/// Result of a leave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Member identifier the connection joined under
    pub member_id: String,
    /// Member connections left in the room
    pub member_count: usize,
    /// The room was deleted because it became empty
    pub room_deleted: bool,
}

/// Result of a fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Members the frame was queued for
    pub delivered: usize,
    /// Members detached because their queue was full or closed
    pub dropped: Vec<ConnectionId>,
}

struct Member {
    member_id: String,
    handle: ConnectionHandle,
}

struct Room {
    name: String,
    persistent: bool,
    members: HashMap<ConnectionId, Member>,
}

impl Room {
    fn new(name: impl Into<String>, persistent: bool) -> Self {
        Self {
            name: name.into(),
            persistent,
            members: HashMap::new(),
        }
    }

    fn info(&self, id: &str) -> RoomInfo {
        let mut members: Vec<String> = self
            .members
            .values()
            .map(|m| m.member_id.clone())
            .collect();
        members.sort();
        members.dedup();
        RoomInfo {
            id: id.to_string(),
            name: self.name.clone(),
            persistent: self.persistent,
            members,
            member_count: self.members.len(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Room>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl RegistryState {
    /// Detach a connection from one room, deleting the room if it empties
    fn remove_member(&mut self, connection_id: ConnectionId, room_id: &str) -> Option<LeaveOutcome> {
        if let Some(rooms) = self.memberships.get_mut(&connection_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.memberships.remove(&connection_id);
            }
        }

        let room = self.rooms.get_mut(room_id)?;
        let member = room.members.remove(&connection_id)?;
        let member_count = room.members.len();
        let room_deleted = member_count == 0 && !room.persistent;
        if room_deleted {
            self.rooms.remove(room_id);
            debug!("Room {} is empty, deleted", room_id);
        }

        Some(LeaveOutcome {
            member_id: member.member_id,
            member_count,
            room_deleted,
        })
    }

    /// Detach a connection from every room it belongs to
    fn remove_everywhere(&mut self, connection_id: ConnectionId) -> Vec<(String, String)> {
        let room_ids = self.memberships.remove(&connection_id).unwrap_or_default();
        let mut left = Vec::with_capacity(room_ids.len());
        for room_id in room_ids {
            match self.remove_member(connection_id, &room_id) {
                Some(outcome) => left.push((room_id, outcome.member_id)),
                None => warn!(
                    "Connection {} listed room {} but was not a member",
                    connection_id, room_id
                ),
            }
        }
        left
    }

    /// Rebuild a room empty when the two sides of the relation disagree
    fn repair(&mut self, room_id: &str, connection_id: ConnectionId) {
        let in_room = self
            .rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(&connection_id));
        let in_index = self
            .memberships
            .get(&connection_id)
            .is_some_and(|rooms| rooms.contains(room_id));
        if in_room == in_index {
            return;
        }

        error!(
            "Inconsistent membership for connection {} in room {}, rebuilding room",
            connection_id, room_id
        );
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.clear();
        }
        for rooms in self.memberships.values_mut() {
            rooms.remove(room_id);
        }
        self.memberships.retain(|_, rooms| !rooms.is_empty());
    }
}

/// Registry of rooms and their member connections
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Create a registry with persistent rooms
    pub fn with_presets(presets: &[RoomPreset]) -> Self {
        let mut state = RegistryState::default();
        for preset in presets {
            let room_id = preset.room_id();
            info!("Seeding room {} ({})", room_id, preset.name);
            state
                .rooms
                .insert(room_id, Room::new(preset.name.clone(), true));
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Add a connection to a room, creating the room on demand
    ///
    /// Joining a room twice has no further effect.
    pub async fn join(
        &self,
        room_id: &str,
        connection: &ConnectionHandle,
        member_id: &str,
    ) -> JoinOutcome {
        let connection_id = connection.id();
        let mut state = self.state.lock().await;
        state.repair(room_id, connection_id);

        let room = state
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!("Creating room {}", room_id);
                Room::new(room_id, false)
            });

        let newly_joined = !room.members.contains_key(&connection_id);
        if newly_joined {
            room.members.insert(
                connection_id,
                Member {
                    member_id: member_id.to_string(),
                    handle: connection.clone(),
                },
            );
        }
        let member_count = room.members.len();

        state
            .memberships
            .entry(connection_id)
            .or_default()
            .insert(room_id.to_string());

        if newly_joined {
            debug!(
                "Connection {} joined room {} as {} ({} members)",
                connection_id, room_id, member_id, member_count
            );
        }

        JoinOutcome {
            newly_joined,
            member_count,
        }
    }

    /// Remove a connection from one room
    ///
    /// Returns `None` when the connection was not a member.
    pub async fn leave(&self, connection_id: ConnectionId, room_id: &str) -> Option<LeaveOutcome> {
        let mut state = self.state.lock().await;
        state.remove_member(connection_id, room_id)
    }

    /// Remove a connection from every room
    ///
    /// Returns the `(room_id, member_id)` pairs that were left.
    pub async fn leave_all(&self, connection_id: ConnectionId) -> Vec<(String, String)> {
        let mut state = self.state.lock().await;
        state.remove_everywhere(connection_id)
    }

    /// Snapshot of the connections in a room
    pub async fn members_of(&self, room_id: &str) -> Vec<ConnectionHandle> {
        let state = self.state.lock().await;
        state
            .rooms
            .get(room_id)
            .map(|room| room.members.values().map(|m| m.handle.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the rooms a connection belongs to
    pub async fn rooms_of(&self, connection_id: ConnectionId) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .memberships
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Check whether a connection is a member of a room
    pub async fn is_member(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        let state = self.state.lock().await;
        state
            .rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(&connection_id))
    }

    /// Queue a frame for every member of a room
    ///
    /// Members whose queue is full or closed are detached from all rooms.
    /// An unknown or empty room delivers nothing.
    pub async fn broadcast(
        &self,
        room_id: &str,
        frame: &ServerMessage,
    ) -> serde_json::Result<Delivery> {
        let text = serde_json::to_string(frame)?;
        let mut state = self.state.lock().await;

        let Some(room) = state.rooms.get(room_id) else {
            debug!("Broadcast to unknown room {}, nothing to deliver", room_id);
            return Ok(Delivery::default());
        };

        let mut delivery = Delivery::default();
        for (connection_id, member) in &room.members {
            match member.handle.enqueue(Message::Text(text.clone())) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping connection {} from room {}: {}",
                        connection_id, room_id, e
                    );
                    delivery.dropped.push(*connection_id);
                }
            }
        }

        for connection_id in &delivery.dropped {
            state.remove_everywhere(*connection_id);
        }

        debug!(
            "Broadcast to room {}: {} delivered, {} dropped",
            room_id,
            delivery.delivered,
            delivery.dropped.len()
        );
        Ok(delivery)
    }

    /// List all rooms, sorted by id
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let state = self.state.lock().await;
        let mut rooms: Vec<RoomInfo> = state
            .rooms
            .iter()
            .map(|(id, room)| room.info(id))
            .collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }

    /// Number of rooms currently held
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
