//! Room identifiers and the registry of joined rooms
//!
//! The registry outlives individual transports so rooms can be rejoined after
//! every reconnect. It is only cleared on full teardown.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Room type that uses its own join/leave commands
pub const CHAT_ROOM_TYPE: &str = "chat";

pub const JOIN_ROOM_EVENT: &str = "join_room";
pub const LEAVE_ROOM_EVENT: &str = "leave_room";
pub const CHAT_JOIN_ROOM_EVENT: &str = "chat:join_room";
pub const CHAT_LEAVE_ROOM_EVENT: &str = "chat:leave_room";

/// A server-side topic, canonically written `type:id`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Room {
    room_type: String,
    room_id: String,
}

/// Wire command for joining or leaving a room
#[derive(Debug, Clone, PartialEq)]
pub struct RoomCommand {
    pub event: &'static str,
    pub payload: Value,
}

impl Room {
    pub fn new(room_type: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            room_type: room_type.into(),
            room_id: room_id.into(),
        }
    }

    pub fn room_type(&self) -> &str {
        &self.room_type
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.room_type, self.room_id)
    }

    pub fn is_chat(&self) -> bool {
        self.room_type == CHAT_ROOM_TYPE
    }

    /// Chat rooms take the bare id under their own command; every other room
    /// sends the prefixed key under the generic command.
    pub fn join_command(&self) -> RoomCommand {
        if self.is_chat() {
            RoomCommand {
                event: CHAT_JOIN_ROOM_EVENT,
                payload: json!({ "roomId": self.room_id }),
            }
        } else {
            RoomCommand {
                event: JOIN_ROOM_EVENT,
                payload: json!({ "roomId": self.key() }),
            }
        }
    }

    pub fn leave_command(&self) -> RoomCommand {
        if self.is_chat() {
            RoomCommand {
                event: CHAT_LEAVE_ROOM_EVENT,
                payload: json!({ "roomId": self.room_id }),
            }
        } else {
            RoomCommand {
                event: LEAVE_ROOM_EVENT,
                payload: json!({ "roomId": self.key() }),
            }
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_type, self.room_id)
    }
}

/// Set of rooms to (re)join whenever a transport comes up
///
/// Keyed by the canonical `type:id` string, so two rooms that canonicalize the
/// same are one entry. Iteration is in key order.
#[derive(Debug, Default, Clone)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a room with the same key was already present
    pub fn insert(&mut self, room: Room) -> bool {
        let key = room.key();
        if self.rooms.contains_key(&key) {
            return false;
        }
        self.rooms.insert(key, room);
        true
    }

    /// Returns false if no room with the same key was present
    pub fn remove(&mut self, room: &Room) -> bool {
        self.rooms.remove(&room.key()).is_some()
    }

    pub fn contains(&self, room: &Room) -> bool {
        self.rooms.contains_key(&room.key())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn keys(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}
