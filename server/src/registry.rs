use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::SyncError;

const LOG_TAG: &str = "[SyncRoom Server]";

pub type ConnectionId = Uuid;

/// Room table shared by every connection handler.
///
/// Each operation runs to completion under a single lock, so a join can never
/// observe a host that is registered but not yet enrolled in its group.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    /// room_id -> host connection
    hosts: HashMap<String, ConnectionId>,
    /// room_id -> broadcast group
    groups: HashMap<String, HashSet<ConnectionId>>,
    /// connection -> the one group it belongs to
    memberships: HashMap<ConnectionId, String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `room_id` for `connection_id`. Last host wins: the previous host,
    /// if it was another connection, is returned so the caller can notify it.
    pub fn register_host(&self, room_id: &str, connection_id: ConnectionId) -> Option<ConnectionId> {
        let mut inner = self.inner.lock();
        inner.enroll(room_id, connection_id);
        let previous = inner.hosts.insert(room_id.to_string(), connection_id);
        let displaced = previous.filter(|prev| *prev != connection_id);

        match displaced {
            Some(prev) => tracing::warn!(
                "{LOG_TAG} Host {} took over room {} from {}",
                connection_id,
                room_id,
                prev
            ),
            None => tracing::info!(
                "{LOG_TAG} Host {} created and joined room {}",
                connection_id,
                room_id
            ),
        }
        displaced
    }

    pub fn lookup_host(&self, room_id: &str) -> Option<ConnectionId> {
        self.inner.lock().hosts.get(room_id).copied()
    }

    pub fn enroll_joiner(&self, room_id: &str, connection_id: ConnectionId) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        if !inner.hosts.contains_key(room_id) {
            tracing::info!(
                "{LOG_TAG} Joiner {} attempted to join invalid room {}",
                connection_id,
                room_id
            );
            return Err(SyncError::RoomNotFound(room_id.to_string()));
        }

        inner.enroll(room_id, connection_id);
        tracing::info!("{LOG_TAG} Joiner {} joined room {}", connection_id, room_id);
        Ok(())
    }

    /// Forget a disconnected connection. Returns the rooms it hosted, which no
    /// longer exist afterwards.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut inner = self.inner.lock();
        let orphaned: Vec<String> = inner
            .hosts
            .iter()
            .filter(|(_, host)| **host == connection_id)
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in &orphaned {
            inner.hosts.remove(room_id);
            tracing::info!(
                "{LOG_TAG} Room {} removed: {}",
                room_id,
                SyncError::StaleHost(room_id.clone())
            );
        }
        inner.leave_group(connection_id);
        orphaned
    }

    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .groups
            .get(room_id)
            .map(|group| group.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.inner.lock().memberships.get(&connection_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().hosts.len()
    }
}

impl RegistryInner {
    fn enroll(&mut self, room_id: &str, connection_id: ConnectionId) {
        if self.memberships.get(&connection_id).map(String::as_str) == Some(room_id) {
            return;
        }
        self.leave_group(connection_id);
        self.groups
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id);
        self.memberships.insert(connection_id, room_id.to_string());
    }

    /// Drop the connection from its current group. A host moving to another
    /// room gives up the room it was hosting.
    fn leave_group(&mut self, connection_id: ConnectionId) {
        let Some(room_id) = self.memberships.remove(&connection_id) else {
            return;
        };

        if let Some(group) = self.groups.get_mut(&room_id) {
            group.remove(&connection_id);
            if group.is_empty() {
                self.groups.remove(&room_id);
            }
        }

        if self.hosts.get(&room_id) == Some(&connection_id) {
            self.hosts.remove(&room_id);
            tracing::info!(
                "{LOG_TAG} Room {} removed because host {} left it",
                room_id,
                connection_id
            );
        }
    }
}
