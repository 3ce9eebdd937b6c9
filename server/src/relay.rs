use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::protocol::Message;
use crate::registry::{ConnectionId, RoomRegistry};

pub type ClientSender = mpsc::UnboundedSender<Message>;

/// Fans room traffic out to the other members of a broadcast group
#[derive(Clone)]
pub struct Relay {
    registry: RoomRegistry,
    senders: Arc<DashMap<ConnectionId, ClientSender>>,
    host_only: bool,
}

impl Relay {
    pub fn new(registry: RoomRegistry, host_only: bool) -> Self {
        Self {
            registry,
            senders: Arc::new(DashMap::new()),
            host_only,
        }
    }

    /// Register a connection's outbound queue
    pub fn attach(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(connection_id, tx);
        rx
    }

    pub fn detach(&self, connection_id: ConnectionId) {
        self.senders.remove(&connection_id);
    }

    pub fn send_to(&self, connection_id: ConnectionId, message: Message) -> bool {
        match self.senders.get(&connection_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }

    /// Forward `message` to every member of `room_id` except the sender.
    /// Returns how many connections it was queued for.
    pub fn relay(&self, sender: ConnectionId, room_id: &str, message: Message) -> Result<usize, SyncError> {
        if self.host_only && self.registry.lookup_host(room_id) != Some(sender) {
            return Err(SyncError::NotRoomHost(room_id.to_string()));
        }

        let mut delivered = 0;
        for member in self.registry.members(room_id) {
            if member == sender {
                continue;
            }
            if self.send_to(member, message.clone()) {
                delivered += 1;
            }
        }

        tracing::debug!(
            "Relayed {:?} from {} to {} members in room {}",
            message,
            sender,
            delivered,
            room_id
        );
        Ok(delivered)
    }
}
