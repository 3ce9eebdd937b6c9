use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Joiner targeted a code with no registered host
    #[error("room {0} has no host")]
    RoomNotFound(String),

    /// Host disconnected and left its room orphaned
    #[error("host of room {0} disconnected")]
    StaleHost(String),

    /// Relayed message from a member that does not own the room
    #[error("connection is not the host of room {0}")]
    NotRoomHost(String),
}
