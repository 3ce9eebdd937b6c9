use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("room {0} has no host")]
    RoomNotFound(String),

    #[error("no replacement stream available")]
    ReplacementStreamUnavailable,

    #[error("media surface not initialized")]
    NoMediaSurface,

    #[error("media error: {0}")]
    Media(String),
}
