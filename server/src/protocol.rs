use serde::{Deserialize, Serialize};

/// Messages exchanged between clients and the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Message {
    // Client -> Server
    JoinRoom(JoinRequest),

    // Relayed unmodified between room members
    Sync(SyncMessage),
    NewLiveVideo(StreamAnnouncement),

    // Server -> Client
    InvalidRoom { message: String },
    #[serde(rename_all = "camelCase")]
    HostDisplaced { room_id: String },
    Error { message: String },
}

impl Message {
    pub fn invalid_room() -> Self {
        Message::InvalidRoom {
            message: "Invalid room. No host found.".to_string(),
        }
    }

    /// Room the message is addressed to, for the relayed kinds
    pub fn relay_room(&self) -> Option<&str> {
        match self {
            Message::Sync(sync) => Some(&sync.room_id),
            Message::NewLiveVideo(announcement) => Some(&announcement.room_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub is_host: bool,
}

/// Host playback position broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub room_id: String,
    pub time: f64,
    pub state: PlaybackTag,
    #[serde(default)]
    pub force_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackTag {
    Play,
    Pause,
}

/// Host switched to a replacement stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAnnouncement {
    pub room_id: String,
    pub video_id: String,
}
