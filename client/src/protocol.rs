use serde::{Deserialize, Serialize};

/// Messages sent between client and server (must match server protocol)
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub is_host: bool,
}

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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAnnouncement {
    pub room_id: String,
    pub video_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_relayed_sync() {
        let text = r#"{"type":"sync","payload":{"roomId":"AB12","time":10.0,"state":"play","forceSync":true}}"#;
        assert_eq!(
            serde_json::from_str::<Message>(text).unwrap(),
            Message::Sync(SyncMessage {
                room_id: "AB12".to_string(),
                time: 10.0,
                state: PlaybackTag::Play,
                force_sync: true,
            })
        );
    }

    #[test]
    fn test_parses_invalid_room_notice() {
        let text = r#"{"type":"invalidRoom","payload":{"message":"Invalid room. No host found."}}"#;
        assert!(matches!(
            serde_json::from_str::<Message>(text).unwrap(),
            Message::InvalidRoom { .. }
        ));
    }

    #[test]
    fn test_join_request_serialization() {
        let msg = Message::JoinRoom(JoinRequest {
            room_id: "q7Zx".to_string(),
            is_host: false,
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"joinRoom","payload":{"roomId":"q7Zx","isHost":false}}"#
        );
    }
}
