use anyhow::Result;
use std::sync::Arc;

use crate::error::SyncError;
use crate::player::{MediaSurface, PlaybackState};
use crate::protocol::{JoinRequest, Message, PlaybackTag, StreamAnnouncement, SyncMessage};
use crate::sync::Outbound;
use crate::utils::format_time;

/// Decides how a joiner's surface follows a host sync message
#[derive(Debug, Clone, Copy)]
pub struct DriftReconciler {
    tolerance: f64,
}

/// What reconciling one sync message did to the local surface
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// Local position minus host position, `None` when it could not be read
    pub drift: Option<f64>,
    pub seeked: bool,
    pub state_changed: bool,
}

impl DriftReconciler {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.max(0.0),
        }
    }

    pub fn needs_seek(&self, local_position: f64, msg: &SyncMessage) -> bool {
        msg.force_sync || (local_position - msg.time).abs() > self.tolerance
    }

    pub fn reconcile(&self, surface: &dyn MediaSurface, msg: &SyncMessage) -> Result<Correction, SyncError> {
        let local = surface.position().ok();
        // An unreadable position counts as unbounded drift
        let seeked = match local {
            Some(position) => self.needs_seek(position, msg),
            None => true,
        };
        // The state rule still applies when the seek fails; the first error wins
        let seek_result = if seeked {
            surface.seek(msg.time).map(|()| {
                tracing::debug!(
                    "Seeked to {} (drift {:?}, forced: {})",
                    format_time(msg.time),
                    local.map(|position| position - msg.time),
                    msg.force_sync
                );
            })
        } else {
            Ok(())
        };

        let state_result = match (msg.state, surface.state()) {
            (PlaybackTag::Play, PlaybackState::Playing) => Ok(false),
            (PlaybackTag::Play, _) => surface.play().map(|()| true),
            (PlaybackTag::Pause, PlaybackState::Playing) => surface.pause().map(|()| true),
            (PlaybackTag::Pause, _) => Ok(false),
        };
        seek_result.map_err(SyncError::Media)?;
        let state_changed = state_result.map_err(SyncError::Media)?;

        Ok(Correction {
            drift: local.map(|position| position - msg.time),
            seeked,
            state_changed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPhase {
    ChoosingRoom,
    /// Join sent, waiting for either traffic from the room or a rejection
    Joining(String),
    Joined(String),
}

/// Outcome of one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Ignored,
    Synced(Correction),
    StreamChanged(String),
    RoomRejected(String),
}

/// Joiner side of a room: tracks the join and mirrors the host
pub struct JoinerSession {
    phase: JoinPhase,
    reconciler: DriftReconciler,
    surface: Option<Arc<dyn MediaSurface>>,
    outbound: Arc<dyn Outbound>,
}

impl JoinerSession {
    pub fn new(reconciler: DriftReconciler, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            phase: JoinPhase::ChoosingRoom,
            reconciler,
            surface: None,
            outbound,
        }
    }

    pub fn attach_surface(&mut self, surface: Arc<dyn MediaSurface>) {
        self.surface = Some(surface);
    }

    pub fn phase(&self) -> &JoinPhase {
        &self.phase
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.phase {
            JoinPhase::Joining(room_id) | JoinPhase::Joined(room_id) => Some(room_id),
            JoinPhase::ChoosingRoom => None,
        }
    }

    pub fn join(&mut self, room_id: &str) -> Result<()> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            anyhow::bail!("Please enter a room ID");
        }
        self.outbound.send_message(Message::JoinRoom(JoinRequest {
            room_id: room_id.to_string(),
            is_host: false,
        }))?;
        self.phase = JoinPhase::Joining(room_id.to_string());
        Ok(())
    }

    /// Re-send the join for the current room, e.g. after a reconnect
    pub fn rejoin(&mut self) -> Result<()> {
        match self.room_id().map(str::to_string) {
            Some(room_id) => self.join(&room_id),
            None => Ok(()),
        }
    }

    pub fn handle_message(&mut self, msg: Message) -> SessionEvent {
        match msg {
            Message::Sync(sync) => self.on_sync(&sync),
            Message::NewLiveVideo(announcement) => self.on_new_stream(announcement),
            Message::InvalidRoom { message } => self.on_invalid_room(message),
            _ => SessionEvent::Ignored,
        }
    }

    fn in_room(&self, room_id: &str) -> bool {
        self.room_id() == Some(room_id)
    }

    fn on_sync(&mut self, sync: &SyncMessage) -> SessionEvent {
        if !self.in_room(&sync.room_id) {
            return SessionEvent::Ignored;
        }
        if let JoinPhase::Joining(room_id) = &self.phase {
            tracing::info!("Joined room {}", room_id);
            self.phase = JoinPhase::Joined(room_id.clone());
        }

        let Some(surface) = self.surface.as_deref() else {
            return SessionEvent::Ignored;
        };
        match self.reconciler.reconcile(surface, sync) {
            Ok(correction) => SessionEvent::Synced(correction),
            Err(e) => {
                // Fires on every host tick while no stream is loaded
                tracing::debug!("Failed to apply sync: {}", e);
                SessionEvent::Ignored
            }
        }
    }

    fn on_new_stream(&mut self, announcement: StreamAnnouncement) -> SessionEvent {
        if !self.in_room(&announcement.room_id) || announcement.video_id.is_empty() {
            return SessionEvent::Ignored;
        }
        let Some(surface) = self.surface.as_deref() else {
            return SessionEvent::Ignored;
        };

        tracing::info!("Received new live video event: {}", announcement.video_id);
        match surface.load(&announcement.video_id) {
            Ok(()) => SessionEvent::StreamChanged(announcement.video_id),
            Err(e) => {
                tracing::warn!("Failed to load {}: {}", announcement.video_id, e);
                SessionEvent::Ignored
            }
        }
    }

    fn on_invalid_room(&mut self, message: String) -> SessionEvent {
        let Some(room_id) = self.room_id().map(str::to_string) else {
            return SessionEvent::Ignored;
        };
        tracing::warn!("{} ({})", message, SyncError::RoomNotFound(room_id));
        self.phase = JoinPhase::ChoosingRoom;
        SessionEvent::RoomRejected(message)
    }
}
