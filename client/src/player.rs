use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::protocol::PlaybackTag;

/// Playback state of a media surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Ended,
}

impl PlaybackState {
    /// Wire tag broadcast for this state. Only `Playing` maps to "play".
    pub fn tag(self) -> PlaybackTag {
        match self {
            PlaybackState::Playing => PlaybackTag::Play,
            _ => PlaybackTag::Pause,
        }
    }
}

/// Playback capabilities the sync core drives
pub trait MediaSurface: Send + Sync {
    /// Load a stream, resetting playback to the start in the `Idle` state
    fn load(&self, stream_id: &str) -> Result<(), String>;

    fn play(&self) -> Result<(), String>;

    fn pause(&self) -> Result<(), String>;

    /// Seek to a specific timestamp (in seconds)
    fn seek(&self, timestamp: f64) -> Result<(), String>;

    /// Current playback position (in seconds)
    fn position(&self) -> Result<f64, String>;

    fn state(&self) -> PlaybackState;
}

/// Clock-driven stand-in for a real player.
///
/// Position advances with wall time while playing and the stream ends once
/// it reaches `duration`. Every state transition is published on the event
/// channel returned by [`VirtualPlayer::new`].
pub struct VirtualPlayer {
    inner: Mutex<PlayerInner>,
    events: mpsc::UnboundedSender<PlaybackState>,
}

struct PlayerInner {
    stream_id: Option<String>,
    state: PlaybackState,
    duration: Option<f64>,
    /// Position at `anchor_at`, or the frozen position when not playing
    anchor_position: f64,
    anchor_at: Option<Instant>,
}

impl PlayerInner {
    fn position(&self) -> f64 {
        let elapsed = self
            .anchor_at
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let position = self.anchor_position + elapsed;
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn freeze(&mut self) {
        self.anchor_position = self.position();
        self.anchor_at = None;
    }
}

impl VirtualPlayer {
    pub fn new(duration: Option<f64>) -> (Self, mpsc::UnboundedReceiver<PlaybackState>) {
        let (events, rx) = mpsc::unbounded_channel();
        let player = Self {
            inner: Mutex::new(PlayerInner {
                stream_id: None,
                state: PlaybackState::Idle,
                duration: duration.filter(|d| *d > 0.0),
                anchor_position: 0.0,
                anchor_at: None,
            }),
            events,
        };
        (player, rx)
    }

    pub fn stream_id(&self) -> Option<String> {
        self.inner.lock().stream_id.clone()
    }

    /// Transition to `Ended` once the clock reaches the stream's duration.
    /// Returns true when the transition happened on this call.
    pub fn tick(&self) -> bool {
        let mut inner = self.inner.lock();
        let reached_end = match inner.duration {
            Some(duration) => inner.state == PlaybackState::Playing && inner.position() >= duration,
            None => false,
        };
        if reached_end {
            inner.freeze();
            self.transition(&mut inner, PlaybackState::Ended);
        }
        reached_end
    }

    /// End the current stream immediately
    pub fn finish(&self) -> Result<(), String> {
        let mut inner = self.inner.lock();
        if inner.stream_id.is_none() {
            return Err("No stream loaded".to_string());
        }
        inner.freeze();
        if let Some(duration) = inner.duration {
            inner.anchor_position = duration;
        }
        self.transition(&mut inner, PlaybackState::Ended);
        Ok(())
    }

    fn transition(&self, inner: &mut PlayerInner, next: PlaybackState) {
        if inner.state != next {
            inner.state = next;
            let _ = self.events.send(next);
        }
    }
}

impl MediaSurface for VirtualPlayer {
    fn load(&self, stream_id: &str) -> Result<(), String> {
        if stream_id.trim().is_empty() {
            return Err("Empty stream id".to_string());
        }
        let mut inner = self.inner.lock();
        inner.stream_id = Some(stream_id.to_string());
        inner.anchor_position = 0.0;
        inner.anchor_at = None;
        inner.state = PlaybackState::Idle;
        let _ = self.events.send(PlaybackState::Idle);
        Ok(())
    }

    fn play(&self) -> Result<(), String> {
        let mut inner = self.inner.lock();
        if inner.stream_id.is_none() {
            return Err("No stream loaded".to_string());
        }
        if inner.state == PlaybackState::Playing {
            return Ok(());
        }
        if inner.state == PlaybackState::Ended {
            inner.anchor_position = 0.0;
        }
        inner.anchor_at = Some(Instant::now());
        self.transition(&mut inner, PlaybackState::Playing);
        Ok(())
    }

    fn pause(&self) -> Result<(), String> {
        let mut inner = self.inner.lock();
        match inner.state {
            PlaybackState::Playing => {
                inner.freeze();
                self.transition(&mut inner, PlaybackState::Paused);
            }
            PlaybackState::Idle if inner.stream_id.is_some() => {
                self.transition(&mut inner, PlaybackState::Paused);
            }
            _ => {}
        }
        Ok(())
    }

    fn seek(&self, timestamp: f64) -> Result<(), String> {
        if !timestamp.is_finite() {
            return Err("Invalid seek target".to_string());
        }
        let mut inner = self.inner.lock();
        if inner.stream_id.is_none() {
            return Err("No stream loaded".to_string());
        }
        let mut target = timestamp.max(0.0);
        if let Some(duration) = inner.duration {
            target = target.min(duration);
        }
        inner.anchor_position = target;
        if inner.state == PlaybackState::Playing {
            inner.anchor_at = Some(Instant::now());
        } else if inner.state == PlaybackState::Ended {
            self.transition(&mut inner, PlaybackState::Paused);
        }
        Ok(())
    }

    fn position(&self) -> Result<f64, String> {
        let inner = self.inner.lock();
        if inner.stream_id.is_none() {
            return Err("Position unavailable".to_string());
        }
        Ok(inner.position())
    }

    fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_tags() {
        assert_eq!(PlaybackState::Playing.tag(), PlaybackTag::Play);
        assert_eq!(PlaybackState::Paused.tag(), PlaybackTag::Pause);
        assert_eq!(PlaybackState::Ended.tag(), PlaybackTag::Pause);
        assert_eq!(PlaybackState::Idle.tag(), PlaybackTag::Pause);
    }

    #[test]
    fn test_play_requires_stream() {
        let (player, _events) = VirtualPlayer::new(None);
        assert!(player.play().is_err());
        assert!(player.position().is_err());
        assert_eq!(player.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_transitions_are_published_once() {
        let (player, mut events) = VirtualPlayer::new(None);
        player.load("abc").unwrap();
        player.play().unwrap();
        player.play().unwrap();
        player.pause().unwrap();

        assert_eq!(events.try_recv().unwrap(), PlaybackState::Idle);
        assert_eq!(events.try_recv().unwrap(), PlaybackState::Playing);
        assert_eq!(events.try_recv().unwrap(), PlaybackState::Paused);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_position_advances_while_playing() {
        let (player, _events) = VirtualPlayer::new(None);
        player.load("abc").unwrap();
        player.seek(5.0).unwrap();
        assert_eq!(player.position().unwrap(), 5.0);

        player.play().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        player.pause().unwrap();

        let paused_at = player.position().unwrap();
        assert!(paused_at >= 5.03);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(player.position().unwrap(), paused_at);
    }

    #[test]
    fn test_tick_ends_stream_at_duration() {
        let (player, mut events) = VirtualPlayer::new(Some(1.0));
        player.load("abc").unwrap();
        player.seek(0.99).unwrap();
        player.play().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(player.tick());
        assert!(!player.tick());
        assert_eq!(player.state(), PlaybackState::Ended);
        assert_eq!(player.position().unwrap(), 1.0);

        let published: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            published,
            vec![PlaybackState::Idle, PlaybackState::Playing, PlaybackState::Ended]
        );
    }

    #[test]
    fn test_load_resets_to_idle() {
        let (player, mut events) = VirtualPlayer::new(None);
        player.load("first").unwrap();
        player.play().unwrap();
        player.finish().unwrap();
        player.load("second").unwrap();

        assert_eq!(player.stream_id().as_deref(), Some("second"));
        assert_eq!(player.state(), PlaybackState::Idle);
        assert_eq!(player.position().unwrap(), 0.0);

        let published: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(published.last(), Some(&PlaybackState::Idle));
        assert_eq!(published.len(), 4);
    }
}
