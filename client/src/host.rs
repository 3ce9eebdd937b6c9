use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::catalog::StreamCatalog;
use crate::error::SyncError;
use crate::player::{MediaSurface, PlaybackState};
use crate::protocol::{JoinRequest, Message, PlaybackTag, StreamAnnouncement, SyncMessage};
use crate::sync::Outbound;

/// Publishes the host's local playback to the room.
///
/// Every operation is a no-op until a media surface is attached. Must be used
/// from within a tokio runtime: the periodic broadcast and the replacement
/// stream lookup run as spawned tasks.
#[derive(Clone)]
pub struct HostSyncDriver {
    inner: Arc<DriverState>,
}

struct DriverState {
    room_id: String,
    period: Duration,
    surface: Mutex<Option<Arc<dyn MediaSurface>>>,
    outbound: Arc<dyn Outbound>,
    catalog: Arc<dyn StreamCatalog>,
    /// At most one periodic broadcast is alive at a time
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl HostSyncDriver {
    pub fn new(
        room_id: String,
        period: Duration,
        outbound: Arc<dyn Outbound>,
        catalog: Arc<dyn StreamCatalog>,
    ) -> Self {
        Self {
            inner: Arc::new(DriverState {
                room_id,
                period,
                surface: Mutex::new(None),
                outbound,
                catalog,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn attach_surface(&self, surface: Arc<dyn MediaSurface>) {
        *self.inner.surface.lock() = Some(surface);
    }

    /// Announce this connection as the room's host
    pub fn register(&self) {
        self.inner.send(Message::JoinRoom(JoinRequest {
            room_id: self.inner.room_id.clone(),
            is_host: true,
        }));
    }

    /// Initialize the local surface with a stream picked by the user
    pub fn load_stream(&self, stream_id: &str) -> Result<(), SyncError> {
        let surface = self.inner.surface().ok_or(SyncError::NoMediaSurface)?;
        surface.load(stream_id).map_err(SyncError::Media)?;
        tracing::info!("Loaded stream {} for room {}", stream_id, self.inner.room_id);
        Ok(())
    }

    /// React to a state transition reported by the local media surface
    pub fn on_state_change(&self, state: PlaybackState) {
        if self.inner.surface().is_none() {
            return;
        }

        match state {
            PlaybackState::Playing => {
                tracing::debug!("Host playing");
                self.start_ticker();
                self.inner.emit(PlaybackTag::Play, false);
            }
            PlaybackState::Paused => {
                tracing::debug!("Host paused");
                self.inner.cancel_ticker();
                self.inner.emit(PlaybackTag::Pause, false);
            }
            PlaybackState::Ended => {
                tracing::info!("Host stream ended");
                self.inner.cancel_ticker();
                self.inner.emit(PlaybackTag::Pause, false);

                // The lookup has no cancellation: a late result is applied even
                // if the host has moved on in the meantime.
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.adopt_replacement().await });
            }
            PlaybackState::Idle => {
                self.inner.cancel_ticker();
            }
        }
    }

    /// Push an authoritative position that joiners apply regardless of drift
    pub fn force_sync(&self) {
        if let Some(surface) = self.inner.surface() {
            self.inner.emit(surface.state().tag(), true);
        }
    }

    fn start_ticker(&self) {
        let weak: Weak<DriverState> = Arc::downgrade(&self.inner);
        let period = self.inner.period;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.emit(PlaybackTag::Play, false),
                    None => break,
                }
            }
        });

        if let Some(previous) = self.inner.ticker.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl DriverState {
    fn surface(&self) -> Option<Arc<dyn MediaSurface>> {
        self.surface.lock().clone()
    }

    fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    fn send(&self, msg: Message) {
        if let Err(e) = self.outbound.send_message(msg) {
            tracing::warn!("Failed to send to room {}: {:#}", self.room_id, e);
        }
    }

    fn emit(&self, state: PlaybackTag, force_sync: bool) {
        let Some(surface) = self.surface() else {
            return;
        };
        let time = match surface.position() {
            Ok(time) => time,
            Err(e) => {
                tracing::debug!("Skipping sync, position unavailable: {}", e);
                return;
            }
        };

        if force_sync {
            tracing::info!("Force sync sent: {:.3}s", time);
        }
        self.send(Message::Sync(SyncMessage {
            room_id: self.room_id.clone(),
            time,
            state,
            force_sync,
        }));
    }

    async fn adopt_replacement(&self) {
        let Some(video_id) = self.catalog.fetch_replacement().await else {
            tracing::info!(
                "Room {} stays idle: {}",
                self.room_id,
                SyncError::ReplacementStreamUnavailable
            );
            return;
        };
        let Some(surface) = self.surface() else {
            return;
        };

        if let Err(e) = surface.load(&video_id) {
            tracing::warn!("Failed to load replacement stream {}: {}", video_id, e);
            return;
        }
        tracing::info!("New live video found: {}", video_id);
        self.send(Message::NewLiveVideo(StreamAnnouncement {
            room_id: self.room_id.clone(),
            video_id,
        }));
    }
}

impl Drop for DriverState {
    fn drop(&mut self) {
        self.cancel_ticker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::FixedCatalog;
    use crate::player::testing::ScriptedSurface;
    use tokio::sync::mpsc;

    fn driver(
        catalog: Option<&str>,
    ) -> (HostSyncDriver, Arc<ScriptedSurface>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = HostSyncDriver::new(
            "AB12".to_string(),
            Duration::from_millis(200),
            Arc::new(tx),
            Arc::new(FixedCatalog(catalog.map(str::to_string))),
        );
        let surface = Arc::new(ScriptedSurface::new(0.0, PlaybackState::Paused));
        driver.attach_surface(surface.clone());
        (driver, surface, rx)
    }

    fn expect_sync(msg: Message) -> SyncMessage {
        match msg {
            Message::Sync(sync) => sync,
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_announces_host() {
        let (driver, _surface, mut rx) = driver(None);
        driver.register();
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::JoinRoom(JoinRequest {
                room_id: "AB12".to_string(),
                is_host: true,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_emits_immediately_then_periodically() {
        let (driver, surface, mut rx) = driver(None);
        surface.set_position(5.0);
        let started = Instant::now();

        driver.on_state_change(PlaybackState::Playing);
        let first = expect_sync(rx.try_recv().unwrap());
        assert_eq!(first.time, 5.0);
        assert_eq!(first.state, PlaybackTag::Play);
        assert!(!first.force_sync);

        surface.set_position(5.2);
        let tick = expect_sync(rx.recv().await.unwrap());
        assert_eq!(tick.time, 5.2);
        assert_eq!(tick.state, PlaybackTag::Play);
        assert_eq!(started.elapsed(), Duration::from_millis(200));

        expect_sync(rx.recv().await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_ticker_and_emits_once() {
        let (driver, surface, mut rx) = driver(None);
        driver.on_state_change(PlaybackState::Playing);
        rx.try_recv().unwrap();

        surface.set_position(7.5);
        driver.on_state_change(PlaybackState::Paused);
        let paused = expect_sync(rx.try_recv().unwrap());
        assert_eq!(paused.state, PlaybackTag::Pause);
        assert_eq!(paused.time, 7.5);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaying_keeps_a_single_ticker() {
        let (driver, _surface, mut rx) = driver(None);
        driver.on_state_change(PlaybackState::Playing);
        driver.on_state_change(PlaybackState::Playing);
        driver.on_state_change(PlaybackState::Playing);
        for _ in 0..3 {
            rx.try_recv().unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let ticks = std::iter::from_fn(|| rx.try_recv().ok()).count();
        assert_eq!(ticks, 5);
    }

    #[tokio::test]
    async fn test_ended_announces_replacement() {
        let (driver, surface, mut rx) = driver(Some("live42"));
        driver.on_state_change(PlaybackState::Ended);

        let ended = expect_sync(rx.recv().await.unwrap());
        assert_eq!(ended.state, PlaybackTag::Pause);

        let announce = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            announce,
            Message::NewLiveVideo(StreamAnnouncement {
                room_id: "AB12".to_string(),
                video_id: "live42".to_string(),
            })
        );
        assert_eq!(surface.calls().loads, vec!["live42".to_string()]);
    }

    #[tokio::test]
    async fn test_ended_without_replacement_stays_idle() {
        let (driver, surface, mut rx) = driver(None);
        driver.on_state_change(PlaybackState::Ended);
        expect_sync(rx.recv().await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(surface.calls().loads.is_empty());
    }

    #[tokio::test]
    async fn test_force_sync_uses_current_state() {
        let (driver, surface, mut rx) = driver(None);
        surface.set_position(42.0);

        driver.force_sync();
        let forced = expect_sync(rx.try_recv().unwrap());
        assert!(forced.force_sync);
        assert_eq!(forced.time, 42.0);
        assert_eq!(forced.state, PlaybackTag::Pause);
    }

    #[tokio::test]
    async fn test_no_surface_is_a_no_op() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = HostSyncDriver::new(
            "AB12".to_string(),
            Duration::from_millis(200),
            Arc::new(tx),
            Arc::new(FixedCatalog(Some("x".into()))),
        );

        driver.on_state_change(PlaybackState::Playing);
        driver.on_state_change(PlaybackState::Ended);
        driver.force_sync();
        assert_eq!(driver.load_stream("abc"), Err(SyncError::NoMediaSurface));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
