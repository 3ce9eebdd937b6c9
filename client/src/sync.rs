use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::{sleep, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::constants::KEEPALIVE_INTERVAL_SECS;
use crate::protocol::{JoinRequest, Message};

/// Anything the sync core can hand an outbound message to
pub trait Outbound: Send + Sync {
    fn send_message(&self, msg: Message) -> Result<()>;
}

impl Outbound for mpsc::UnboundedSender<Message> {
    fn send_message(&self, msg: Message) -> Result<()> {
        self.send(msg).map_err(|_| anyhow!("Outbound channel closed"))
    }
}

/// WebSocket connection to the rendezvous server
///
/// Each successful `connect` opens a new link with its own epoch. Tasks
/// belonging to an older link can only ever tear down that link.
pub struct SyncClient {
    inner: Arc<SyncClientState>,
}

struct SyncClientState {
    link: Mutex<Option<Link>>,
    next_epoch: AtomicU64,
    stats: Mutex<LinkStats>,
    keepalive_period: Duration,
}

/// One open socket plus the tasks that serve it
struct Link {
    epoch: u64,
    tx: mpsc::UnboundedSender<WsMessage>,
    /// Nonce and send time of the ping awaiting its pong
    pending_ping: Option<(u64, Instant)>,
    tasks: Vec<AbortHandle>,
}

impl Link {
    fn shut_down(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    pub bytes: u64,
    pub messages: u64,
}

impl Traffic {
    fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.messages += 1;
    }
}

#[derive(Default)]
struct LinkStats {
    sent: Traffic,
    received: Traffic,
    last_activity: Option<Instant>,
    rtt: Option<Duration>,
    reconnects: u32,
    connected: Option<(Instant, String)>,
}

/// Point-in-time view of the connection for the status command
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub sent: Traffic,
    pub received: Traffic,
    pub rtt: Option<Duration>,
    pub idle_for: Option<Duration>,
    pub connected_for: Option<Duration>,
    pub reconnects: u32,
    pub endpoint: Option<String>,
}

impl SyncClient {
    pub fn new() -> Self {
        Self::with_keepalive(Duration::from_secs(KEEPALIVE_INTERVAL_SECS))
    }

    fn with_keepalive(keepalive_period: Duration) -> Self {
        Self {
            inner: Arc::new(SyncClientState {
                link: Mutex::new(None),
                next_epoch: AtomicU64::new(0),
                stats: Mutex::new(LinkStats::default()),
                keepalive_period,
            }),
        }
    }

    /// Connect to the sync server, replacing any previous link.
    /// Returns a receiver that resolves when this link closes.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let epoch = self.inner.open_link(tx);

        let (closed_tx, closed_rx) = oneshot::channel();
        let closed = Arc::new(Mutex::new(Some(closed_tx)));

        let writer = {
            let inner = Arc::clone(&self.inner);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
                inner.close_link(epoch, &closed);
            })
        };

        let handler = Arc::new(on_message);
        let reader = {
            let inner = Arc::clone(&self.inner);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(frame) = ws_receiver.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            inner.record_received(text.len());
                            match serde_json::from_str::<Message>(&text) {
                                Ok(parsed) => handler(parsed),
                                Err(e) => tracing::debug!("Ignoring undecodable frame: {}", e),
                            }
                        }
                        Ok(WsMessage::Pong(payload)) => inner.on_pong(epoch, &payload),
                        Ok(WsMessage::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                inner.close_link(epoch, &closed);
            })
        };

        let keepalive = self.inner.spawn_keepalive(epoch);
        self.inner.adopt_tasks(
            epoch,
            [writer.abort_handle(), reader.abort_handle(), keepalive.abort_handle()],
        );
        Ok(closed_rx)
    }

    pub fn mark_connected(&self, label: &str) {
        self.inner.stats.lock().connected = Some((Instant::now(), label.to_string()));
    }

    pub fn mark_disconnected(&self) {
        let mut stats = self.inner.stats.lock();
        stats.connected = None;
        stats.reconnects += 1;
    }

    pub fn status(&self) -> LinkStatus {
        let stats = self.inner.stats.lock();
        LinkStatus {
            sent: stats.sent,
            received: stats.received,
            rtt: stats.rtt,
            idle_for: stats.last_activity.map(|at| at.elapsed()),
            connected_for: stats.connected.as_ref().map(|(since, _)| since.elapsed()),
            reconnects: stats.reconnects,
            endpoint: stats.connected.as_ref().map(|(_, label)| label.clone()),
        }
    }

    /// Register as host of `room_id`, or attempt to join it
    pub fn join_room(&self, room_id: String, is_host: bool) -> Result<()> {
        self.queue(Message::JoinRoom(JoinRequest { room_id, is_host }))
    }

    fn queue(&self, msg: Message) -> Result<()> {
        let json = serde_json::to_string(&msg).context("Failed to serialize message")?;
        let tx = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.tx.clone())
            .ok_or_else(|| anyhow!("Not connected to sync server"))?;
        let len = json.len();
        tx.send(WsMessage::Text(json.into()))
            .context("Failed to queue message to socket")?;
        self.inner.record_sent(len);
        Ok(())
    }
}

impl Outbound for SyncClient {
    fn send_message(&self, msg: Message) -> Result<()> {
        self.queue(msg)
    }
}

impl SyncClientState {
    /// Install a fresh link, shutting down whatever was there before
    fn open_link(&self, tx: mpsc::UnboundedSender<WsMessage>) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let previous = self.link.lock().replace(Link {
            epoch,
            tx,
            pending_ping: None,
            tasks: Vec::new(),
        });
        if let Some(previous) = previous {
            tracing::debug!("Replacing link {} with link {}", previous.epoch, epoch);
            previous.shut_down();
        }
        epoch
    }

    fn adopt_tasks(&self, epoch: u64, tasks: impl IntoIterator<Item = AbortHandle>) {
        let mut link = self.link.lock();
        match link.as_mut().filter(|link| link.epoch == epoch) {
            Some(link) => link.tasks.extend(tasks),
            // The link already closed before its tasks were registered
            None => tasks.into_iter().for_each(|task| task.abort()),
        }
    }

    /// Tear down link `epoch` if it is still current, then fire its close signal
    fn close_link(&self, epoch: u64, closed: &Mutex<Option<oneshot::Sender<()>>>) {
        let stale = {
            let mut link = self.link.lock();
            if link.as_ref().is_some_and(|link| link.epoch == epoch) {
                link.take()
            } else {
                None
            }
        };
        if let Some(tx) = closed.lock().take() {
            let _ = tx.send(());
        }
        if let Some(link) = stale {
            link.shut_down();
        }
    }

    fn spawn_keepalive(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let period = inner.keepalive_period;
            loop {
                sleep(period).await;
                if !inner.ping(epoch) {
                    break;
                }
            }
        })
    }

    /// Ping over link `epoch`; false once that link is gone
    fn ping(&self, epoch: u64) -> bool {
        let nonce = Uuid::new_v4().as_u128() as u64;
        let payload = nonce.to_le_bytes();
        {
            let mut link = self.link.lock();
            let Some(link) = link.as_mut().filter(|link| link.epoch == epoch) else {
                return false;
            };
            if link.tx.send(WsMessage::Ping(payload.to_vec().into())).is_err() {
                return false;
            }
            link.pending_ping = Some((nonce, Instant::now()));
        }
        self.record_sent(payload.len());
        true
    }

    fn on_pong(&self, epoch: u64, payload: &[u8]) {
        self.record_received(payload.len());
        let Some(nonce) = payload
            .get(..8)
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map(u64::from_le_bytes)
        else {
            return;
        };

        let rtt = {
            let mut link = self.link.lock();
            match link.as_mut().filter(|link| link.epoch == epoch) {
                Some(link) => match link.pending_ping {
                    Some((pending, sent)) if pending == nonce => {
                        link.pending_ping = None;
                        Some(sent.elapsed())
                    }
                    _ => None,
                },
                None => None,
            }
        };
        if rtt.is_some() {
            self.stats.lock().rtt = rtt;
        }
    }

    fn record_sent(&self, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.sent.record(bytes);
        stats.last_activity = Some(Instant::now());
    }

    fn record_received(&self, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.received.record(bytes);
        stats.last_activity = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pings(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> usize {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|frame| matches!(frame, WsMessage::Ping(_)))
            .count()
    }

    /// Stand in for `connect` without a socket: open a link and start its keepalive
    fn open(client: &SyncClient) -> (u64, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = client.inner.open_link(tx);
        let keepalive = client.inner.spawn_keepalive(epoch);
        client.inner.adopt_tasks(epoch, [keepalive.abort_handle()]);
        (epoch, rx)
    }

    fn pending_nonce(client: &SyncClient) -> Option<u64> {
        client
            .inner
            .link
            .lock()
            .as_ref()
            .and_then(|link| link.pending_ping)
            .map(|(nonce, _)| nonce)
    }

    #[test]
    fn test_send_without_connection_fails() {
        let client = SyncClient::new();
        assert!(client.join_room("AB12".into(), true).is_err());
        assert_eq!(client.status().sent, Traffic::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_leaves_a_single_keepalive() {
        let client = SyncClient::with_keepalive(Duration::from_secs(12));
        let (_, mut first) = open(&client);
        sleep(Duration::from_secs(5)).await;
        let (_, mut second) = open(&client);

        sleep(Duration::from_millis(12_500)).await;
        assert_eq!(pings(&mut first), 0);
        assert_eq!(pings(&mut second), 1);

        sleep(Duration::from_secs(12)).await;
        assert_eq!(pings(&mut second), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_close_keeps_current_link() {
        let client = SyncClient::with_keepalive(Duration::from_secs(12));
        let (old, _first) = open(&client);
        let (_, mut second) = open(&client);

        let (closed_tx, mut closed_rx) = oneshot::channel();
        client.inner.close_link(old, &Mutex::new(Some(closed_tx)));
        assert!(closed_rx.try_recv().is_ok());

        client.join_room("AB12".into(), false).unwrap();
        assert!(matches!(second.try_recv().unwrap(), WsMessage::Text(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_records_rtt_for_current_link_only() {
        let client = SyncClient::with_keepalive(Duration::from_secs(1));
        let (epoch, mut rx) = open(&client);
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(pings(&mut rx), 1);
        let nonce = pending_nonce(&client).unwrap();

        client.inner.on_pong(epoch, &nonce.wrapping_add(1).to_le_bytes());
        client.inner.on_pong(epoch + 1, &nonce.to_le_bytes());
        assert!(client.status().rtt.is_none());

        sleep(Duration::from_millis(40)).await;
        client.inner.on_pong(epoch, &nonce.to_le_bytes());
        let status = client.status();
        assert_eq!(status.rtt, Some(Duration::from_millis(140)));
        assert_eq!(status.received.messages, 3);
        assert!(pending_nonce(&client).is_none());
    }

    #[test]
    fn test_connection_marks() {
        let client = SyncClient::new();
        client.mark_connected("local");
        let status = client.status();
        assert_eq!(status.endpoint.as_deref(), Some("local"));
        assert!(status.connected_for.is_some());

        client.mark_disconnected();
        let status = client.status();
        assert!(status.connected_for.is_none());
        assert_eq!(status.reconnects, 1);
    }

    #[test]
    fn test_channel_outbound() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg = Message::Error {
            message: "x".into(),
        };
        tx.send_message(msg.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), msg);
    }
}
