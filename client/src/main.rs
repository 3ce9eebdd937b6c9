mod catalog;
mod console;
mod constants;
mod error;
mod host;
mod joiner;
mod player;
mod protocol;
mod sync;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Duration,
};
use url::Url;

use catalog::{NoCatalog, StreamCatalog, YouTubeCatalog};
use console::{ConsoleCommand, HOST_HELP, JOINER_HELP};
use constants::{DEFAULT_DRIFT_TOLERANCE, DEFAULT_SYNC_INTERVAL_MS, LOCAL_WS_URL};
use host::HostSyncDriver;
use joiner::{DriftReconciler, JoinerSession, SessionEvent};
use player::{MediaSurface, VirtualPlayer};
use protocol::Message;
use sync::SyncClient;
use utils::{format_time, generate_room_code};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless shared-playback client")]
struct Cli {
    /// Rendezvous server WebSocket URL
    #[arg(long, env = "SYNCROOM_SERVER", default_value = LOCAL_WS_URL)]
    server: String,

    /// Seconds a joiner may drift from the host before seeking
    #[arg(long, env = "SYNCROOM_DRIFT_TOLERANCE", default_value_t = DEFAULT_DRIFT_TOLERANCE)]
    drift_tolerance: f64,

    /// Host broadcast period while playing
    #[arg(long, env = "SYNCROOM_SYNC_INTERVAL_MS", default_value_t = DEFAULT_SYNC_INTERVAL_MS)]
    sync_interval_ms: u64,

    /// YouTube Data API key used to find a replacement live stream
    #[arg(long, env = "YOUTUBE_API_KEY", hide_env_values = true)]
    youtube_api_key: Option<String>,

    /// Channel searched for a replacement live stream
    #[arg(long, env = "YOUTUBE_CHANNEL_ID")]
    youtube_channel_id: Option<String>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Create (or reclaim) a room and drive its playback
    Host {
        /// Room code to claim; a random one is generated otherwise
        #[arg(long)]
        room: Option<String>,
        /// Stream to load on start
        #[arg(long)]
        stream: Option<String>,
        /// Simulated stream length in seconds
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Mirror the playback of an existing room
    Join {
        room: String,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long)]
        duration: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncroom_client=debug,info".into()),
        )
        .init();

    let cli = Cli::parse();
    let sync = Arc::new(SyncClient::new());

    match &cli.mode {
        Mode::Host {
            room,
            stream,
            duration,
        } => {
            let room_id = room.clone().unwrap_or_else(generate_room_code);
            run_host(&cli, sync, room_id, stream.as_deref(), *duration).await
        }
        Mode::Join {
            room,
            stream,
            duration,
        } => run_joiner(&cli, sync, room, stream.as_deref(), *duration).await,
    }
}

async fn run_host(
    cli: &Cli,
    sync: Arc<SyncClient>,
    room_id: String,
    stream: Option<&str>,
    duration: Option<f64>,
) -> Result<()> {
    let (player, mut player_events) = VirtualPlayer::new(duration);
    let player = Arc::new(player);
    let driver = HostSyncDriver::new(
        room_id,
        Duration::from_millis(cli.sync_interval_ms.max(1)),
        sync.clone(),
        build_catalog(cli)?,
    );
    driver.attach_surface(player.clone());

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Message>();
    let mut disconnected = connect_with_retry(&sync, &cli.server, &inbound_tx).await;
    driver.register();
    println!("Hosting room {}", driver.room_id());
    println!("{HOST_HELP}");

    if let Some(stream) = stream {
        driver.load_stream(stream)?;
    }

    let clock = spawn_clock(player.clone());
    let mut lines = BufReader::new(stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(state) = player_events.recv() => {
                tracing::debug!("Local player is now {:?}", state);
                driver.on_state_change(state);
            }
            Some(msg) = inbound_rx.recv() => match msg {
                Message::HostDisplaced { room_id } => {
                    tracing::warn!("Another host took over room {}; this client no longer owns it", room_id);
                }
                Message::Error { message } => tracing::warn!("Server error: {}", message),
                other => tracing::debug!("Ignoring {:?}", other),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => host_command(&driver, &player, &sync, command),
                    Err(e) => println!("{e}\n{HOST_HELP}"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = &mut disconnected => {
                sync.mark_disconnected();
                tracing::warn!("Lost connection to sync server, reconnecting");
                disconnected = connect_with_retry(&sync, &cli.server, &inbound_tx).await;
                driver.register();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    clock.abort();
    Ok(())
}

fn host_command(driver: &HostSyncDriver, player: &VirtualPlayer, sync: &SyncClient, command: ConsoleCommand) {
    let result = match command {
        ConsoleCommand::Play => player.play(),
        ConsoleCommand::Pause => player.pause(),
        ConsoleCommand::Seek(timestamp) => player.seek(timestamp),
        ConsoleCommand::Load(stream_id) => driver.load_stream(&stream_id).map_err(|e| e.to_string()),
        ConsoleCommand::End => player.finish(),
        ConsoleCommand::ForceSync => {
            driver.force_sync();
            Ok(())
        }
        ConsoleCommand::Status => {
            print_status(Some(driver.room_id()), player, sync);
            Ok(())
        }
        ConsoleCommand::Join(_) => Err("join is only available to joiners".to_string()),
        ConsoleCommand::Quit => Ok(()),
    };

    if let Err(e) = result {
        println!("Playback error: {e}");
    }
}

async fn run_joiner(
    cli: &Cli,
    sync: Arc<SyncClient>,
    room_id: &str,
    stream: Option<&str>,
    duration: Option<f64>,
) -> Result<()> {
    let (player, mut player_events) = VirtualPlayer::new(duration);
    let player = Arc::new(player);
    if let Some(stream) = stream {
        player.load(stream).map_err(anyhow::Error::msg)?;
    }

    let mut session = JoinerSession::new(DriftReconciler::new(cli.drift_tolerance), sync.clone());
    session.attach_surface(player.clone());

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Message>();
    let mut disconnected = connect_with_retry(&sync, &cli.server, &inbound_tx).await;
    session.join(room_id)?;
    println!(
        "Joining room {} (drift tolerance {:.2}s)",
        room_id,
        cli.drift_tolerance
    );
    println!("{JOINER_HELP}");

    let clock = spawn_clock(player.clone());
    let mut lines = BufReader::new(stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(state) = player_events.recv() => {
                tracing::debug!("Local player is now {:?}", state);
            }
            Some(msg) = inbound_rx.recv() => match session.handle_message(msg) {
                SessionEvent::RoomRejected(message) => {
                    println!("{message} Enter another room with `join <room>`.");
                }
                SessionEvent::StreamChanged(stream_id) => println!("Host switched to stream {stream_id}"),
                SessionEvent::Synced(correction) if correction.seeked => {
                    tracing::info!(
                        "Corrected drift of {:?}s (state changed: {})",
                        correction.drift,
                        correction.state_changed
                    );
                }
                SessionEvent::Synced(_) | SessionEvent::Ignored => {}
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(ConsoleCommand::Join(room_id)) => {
                        if let Err(e) = session.join(&room_id) {
                            println!("{e}");
                        }
                    }
                    Ok(ConsoleCommand::Status) => {
                        println!("phase={:?}", session.phase());
                        print_status(session.room_id(), &player, &sync);
                    }
                    Ok(_) => println!("Playback follows the host\n{JOINER_HELP}"),
                    Err(e) => println!("{e}\n{JOINER_HELP}"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = &mut disconnected => {
                sync.mark_disconnected();
                tracing::warn!("Lost connection to sync server, reconnecting");
                disconnected = connect_with_retry(&sync, &cli.server, &inbound_tx).await;
                if let Err(e) = session.rejoin() {
                    tracing::warn!("Failed to rejoin: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    clock.abort();
    Ok(())
}

fn build_catalog(cli: &Cli) -> Result<Arc<dyn StreamCatalog>> {
    match (&cli.youtube_api_key, &cli.youtube_channel_id) {
        (Some(key), Some(channel)) => Ok(Arc::new(YouTubeCatalog::new(key.clone(), channel.clone())?)),
        _ => {
            tracing::info!("No YouTube catalog configured; ended streams will not be replaced");
            Ok(Arc::new(NoCatalog))
        }
    }
}

/// Drives the virtual player's end-of-stream detection
fn spawn_clock(player: Arc<VirtualPlayer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            player.tick();
        }
    })
}

fn print_status(room_id: Option<&str>, player: &VirtualPlayer, sync: &SyncClient) {
    let status = sync.status();
    let position = player
        .position()
        .map(format_time)
        .unwrap_or_else(|_| "--:--".to_string());
    println!(
        "room={} stream={} state={:?} position={} rtt={} sent={} received={}",
        room_id.unwrap_or("-"),
        player.stream_id().unwrap_or_else(|| "-".to_string()),
        player.state(),
        position,
        status
            .rtt
            .map(|rtt| format!("{}ms", rtt.as_millis()))
            .unwrap_or_else(|| "-".to_string()),
        status.sent.messages,
        status.received.messages,
    );
    println!(
        "link={} up={} reconnects={} bytes={}/{} last_message={}",
        status.endpoint.as_deref().unwrap_or("-"),
        status
            .connected_for
            .map(|up| format!("{}s", up.as_secs()))
            .unwrap_or_else(|| "-".to_string()),
        status.reconnects,
        status.sent.bytes,
        status.received.bytes,
        status
            .idle_for
            .map(|idle| format!("{:.1}s ago", idle.as_secs_f32()))
            .unwrap_or_else(|| "-".to_string()),
    );
}

async fn connect_with_retry(
    sync: &SyncClient,
    server_url: &str,
    inbound: &mpsc::UnboundedSender<Message>,
) -> oneshot::Receiver<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        warm_up_backend(server_url).await;

        let tx = inbound.clone();
        match sync
            .connect(server_url, move |msg| {
                let _ = tx.send(msg);
            })
            .await
        {
            Ok(disconnected) => {
                tracing::info!("Connected to sync server at {server_url}");
                sync.mark_connected(server_url);
                return disconnected;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to sync server at {server_url} (attempt {attempt}): {:#}",
                    e
                );
            }
        }

        let capped_attempt = attempt.min(6);
        tokio::time::sleep(Duration::from_secs(5 * capped_attempt as u64)).await;
    }
}

/// Hit the server's health endpoint so a sleeping deployment starts up
async fn warm_up_backend(ws_url: &str) {
    let Some(health_url) = health_url_from_ws(ws_url) else {
        return;
    };

    let client = reqwest::Client::new();
    match client
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => {
            tracing::debug!("Warmup request to {} returned {}", health_url, response.status());
        }
        Err(e) => {
            tracing::debug!("Warmup request to {} failed: {}", health_url, e);
        }
    }
}

fn health_url_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/healthz");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_from_ws() {
        assert_eq!(
            health_url_from_ws("ws://localhost:3005/ws").as_deref(),
            Some("http://localhost:3005/healthz")
        );
        assert_eq!(
            health_url_from_ws("wss://sync.example.com/ws?room=AB12").as_deref(),
            Some("https://sync.example.com/healthz")
        );
        assert_eq!(health_url_from_ws("http://example.com"), None);
        assert_eq!(health_url_from_ws("not a url"), None);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["syncroom-client", "join", "AB12"]).unwrap();
        assert_eq!(cli.sync_interval_ms, DEFAULT_SYNC_INTERVAL_MS);
        assert!(matches!(cli.mode, Mode::Join { ref room, .. } if room == "AB12"));
    }

    #[test]
    fn test_cli_host_options() {
        let cli = Cli::try_parse_from([
            "syncroom-client",
            "--drift-tolerance",
            "0.5",
            "host",
            "--room",
            "q7Zx",
            "--duration",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.drift_tolerance, 0.5);
        match cli.mode {
            Mode::Host { room, duration, stream } => {
                assert_eq!(room.as_deref(), Some("q7Zx"));
                assert_eq!(duration, Some(30.0));
                assert_eq!(stream, None);
            }
            other => panic!("unexpected mode: {:?}", other),
        }
    }
}
